//! Tracing subscriber setup.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Logging options collected from the CLI.
#[derive(Debug, Clone, Default)]
pub struct LogOptions<'a> {
    pub verbose: bool,
    pub json: bool,
    /// Also write a daily-rotated log file into this directory.
    pub dir: Option<&'a Path>,
}

fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "info,master_control=debug,tower_http=debug"
    } else {
        "info"
    }
}

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the process or buffered file output is lost.
pub fn init(opts: LogOptions<'_>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(opts.verbose)));

    let (file_writer, guard) = match opts.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "master-control.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let file_layer = file_writer.map(|writer| fmt::layer().json().with_writer(writer));
    let registry = tracing_subscriber::registry().with(filter).with(file_layer);

    if opts.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    }
    .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_levels() {
        assert_eq!(default_filter(false), "info");
        assert!(default_filter(true).contains("master_control=debug"));
    }
}
