use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use master_control::config::MasterConfig;
use master_control::logging::{self, LogOptions};
use master_control::master::models::Role;

mod cmd;

#[derive(Parser)]
#[command(name = "master-control")]
#[command(version, about = "Single-flight agent runner with PKCE credential exchange")]
pub struct Cli {
    /// Path to master.toml (missing file means defaults)
    #[arg(short, long, global = true, env = "MASTER_CONFIG", default_value = "master.toml")]
    pub config: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit JSON log lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Also write daily-rotated JSON logs into this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the control-plane HTTP server
    Serve {
        /// Port to serve on (overrides config and MASTER_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (CORS permissive for a local admin UI)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database schema and exit
    InitDb,
    /// Create an operator account; the password is read from stdin
    AddOperator {
        #[arg(long)]
        email: String,

        /// admin or master
        #[arg(long, default_value = "master")]
        role: Role,

        #[arg(long)]
        name: Option<String>,
    },
    /// Print an argon2 PHC hash for a password read from stdin
    HashPassword,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone, Copy)]
pub enum ConfigCommands {
    /// Print the effective configuration (secrets omitted)
    Show,
    /// Report configuration warnings
    Validate,
}

fn load_config(cli: &Cli) -> Result<MasterConfig> {
    let mut config = MasterConfig::load_or_default(Some(&cli.config))?;
    config.apply_env();
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let _log_guard = logging::init(LogOptions {
        verbose: cli.verbose,
        json: cli.log_json,
        dir: cli.log_dir.as_deref(),
    })
    .context("Failed to initialize logging")?;

    match &cli.command {
        Commands::Serve { port, dev } => {
            let config = load_config(&cli)?;
            cmd::cmd_serve(config, *port, *dev).await?;
        }
        Commands::InitDb => cmd::cmd_init_db(&load_config(&cli)?)?,
        Commands::AddOperator { email, role, name } => {
            let config = load_config(&cli)?;
            let stdin = std::io::stdin();
            cmd::cmd_add_operator(&config, email, *role, name.as_deref(), stdin.lock())?;
        }
        Commands::HashPassword => cmd::cmd_hash_password(std::io::stdin().lock())?,
        Commands::Config { command } => {
            let config = load_config(&cli)?;
            cmd::cmd_config(&cli.config, &config, *command)?;
        }
    }

    Ok(())
}
