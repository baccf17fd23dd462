//! Control-plane server command: `master-control serve`.

use anyhow::Result;

use master_control::config::MasterConfig;

pub async fn cmd_serve(mut config: MasterConfig, port: Option<u16>, dev: bool) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if dev {
        config.server.dev = true;
    }

    master_control::master::server::start_server(config).await
}
