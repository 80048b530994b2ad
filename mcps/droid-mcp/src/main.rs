//! Droid MCP server binary
//!
//! Usage:
//!   droid-mcp                                  # serve MCP on stdio
//!   droid-mcp --listen 127.0.0.1:7300          # serve MCP clients over TCP
//!   droid-mcp --device-id emulator-5554 --debug

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use droid_mcp::recognition::{Availability, StageKind};
use droid_mcp::{Config, DroidMcpServer};

#[derive(Parser)]
#[command(name = "droid-mcp")]
#[command(about = "MCP server for controlling Android devices over adb")]
struct Cli {
    /// Configuration file (default: ./droid-mcp.toml, then the user config dir)
    #[arg(long, env = "DROID_MCP_CONFIG")]
    config: Option<PathBuf>,

    /// Path to the adb executable
    #[arg(long, env = "ADB_PATH")]
    adb_path: Option<String>,

    /// Device used when a request does not name one
    #[arg(long, env = "ANDROID_SERIAL")]
    device_id: Option<String>,

    /// Serve MCP over TCP on this address instead of stdio
    #[arg(long, env = "DROID_MCP_LISTEN")]
    listen: Option<String>,

    /// Log at debug level
    #[arg(long, env = "DROID_MCP_DEBUG")]
    debug: bool,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(adb_path) = self.adb_path {
            config.bridge.adb_path = adb_path;
        }
        if let Some(device) = self.device_id {
            config.devices.fixed_device = Some(device);
        }
        if let Some(listen) = self.listen {
            config.server.listen = Some(listen);
        }
        if self.debug {
            config.logging.debug = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, source) = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    mcp_common::init_tracing("droid_mcp", config.logging.debug)?;
    match &source {
        Some(path) => info!(path = %path.display(), "loaded configuration"),
        None => info!("no configuration file found, using defaults"),
    }

    let server = DroidMcpServer::from_config(&config);
    let dispatcher = server.dispatcher();

    match dispatcher.registry().bridge().version().await {
        Ok(version) => info!(adb = %config.bridge.adb_path, %version, "adb available"),
        Err(e) => warn!(adb = %config.bridge.adb_path, error = %e, "adb not answering, device commands will fail until it is reachable"),
    }
    for stage in [StageKind::Ocr, StageKind::ImageMatch] {
        if let Availability::Unavailable(reason) = dispatcher.pipeline().availability(stage).await {
            warn!(stage = stage.name(), %reason, "recognition stage unavailable");
        }
    }
    match config.server.listen.as_deref() {
        Some(addr) => mcp_common::serve_tcp(server, addr).await,
        None => mcp_common::serve_stdio(server).await,
    }
}
