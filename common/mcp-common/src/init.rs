//! Server initialization utilities
//!
//! Tracing setup plus the two ways a server is exposed: over the process's
//! stdio, or to any number of clients on a TCP listen address.

use rmcp::{ServerHandler, ServiceExt};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging for MCP servers
///
/// Logs go to stderr (stdout is reserved for the MCP protocol) without ANSI
/// colors. `RUST_LOG` filters as usual; the server crate itself logs at
/// `info`, or at `debug` when `debug` is set.
///
/// Set `LOG_FORMAT=json` for structured JSON output.
pub fn init_tracing(crate_name: &str, debug: bool) -> anyhow::Result<()> {
    let level = if debug { "debug" } else { "info" };
    let directive = format!("{}={}", crate_name, level);
    let filter = EnvFilter::from_default_env().add_directive(directive.parse()?);

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);

    if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .try_init()?;
    }

    Ok(())
}

/// Serve a single MCP session over stdin/stdout until the client goes away
pub async fn serve_stdio<S: ServerHandler>(server: S) -> anyhow::Result<()> {
    let service = server.serve(rmcp::transport::stdio()).await?;

    tracing::info!("Server running on stdio, waiting for requests...");

    service.waiting().await?;

    tracing::info!("Server shutting down");
    Ok(())
}

/// Accept MCP clients on `addr`, one session per connection
///
/// Every connection gets a clone of `server`, so state shared behind `Arc`s
/// is shared by all clients. Returns on Ctrl-C.
pub async fn serve_tcp<S>(server: S, addr: &str) -> anyhow::Result<()>
where
    S: ServerHandler + Clone,
{
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Listening for MCP clients");

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Server shutting down");
                return Ok(());
            }
        };

        let server = server.clone();
        tokio::spawn(async move {
            tracing::info!(%peer, "Client connected");
            match server.serve(stream).await {
                Ok(service) => {
                    if let Err(e) = service.waiting().await {
                        tracing::warn!(%peer, error = %e, "Session ended abnormally");
                    }
                }
                Err(e) => tracing::warn!(%peer, error = %e, "MCP handshake failed"),
            }
            tracing::info!(%peer, "Client disconnected");
        });
    }
}
