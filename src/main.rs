//! mcp-native-host - native messaging entry point.
//!
//! Launched by the browser with the extension origin as its argument. Stdout
//! carries the native messaging protocol, so every log line goes to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mcp_native_host::bridge::Bridge;
use mcp_native_host::config::CliArgs;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "mcp_native_host=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    tracing::info!(
        origin = args.origin().unwrap_or("unknown"),
        "Starting mcp-native-host v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = args.into_config();
    let command = config.server.command.clone();
    Bridge::from_config(config)
        .run_stdio()
        .await
        .with_context(|| format!("MCP relay failed (server command `{command}`)"))?;

    tracing::info!("Host disconnected, exiting");
    Ok(())
}
