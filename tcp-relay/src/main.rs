use std::io::IsTerminal;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use tcp_relay::{cli::Cli, Relay};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = cli.resolve_config().context("invalid relay configuration")?;

    let relay = Relay::bind(config).context("failed to start relay")?;
    let addr = relay.local_addr()?;
    // The address must stay the last token of the first line; tests parse it.
    info!("relay listening on {}", addr);
    info!(
        framing = %relay.config().framing,
        max_message_len = relay.config().max_message_len,
        "accepting connections"
    );

    relay.run_until_ctrl_c().await;
    Ok(())
}
