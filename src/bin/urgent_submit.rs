//! Ask a running pumpwatch daemon to analyze a token immediately.
//!
//! Usage: urgent_submit <token-address> [socket-path]

use anyhow::{bail, Result};
use pumpwatch::analysis::gateway::{parse_address, submit_urgent};
use pumpwatch::config::GatewaySettings;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let Some(address) = args.next() else {
        bail!("Usage: urgent_submit <token-address> [socket-path]");
    };
    let socket_path = args
        .next()
        .unwrap_or_else(|| GatewaySettings::default().socket_path);

    let Some(address) = parse_address(&address) else {
        bail!("{} is not a valid token address", address);
    };

    submit_urgent(&socket_path, &address).await?;
    println!("Submitted {} for urgent analysis", address);
    Ok(())
}
