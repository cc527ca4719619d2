//! Worker that runs three cycles and then asks the supervisor not to
//! restart it by announcing a shutdown on the control channel.
use std::time::Duration;

use anyhow::Result;
use log::info;
use tokio::io::AsyncReadExt;
use tokio::time::sleep;

use dsup_channel::{write_message, Message};

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").ok().is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init();

    let mut payload = Vec::new();
    tokio::io::stdin().read_to_end(&mut payload).await?;
    info!("worker starting, {} byte payload", payload.len());

    let mut out = tokio::io::stdout();
    for cycle in 1..=3u32 {
        write_message(&mut out, &Message::Heartbeat).await?;
        write_message(&mut out, &Message::Stdout(format!("cycle {} of 3", cycle))).await?;
        sleep(Duration::from_secs(2)).await;
    }

    write_message(&mut out, &Message::Shutdown).await?;
    Ok(())
}
