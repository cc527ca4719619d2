//! Model worker: reads its config payload from stdin, then alternates
//! between busy and idle cycles until interrupted.
//!
//! Stdout carries the control channel, so diagnostics go to stderr through
//! the logger.
use std::time::Duration;

use anyhow::Result;
use log::info;
use tokio::io::AsyncReadExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::sleep;

use dsup_channel::{write_message, Message};

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").ok().is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init();

    // The supervisor writes the whole payload, then closes the pipe.
    let mut payload = Vec::new();
    tokio::io::stdin().read_to_end(&mut payload).await?;
    let config: serde_json::Value = serde_json::from_slice(&payload).unwrap_or_default();
    info!("worker starting with config {}", config);

    let mut out = tokio::io::stdout();
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut cycle = 0u64;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                write_message(&mut out, &Message::Stdout("interrupted, exiting".into())).await?;
                break;
            }
            _ = sleep(Duration::from_secs(5)) => {
                cycle += 1;
                write_message(&mut out, &Message::Heartbeat).await?;
                if cycle % 2 == 1 {
                    write_message(&mut out, &Message::Busy).await?;
                    write_message(
                        &mut out,
                        &Message::Stdout(format!("processing batch {}", cycle)),
                    )
                    .await?;
                } else {
                    write_message(&mut out, &Message::Idle).await?;
                }
            }
        }
    }

    Ok(())
}
