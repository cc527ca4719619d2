#![deny(missing_docs)]
//! Binary for the dsup(1) single worker process supervisor; for the library
//! use the [dsup-impl](https://docs.rs/dsup-impl) crate.
use std::{collections::HashMap, path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use clap::{App, Arg};
use log::info;
use serde::{Deserialize, Serialize};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{interval, Duration};

use dsup_impl::{Event, EventKind, EventSink, SupervisorBuilder, WorkerSpec};

/// Settings deserialized from the configuration file.
#[derive(Debug, Serialize, Deserialize)]
struct Settings {
    /// The worker to supervise.
    worker: RunWorker,
}

/// Worker process information.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RunWorker {
    /// Command for the process.
    command: String,
    /// Arguments for the process.
    args: Option<Vec<String>>,
    /// Environment variables for the process.
    envs: Option<HashMap<String, String>>,
    /// Working directory for the process.
    cwd: Option<PathBuf>,
    /// Config payload delivered on the worker's stdin.
    config: Option<toml::Value>,
    /// Suppress the local echo of supervisor log messages.
    silent: Option<bool>,
}

impl Into<WorkerSpec> for RunWorker {
    fn into(self) -> WorkerSpec {
        let mut spec = WorkerSpec::new(&self.command)
            .args(self.args.unwrap_or(Vec::new()))
            .envs(self.envs.unwrap_or(HashMap::new()));
        if let Some(cwd) = self.cwd {
            spec = spec.cwd(cwd);
        }
        if let Some(config) = self.config {
            spec = spec.config(toml_to_json(config));
        }
        spec
    }
}

/// Convert the TOML config table to the JSON payload the worker receives.
fn toml_to_json(value: toml::Value) -> serde_json::Value {
    match value {
        toml::Value::String(text) => serde_json::Value::String(text),
        toml::Value::Integer(num) => serde_json::Value::from(num),
        toml::Value::Float(num) => serde_json::Value::from(num),
        toml::Value::Boolean(flag) => serde_json::Value::Bool(flag),
        toml::Value::Datetime(stamp) => serde_json::Value::String(stamp.to_string()),
        toml::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(toml_to_json).collect())
        }
        toml::Value::Table(table) => serde_json::Value::Object(
            table
                .into_iter()
                .map(|(key, item)| (key, toml_to_json(item)))
                .collect(),
        ),
    }
}

/// Reports lifecycle events on the logger. Log messages are skipped here
/// because the supervisor already echoes them itself.
struct EventLogger;

impl EventSink for EventLogger {
    fn dispatch(&self, event: Event) -> dsup_impl::Result<()> {
        match event.kind {
            EventKind::DidLog { .. } => {}
            EventKind::DidLaunch { argv, .. } => {
                info!("{} supervising {} {}", event.id, event.worker, argv.join(" "))
            }
            EventKind::DidHeartbeat => info!("{} alive", event.id),
            EventKind::WillGraceful => info!("{} draining worker", event.id),
            EventKind::WillExit => info!("{} finished", event.id),
        }
        Ok(())
    }
}

/// Executable entry point.
#[doc(hidden)]
#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").ok().is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init();

    let matches = App::new("dsup")
        .version("0.1")
        .about("Single worker process supervisor")
        .long_about(
            "Reads the TOML configuration file and supervises the configured \
             worker process: restarts it when it dies, replaces it when it \
             hangs and routes operator signals to it.",
        )
        .arg(Arg::with_name("config")
           .help("Configuration file")
           .required(true))
        .get_matches();

    let config = matches.value_of("config")
        .ok_or_else(|| anyhow!("Configuration file is required!"))?;
    let config = std::fs::read_to_string(config)
        .map_err(|e| anyhow!("Failed to read configuration {} ({})", config, e.to_string()))?;
    let settings: Settings = toml::from_str(&config)?;

    let silent = settings.worker.silent.unwrap_or(false);
    let spec: WorkerSpec = settings.worker.into();
    info!("Run worker {} {}", spec.command(), spec.arg_list().join(" "));

    let mut supervisor = SupervisorBuilder::new(spec)
        .events(Arc::new(EventLogger))
        .silent(silent)
        .build();

    // INT drains the worker, TERM removes the whole process group, USR2 is
    // forwarded to the worker pid.
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;
    let mut tick = interval(Duration::from_millis(100));

    loop {
        tokio::select! {
            _ = tick.tick() => supervisor.poll().await,
            _ = sigint.recv() => {
                supervisor.on_graceful_signal(SignalKind::interrupt().as_raw_value())
            }
            _ = sigterm.recv() => {
                supervisor.on_terminal_signal(SignalKind::terminate().as_raw_value()).await
            }
            _ = sigusr2.recv() => {
                supervisor.on_notify_signal(SignalKind::user_defined2().as_raw_value())
            }
        }
        if supervisor.is_done() {
            break;
        }
    }

    info!("Supervisor done");
    Ok(())
}
