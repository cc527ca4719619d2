#![deny(missing_docs)]
//! Single worker process supervisor using tokio.
//!
//! Unix only: workers run as process group leaders in their own session and
//! signal routing relies on Unix process groups.
//!
//! ## Supervisor
//!
//! A supervisor owns exactly one worker process. It delivers a JSON config
//! payload on the child's stdin, decodes the control channel the child
//! speaks on stdout, restarts the child five seconds after it dies, replaces
//! it when it goes silent for too long and routes operator signals to it.
//! Run one supervisor per worker and drive each from a short poll tick.
//!
//! ```no_run
//! use dsup_impl::{Result, SupervisorBuilder, WorkerSpec};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let spec = WorkerSpec::new("worker-process")
//!         .args(["--queue", "default"])
//!         .config(json!({ "argv": ["--queue", "default"] }));
//!     let mut supervisor = SupervisorBuilder::new(spec).build();
//!     loop {
//!         supervisor.poll().await;
//!         if supervisor.is_done() {
//!             break;
//!         }
//!         tokio::time::sleep(std::time::Duration::from_millis(100)).await;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Worker
//!
//! A worker reads its config payload from stdin until EOF and reports status
//! by writing control messages to stdout with the `dsup-channel` crate.
//! Anything else it writes to stdout or stderr is captured and re-logged by
//! the supervisor, so regular diagnostics belong on stderr.
//!
//! ```no_run
//! use dsup_channel::{write_message, Message};
//! use tokio::io::AsyncReadExt;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let mut config = Vec::new();
//!     tokio::io::stdin().read_to_end(&mut config).await?;
//!     let mut out = tokio::io::stdout();
//!     loop {
//!         write_message(&mut out, &Message::Heartbeat).await?;
//!         // Do a unit of work here.
//!         tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!     }
//! }
//! ```

/// Enumeration of errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input/output errors.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Errors from process and signal primitives.
    #[error(transparent)]
    Errno(#[from] nix::errno::Errno),

    /// Generic variant for errors created in user code.
    #[error(transparent)]
    Boxed(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Result type returned by the library.
pub type Result<T> = std::result::Result<T, Error>;

mod events;
mod process;
mod supervisor;

pub use events::{Event, EventKind, EventSink, LogKind, NullSink, Overseer};
pub use process::{ExecHandle, ExecSpawner, ProcessHandle, Spawner, CAPTURE_BUFFER_SIZE};
pub use supervisor::{Supervisor, SupervisorBuilder, WorkerSpec};
