//! Lifecycle events emitted by supervisors and the collaborator traits that
//! receive them.

use serde_json::Value;

use crate::Result;

/// A lifecycle event emitted by a [`Supervisor`](crate::Supervisor).
///
/// Every event carries the supervisor id, the supervised program and the pid
/// of the running child if one is alive when the event fires.
#[derive(Debug, Clone)]
pub struct Event {
    /// Supervisor identifier, stable across child restarts.
    pub id: String,
    /// Program the supervisor runs.
    pub worker: String,
    /// Pid of the running child, if any.
    pub pid: Option<u32>,
    /// What happened.
    pub kind: EventKind,
}

/// Classification of lifecycle events.
#[derive(Debug, Clone)]
pub enum EventKind {
    /// The supervisor was constructed. Fires once, before the first spawn.
    DidLaunch {
        /// Arguments the worker is started with.
        argv: Vec<String>,
        /// The `argv` entry of the config payload, if the payload has one.
        explicit_argv: Option<Value>,
    },
    /// A log message passed through the supervisor.
    DidLog {
        /// Code classifying the message.
        kind: LogKind,
        /// Human readable message text.
        message: String,
        /// Signal number, for messages triggered by an operator signal.
        context: Option<i32>,
    },
    /// Periodic proof that the supervisor itself is alive.
    DidHeartbeat,
    /// An operator requested graceful shutdown.
    WillGraceful,
    /// No further child will run under this supervisor.
    ///
    /// Delivered at least once, not exactly once: a terminal signal
    /// announces the exit immediately, and reaping a child that was still
    /// running at that point announces it again.
    WillExit,
}

/// Four character codes classifying supervisor log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    /// A child process is being started.
    Init,
    /// Worker output re-emitted from the control channel, including
    /// malformed lines.
    Stdout,
    /// Output captured from the worker's stderr.
    Stderr,
    /// Normal child exit, or a graceful shutdown notice.
    Done,
    /// Abnormal child exit, or a failure to spawn one.
    Fail,
    /// The worker went silent past the hang deadline.
    Hang,
    /// Waiting out the restart delay.
    Wait,
    /// Terminal shutdown notice.
    Exit,
}

impl LogKind {
    /// Stable four character code used in log lines.
    pub fn as_code(&self) -> &'static str {
        match self {
            LogKind::Init => "INIT",
            LogKind::Stdout => "STDO",
            LogKind::Stderr => "STDE",
            LogKind::Done => "DONE",
            LogKind::Fail => "FAIL",
            LogKind::Hang => "HANG",
            LogKind::Wait => "WAIT",
            LogKind::Exit => "EXIT",
        }
    }
}

/// Receiver for supervisor lifecycle events.
///
/// Dispatch errors are logged by the supervisor and dropped; they never
/// interrupt supervision. Implementations must not panic.
pub trait EventSink: Send + Sync {
    /// Deliver one event.
    fn dispatch(&self, event: Event) -> Result<()>;
}

/// Sink that drops every event.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn dispatch(&self, _event: Event) -> Result<()> {
        Ok(())
    }
}

/// Capacity callbacks for the pool manager that owns a supervisor.
///
/// The worker drives these through `BUSY` and `IDLE` control messages; a pool
/// can use them to decide when to scale up or retire workers.
pub trait Overseer: Send + Sync {
    /// The worker accepted work.
    fn did_begin_work(&self, supervisor: &crate::Supervisor) {
        let _ = supervisor;
    }

    /// The worker is waiting for work.
    fn did_begin_idle(&self, supervisor: &crate::Supervisor) {
        let _ = supervisor;
    }
}
