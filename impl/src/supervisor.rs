//! Supervisor for a single worker process.
//!
//! A [`Supervisor`] owns the complete lifecycle of one worker: it spawns the
//! process in its own session, delivers the config payload on the child's
//! stdin, decodes the control channel the child speaks on stdout, restarts
//! the child after a fixed delay when it exits, forcibly replaces it when it
//! goes silent past the hang deadline, and routes operator signals to it.
//!
//! The supervisor does no waiting of its own. An owner calls
//! [`Supervisor::poll`] on a short tick, typically sub-second; each call
//! reads the clock once and performs only non-blocking work, except for the
//! bounded TERM to KILL grace nap during forcible termination. Faults are
//! absorbed into scheduling state so the poll itself never fails.
//!
//! Observers plug in through two seams: an [`EventSink`] receiving lifecycle
//! events and an [`Overseer`] receiving capacity callbacks driven by the
//! worker's `BUSY` and `IDLE` messages.

use std::{
    collections::HashMap,
    convert::TryFrom,
    path::{Path, PathBuf},
    process::ExitStatus,
    sync::Arc,
    time::Duration,
};

use log::{debug, error, info, warn};
use nix::sys::signal::Signal;
use rand::Rng;
use serde_json::Value;
use tokio::time::{sleep, Instant};

use dsup_channel::{Decoder, Frame, Message};

use crate::events::{Event, EventKind, EventSink, LogKind, NullSink, Overseer};
use crate::process::{ExecSpawner, ProcessHandle, Spawner};

/// Defines the worker a supervisor runs: program, arguments, environment,
/// working directory and the JSON config payload written to the child's
/// stdin at every spawn.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    command: String,
    args: Vec<String>,
    envs: HashMap<String, String>,
    cwd: Option<PathBuf>,
    config: Value,
}

impl WorkerSpec {
    /// Create a new worker spec.
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            envs: HashMap::new(),
            cwd: None,
            config: Value::Object(Default::default()),
        }
    }

    /// Set command arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args = args.into_iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    /// Set command environment variables.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.envs = vars
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
            .collect();
        self
    }

    /// Set the working directory.
    pub fn cwd<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Set the config payload delivered on the child's stdin.
    pub fn config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Program the worker runs.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Arguments the worker is started with.
    pub fn arg_list(&self) -> &[String] {
        &self.args
    }

    /// Environment variables set for the worker.
    pub fn env_map(&self) -> &HashMap<String, String> {
        &self.envs
    }

    /// Working directory, if one was set.
    pub fn working_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Config payload delivered on the child's stdin.
    pub fn config_payload(&self) -> &Value {
        &self.config
    }
}

/// Where the supervisor stands with respect to a child process.
enum WorkerState {
    /// No child. `restart_at` is the earliest next spawn, if one is coming.
    Idle { restart_at: Option<Instant> },
    /// A child was spawned and has not been reaped yet.
    Running(Active),
}

/// Book-keeping for the running child.
struct Active {
    handle: Box<dyn ProcessHandle>,
    pid: u32,
    /// Cleared once the group has been forcibly terminated; signal requests
    /// after that point are suppressed.
    group_alive: bool,
    hang_deadline: Instant,
    decoder: Decoder,
}

/// Build a supervisor.
pub struct SupervisorBuilder {
    spec: WorkerSpec,
    silent: bool,
    spawner: Box<dyn Spawner>,
    events: Arc<dyn EventSink>,
    overseer: Option<Arc<dyn Overseer>>,
}

impl SupervisorBuilder {
    /// Create a new supervisor builder.
    pub fn new(spec: WorkerSpec) -> Self {
        Self {
            spec,
            silent: false,
            spawner: Box::new(ExecSpawner),
            events: Arc::new(NullSink),
            overseer: None,
        }
    }

    /// Set the sink receiving lifecycle events.
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Set the overseer receiving capacity callbacks.
    pub fn overseer(mut self, overseer: Arc<dyn Overseer>) -> Self {
        self.overseer = Some(overseer);
        self
    }

    /// Replace the process spawner.
    pub fn spawner(mut self, spawner: Box<dyn Spawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Suppress the local log echo of supervisor messages. Events still
    /// reach the sink.
    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    /// Return the supervisor. The first [`Supervisor::poll`] spawns the
    /// worker immediately.
    pub fn build(self) -> Supervisor {
        let now = Instant::now();
        let supervisor = Supervisor {
            id: generate_id(),
            spec: self.spec,
            state: WorkerState::Idle {
                restart_at: Some(now),
            },
            heartbeat_at: now,
            want_restart: true,
            want_shutdown: false,
            silent: self.silent,
            spawner: self.spawner,
            events: self.events,
            overseer: self.overseer,
        };
        supervisor.dispatch_event(EventKind::DidLaunch {
            argv: supervisor.spec.arg_list().to_vec(),
            explicit_argv: supervisor.spec.config_payload().get("argv").cloned(),
        });
        supervisor
    }
}

/// Supervises one worker process.
pub struct Supervisor {
    id: String,
    spec: WorkerSpec,
    state: WorkerState,
    heartbeat_at: Instant,
    want_restart: bool,
    want_shutdown: bool,
    silent: bool,
    spawner: Box<dyn Spawner>,
    events: Arc<dyn EventSink>,
    overseer: Option<Arc<dyn Overseer>>,
}

impl Supervisor {
    /// Fixed delay between a child exit and the next spawn attempt.
    pub const WAIT_BEFORE_RESTART: Duration = Duration::from_secs(5);

    /// Cadence of the supervisor's own `did-heartbeat` event.
    pub const HEARTBEAT_EVENT_INTERVAL: Duration = Duration::from_secs(120);

    /// A child that goes this long without a `HEARTBEAT` message is treated
    /// as hung and forcibly replaced.
    pub const HANG_TIMEOUT: Duration = Duration::from_secs(86400);

    /// Grace between the TERM and KILL phases of forcible termination.
    const KILL_DELAY: Duration = Duration::from_secs(3);

    /// Supervisor identifier, stable across child restarts.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The worker this supervisor runs.
    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    /// True while a child has been spawned and not yet reaped.
    pub fn is_running(&self) -> bool {
        matches!(self.state, WorkerState::Running(_))
    }

    /// True once no child is running and none will ever be spawned again.
    pub fn is_done(&self) -> bool {
        !self.is_running() && (!self.want_restart || self.want_shutdown)
    }

    /// Pid of the running child, if any.
    pub fn pid(&self) -> Option<u32> {
        match &self.state {
            WorkerState::Running(active) => Some(active.pid),
            WorkerState::Idle { .. } => None,
        }
    }

    /// Drive the state machine one step.
    ///
    /// Spawns the child when a restart is due, decodes captured output,
    /// reaps and reschedules on exit, emits the periodic supervisor
    /// heartbeat and enforces the hang deadline.
    pub async fn poll(&mut self) {
        let now = Instant::now();

        if !self.is_running() {
            if !self.spawn_due(now) {
                return;
            }
            self.start_worker_process(now);
        }

        // Output first: a final burst written just before exit is decoded
        // before the exit is logged, and a heartbeat seen here pushes the
        // hang deadline out before the check below.
        let (frames, stderr, status) = self.drain_child();
        for frame in frames {
            self.handle_frame(frame, now);
        }
        let stderr = String::from_utf8_lossy(&stderr);
        let stderr = stderr.trim();
        if !stderr.is_empty() {
            self.log_message(LogKind::Stderr, stderr, None);
        }
        if let Some(status) = status {
            self.reap(status, now);
        }

        self.update_heartbeat_event(now);
        self.update_hang_detection(now).await;
    }

    /// Forward a raw operator signal to the child pid, not its group.
    pub fn on_notify_signal(&self, signo: i32) {
        let sig = match Signal::try_from(signo) {
            Ok(sig) => sig,
            Err(_) => return,
        };
        if let WorkerState::Running(active) = &self.state {
            if active.group_alive {
                if let Err(err) = active.handle.signal_pid(sig) {
                    debug!(
                        "{} notify signal {} to pid {} failed: {}",
                        self.id, signo, active.pid, err
                    );
                }
            }
        }
    }

    /// Begin graceful shutdown: no further spawns. A running child gets a
    /// group interrupt and is reaped on a later poll, after which the
    /// supervisor becomes done; with no child running it becomes done
    /// immediately.
    pub fn on_graceful_signal(&mut self, signo: i32) {
        self.dispatch_event(EventKind::WillGraceful);
        self.want_shutdown = true;
        if !self.is_running() {
            self.state = WorkerState::Idle { restart_at: None };
            self.dispatch_event(EventKind::WillExit);
        }
        self.log_message(
            LogKind::Done,
            signal_notice("Graceful shutdown", signo),
            Some(signo),
        );
        self.graceful_process_group();
    }

    /// Hard shutdown: forcibly terminate the group and announce the exit
    /// immediately, whether or not a child was running.
    pub async fn on_terminal_signal(&mut self, signo: i32) {
        self.log_message(
            LogKind::Exit,
            signal_notice("Shutting down", signo),
            Some(signo),
        );
        self.want_shutdown = true;
        if !self.is_running() {
            self.state = WorkerState::Idle { restart_at: None };
        }
        self.annihilate_process_group().await;
        self.dispatch_event(EventKind::WillExit);
    }

    fn spawn_due(&self, now: Instant) -> bool {
        if !self.want_restart || self.want_shutdown {
            return false;
        }
        match &self.state {
            WorkerState::Idle {
                restart_at: Some(at),
            } => *at <= now,
            _ => false,
        }
    }

    fn start_worker_process(&mut self, now: Instant) {
        self.log_message(LogKind::Init, "Starting process.", None);
        match self.spawner.spawn(&self.spec) {
            Ok(handle) => {
                let pid = handle.pid();
                self.heartbeat_at = now + Self::HEARTBEAT_EVENT_INTERVAL;
                self.state = WorkerState::Running(Active {
                    handle,
                    pid,
                    group_alive: true,
                    hang_deadline: now + Self::HANG_TIMEOUT,
                    decoder: Decoder::new(),
                });
            }
            Err(err) => {
                self.log_message(
                    LogKind::Fail,
                    format!("Failed to start process: {}", err),
                    None,
                );
                self.schedule_restart(now);
            }
        }
    }

    /// Collect buffered output and, once the child has exited, its status.
    fn drain_child(&mut self) -> (Vec<Frame>, Vec<u8>, Option<ExitStatus>) {
        match &mut self.state {
            WorkerState::Running(active) => {
                let status = if active.handle.is_ready() {
                    active.handle.resolve()
                } else {
                    None
                };
                let (stdout, stderr) = active.handle.read_available();
                let frames = if stdout.is_empty() {
                    Vec::new()
                } else {
                    active.decoder.feed(&stdout)
                };
                active.handle.discard_buffered();
                (frames, stderr, status)
            }
            WorkerState::Idle { .. } => (Vec::new(), Vec::new(), None),
        }
    }

    fn handle_frame(&mut self, frame: Frame, now: Instant) {
        match frame {
            Frame::Message(Message::Stdout(text)) => {
                self.log_message(LogKind::Stdout, text, None);
            }
            Frame::Message(Message::Heartbeat) => {
                if let WorkerState::Running(active) = &mut self.state {
                    active.hang_deadline = now + Self::HANG_TIMEOUT;
                }
            }
            Frame::Message(Message::Busy) => {
                if let Some(overseer) = self.overseer.clone() {
                    overseer.did_begin_work(self);
                }
            }
            Frame::Message(Message::Idle) => {
                if let Some(overseer) = self.overseer.clone() {
                    overseer.did_begin_idle(self);
                }
            }
            Frame::Message(Message::Shutdown) => {
                // Voluntary retirement: the exit that follows is final.
                self.want_restart = false;
                self.want_shutdown = true;
            }
            Frame::Raw(line) => {
                self.log_message(LogKind::Stdout, format!("<Malformed> {}", line), None);
            }
        }
    }

    fn reap(&mut self, status: ExitStatus, now: Instant) {
        if status.success() {
            self.log_message(LogKind::Done, "Process exited normally.", None);
        } else {
            self.log_message(
                LogKind::Fail,
                format!("Process exited with error {}", describe_exit(&status)),
                None,
            );
        }

        self.state = WorkerState::Idle { restart_at: None };

        if self.want_shutdown {
            self.dispatch_event(EventKind::WillExit);
        } else {
            self.schedule_restart(now);
        }
    }

    /// Log the restart wait and, when no child remains, arm the restart
    /// deadline. During a hang kill the child still has to be reaped; the
    /// deadline is written once the exit is collected.
    fn schedule_restart(&mut self, now: Instant) {
        self.log_message(LogKind::Wait, "Waiting to restart process.", None);
        if let WorkerState::Idle { restart_at } = &mut self.state {
            *restart_at = Some(now + Self::WAIT_BEFORE_RESTART);
        }
    }

    fn update_heartbeat_event(&mut self, now: Instant) {
        if self.heartbeat_at > now {
            return;
        }
        self.heartbeat_at = now + Self::HEARTBEAT_EVENT_INTERVAL;
        self.dispatch_event(EventKind::DidHeartbeat);
    }

    async fn update_hang_detection(&mut self, now: Instant) {
        let hung = match &self.state {
            WorkerState::Running(active) => now > active.hang_deadline,
            WorkerState::Idle { .. } => false,
        };
        if hung {
            self.log_message(LogKind::Hang, "Hang detected. Restarting process.", None);
            self.annihilate_process_group().await;
            self.schedule_restart(now);
        }
    }

    /// Forcibly terminate the child's whole process group: TERM, a short
    /// grace nap, then an unconditional KILL whose error is ignored since
    /// the group may already be gone. The group is considered dead
    /// afterwards; the handle still reaps the exit on a later poll.
    async fn annihilate_process_group(&mut self) {
        let term_sent = match &mut self.state {
            WorkerState::Running(active) if active.group_alive => {
                match active.handle.signal_group(Signal::SIGTERM) {
                    Ok(()) => true,
                    Err(err) => {
                        debug!(
                            "{} group TERM to pid {} failed: {}",
                            self.id, active.pid, err
                        );
                        false
                    }
                }
            }
            _ => false,
        };
        if term_sent {
            sleep(Self::KILL_DELAY).await;
            if let WorkerState::Running(active) = &mut self.state {
                let _ = active.handle.signal_group(Signal::SIGKILL);
                active.group_alive = false;
            }
        }
    }

    /// Interrupt the child's whole process group.
    fn graceful_process_group(&self) {
        if let WorkerState::Running(active) = &self.state {
            if active.group_alive {
                if let Err(err) = active.handle.signal_group(Signal::SIGINT) {
                    debug!(
                        "{} group INT to pid {} failed: {}",
                        self.id, active.pid, err
                    );
                }
            }
        }
    }

    fn log_message(&self, kind: LogKind, message: impl Into<String>, context: Option<i32>) {
        let message = message.into();
        if !self.silent {
            let code = kind.as_code();
            match kind {
                LogKind::Fail | LogKind::Hang => error!("{} [{}] {}", self.id, code, message),
                LogKind::Stderr | LogKind::Exit => warn!("{} [{}] {}", self.id, code, message),
                _ => info!("{} [{}] {}", self.id, code, message),
            }
        }
        self.dispatch_event(EventKind::DidLog {
            kind,
            message,
            context,
        });
    }

    fn dispatch_event(&self, kind: EventKind) {
        let event = Event {
            id: self.id.clone(),
            worker: self.spec.command().to_owned(),
            pid: self.pid(),
            kind,
        };
        // Dispatch failures are logged and dropped; they never interrupt
        // supervision.
        if let Err(err) = self.events.dispatch(event) {
            warn!("{} event dispatch failed: {}", self.id, err);
        }
    }
}

/// Generate a unique id for the supervisor: own pid plus random bits,
/// truncated to 12 characters.
fn generate_id() -> String {
    let entropy: u64 = rand::thread_rng().gen();
    let mut id = format!("{}:{:016x}", std::process::id(), entropy);
    id.truncate(12);
    id
}

fn signal_notice(action: &str, signo: i32) -> String {
    match Signal::try_from(signo) {
        Ok(sig) => format!("{} in response to signal {} ({}).", action, signo, sig),
        Err(_) => format!("{} in response to signal {}.", action, signo),
    }
}

fn describe_exit(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code.to_string(),
        None => match status.signal() {
            Some(sig) => format!("signal {}", sig),
            None => status.to_string(),
        },
    }
}
