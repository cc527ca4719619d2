//! Worker process execution: session setup, config delivery, non-blocking
//! output capture, exit detection and process group signaling.

use std::io;
use std::process::{ExitStatus, Stdio};

use log::debug;
use nix::sys::signal::{self, Signal};
use nix::unistd::{self, Pid};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;

use crate::supervisor::WorkerSpec;
use crate::Result;

/// Most bytes retained per output stream between two polls while the child
/// runs. Once the buffer is full the pipe backs up instead of losing data.
pub const CAPTURE_BUFFER_SIZE: usize = 65535;

/// Read size used by the stream pump tasks.
const PUMP_CHUNK_SIZE: usize = 8192;

/// Chunks in flight per stream. A full channel stalls the pump, which in
/// turn applies pipe backpressure to the child.
const PUMP_CHANNEL_DEPTH: usize = 16;

/// One worker process owned by a supervisor.
///
/// Every method is non-blocking so a supervisor can call them from its poll
/// loop without stalling it. Implementations own exit detection and output
/// capture for the child they wrap.
pub trait ProcessHandle: Send {
    /// Pid recorded at spawn time.
    fn pid(&self) -> u32;

    /// True once the child has exited and all of its output has been
    /// captured. Transient wait errors are swallowed and retried on the
    /// next call.
    fn is_ready(&mut self) -> bool;

    /// Exit status of the child, or `None` while it still runs. Idempotent
    /// once [`ProcessHandle::is_ready`] has returned true.
    fn resolve(&mut self) -> Option<ExitStatus>;

    /// Currently buffered `(stdout, stderr)` bytes, without consuming them.
    /// Capped at [`CAPTURE_BUFFER_SIZE`] per stream while the child runs;
    /// uncapped for the final drain after exit.
    fn read_available(&mut self) -> (Vec<u8>, Vec<u8>);

    /// Drop the buffered output last returned by
    /// [`ProcessHandle::read_available`].
    fn discard_buffered(&mut self);

    /// Send a signal to the child pid only.
    fn signal_pid(&self, sig: Signal) -> Result<()>;

    /// Send a signal to the child's whole process group.
    fn signal_group(&self, sig: Signal) -> Result<()>;
}

/// Starts worker processes. This is the seam where tests inject scripted
/// children instead of real ones.
pub trait Spawner: Send {
    /// Start a child for `spec` and deliver its config payload.
    fn spawn(&self, spec: &WorkerSpec) -> Result<Box<dyn ProcessHandle>>;
}

/// [`Spawner`] that runs real processes via [`ExecHandle::spawn`].
#[derive(Debug, Default)]
pub struct ExecSpawner;

impl Spawner for ExecSpawner {
    fn spawn(&self, spec: &WorkerSpec) -> Result<Box<dyn ProcessHandle>> {
        Ok(Box::new(ExecHandle::spawn(spec)?))
    }
}

/// Bounded capture buffer fed by a background read task.
struct StreamPump {
    rx: mpsc::Receiver<Vec<u8>>,
    task: JoinHandle<()>,
    buf: Vec<u8>,
    pending: Option<Vec<u8>>,
    eof: bool,
}

impl StreamPump {
    fn new<R>(stream: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(PUMP_CHANNEL_DEPTH);
        let task = tokio::spawn(async move {
            let mut stream = stream;
            let mut chunk = [0u8; PUMP_CHUNK_SIZE];
            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(read) => {
                        if tx.send(chunk[..read].to_vec()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        StreamPump {
            rx,
            task,
            buf: Vec::new(),
            pending: None,
            eof: false,
        }
    }

    /// Move pumped chunks into the local buffer until it holds `limit`
    /// bytes, or without limit for the final drain. Chunks that do not fit
    /// are split, never dropped.
    fn fill(&mut self, limit: Option<usize>) {
        loop {
            let room = match limit {
                Some(limit) if self.buf.len() >= limit => return,
                Some(limit) => limit - self.buf.len(),
                None => usize::MAX,
            };
            let chunk = match self.pending.take() {
                Some(chunk) => chunk,
                None => match self.rx.try_recv() {
                    Ok(chunk) => chunk,
                    Err(TryRecvError::Empty) => return,
                    Err(TryRecvError::Disconnected) => {
                        self.eof = true;
                        return;
                    }
                },
            };
            if chunk.len() > room {
                self.buf.extend_from_slice(&chunk[..room]);
                self.pending = Some(chunk[room..].to_vec());
                return;
            }
            self.buf.extend_from_slice(&chunk);
        }
    }

    fn drained(&self) -> bool {
        self.eof && self.pending.is_none()
    }
}

/// [`ProcessHandle`] implementation over [`tokio::process`].
///
/// The child runs as the leader of a fresh session so that group signals
/// never reach the supervisor itself, and so that grandchildren it forks are
/// covered by [`ProcessHandle::signal_group`].
pub struct ExecHandle {
    child: Child,
    pid: u32,
    status: Option<ExitStatus>,
    stdout: StreamPump,
    stderr: StreamPump,
}

impl ExecHandle {
    /// Spawn the worker described by `spec` with piped stdio and deliver the
    /// serialized config payload on its stdin, closing the pipe afterwards
    /// so the child sees EOF once the payload ends.
    ///
    /// Must be called from within a tokio runtime: config delivery and
    /// output capture run on background tasks.
    pub fn spawn(spec: &WorkerSpec) -> Result<Self> {
        let mut command = Command::new(spec.command());
        command
            .args(spec.arg_list())
            .envs(spec.env_map())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        if let Some(dir) = spec.working_dir() {
            command.current_dir(dir);
        }
        unsafe {
            command.pre_exec(|| {
                unistd::setsid()
                    .map(|_| ())
                    .map_err(|errno| io::Error::from_raw_os_error(errno as i32))
            });
        }

        let mut child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| pipe_error("pid of spawned worker"))?;

        let payload = serde_json::to_vec(spec.config_payload())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(&payload).await {
                    debug!("config delivery failed: {}", err);
                }
            });
        }

        let stdout = child.stdout.take().ok_or_else(|| pipe_error("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| pipe_error("stderr"))?;

        Ok(ExecHandle {
            child,
            pid,
            status: None,
            stdout: StreamPump::new(stdout),
            stderr: StreamPump::new(stderr),
        })
    }
}

impl ProcessHandle for ExecHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_ready(&mut self) -> bool {
        if self.status.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => self.status = Some(status),
                Ok(None) => return false,
                Err(err) => {
                    debug!("wait on pid {} failed: {}", self.pid, err);
                    return false;
                }
            }
        }
        // Exit observed; ready once the pumps have flushed the final burst.
        self.stdout.fill(None);
        self.stderr.fill(None);
        self.stdout.drained() && self.stderr.drained()
    }

    fn resolve(&mut self) -> Option<ExitStatus> {
        self.status
    }

    fn read_available(&mut self) -> (Vec<u8>, Vec<u8>) {
        let limit = if self.status.is_some() {
            None
        } else {
            Some(CAPTURE_BUFFER_SIZE)
        };
        self.stdout.fill(limit);
        self.stderr.fill(limit);
        (self.stdout.buf.clone(), self.stderr.buf.clone())
    }

    fn discard_buffered(&mut self) {
        self.stdout.buf.clear();
        self.stderr.buf.clear();
    }

    fn signal_pid(&self, sig: Signal) -> Result<()> {
        signal::kill(Pid::from_raw(self.pid as i32), sig)?;
        Ok(())
    }

    fn signal_group(&self, sig: Signal) -> Result<()> {
        let pgid = unistd::getpgid(Some(Pid::from_raw(self.pid as i32)))?;
        signal::killpg(pgid, sig)?;
        Ok(())
    }
}

impl Drop for ExecHandle {
    fn drop(&mut self) {
        self.stdout.task.abort();
        self.stderr.task.abort();
    }
}

fn pipe_error(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("missing {} on spawned worker", what),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::sleep;

    fn spec(script: &str) -> WorkerSpec {
        WorkerSpec::new("/bin/sh").args(["-c", script])
    }

    async fn wait_ready(handle: &mut ExecHandle) -> ExitStatus {
        for _ in 0..500 {
            if handle.is_ready() {
                return handle.resolve().unwrap();
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("worker did not exit in time");
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let mut handle =
            ExecHandle::spawn(&spec("printf out; printf err >&2; exit 3")).unwrap();
        assert!(handle.pid() > 0);
        assert!(handle.resolve().is_none());

        let status = wait_ready(&mut handle).await;
        assert_eq!(status.code(), Some(3));

        let (stdout, stderr) = handle.read_available();
        assert_eq!(stdout, b"out");
        assert_eq!(stderr, b"err");
    }

    #[tokio::test]
    async fn read_keeps_the_buffer_until_discard() {
        let mut handle = ExecHandle::spawn(&spec("printf hello")).unwrap();
        wait_ready(&mut handle).await;

        let (first, _) = handle.read_available();
        let (second, _) = handle.read_available();
        assert_eq!(first, b"hello");
        assert_eq!(second, b"hello");

        handle.discard_buffered();
        let (third, _) = handle.read_available();
        assert!(third.is_empty());
    }

    #[tokio::test]
    async fn config_payload_arrives_on_stdin() {
        // cat copies the payload back and exits on the EOF that follows it.
        let spec = spec("cat").config(json!({ "queue": "default" }));
        let mut handle = ExecHandle::spawn(&spec).unwrap();

        let status = wait_ready(&mut handle).await;
        assert!(status.success());

        let (stdout, _) = handle.read_available();
        assert_eq!(stdout, br#"{"queue":"default"}"#);
    }

    #[tokio::test]
    async fn group_signal_reaches_the_worker() {
        let mut handle = ExecHandle::spawn(&spec("sleep 30")).unwrap();
        sleep(Duration::from_millis(100)).await;

        handle.signal_group(Signal::SIGTERM).unwrap();
        let status = wait_ready(&mut handle).await;
        assert!(!status.success());
    }
}
