// End to end checks against real /bin/sh workers: spawning, config
// delivery, control channel decoding, signal routing and reaping.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::Signal;
use serde_json::json;
use tokio::time;

use dsup_impl::{
    Event, EventKind, EventSink, LogKind, Overseer, Result, Supervisor, SupervisorBuilder,
    WorkerSpec,
};

#[derive(Default)]
struct RecordingSink(Mutex<Vec<Event>>);

impl EventSink for RecordingSink {
    fn dispatch(&self, event: Event) -> Result<()> {
        self.0.lock().unwrap().push(event);
        Ok(())
    }
}

impl RecordingSink {
    fn logs(&self) -> Vec<(LogKind, String, Option<i32>)> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match &event.kind {
                EventKind::DidLog {
                    kind,
                    message,
                    context,
                } => Some((*kind, message.clone(), *context)),
                _ => None,
            })
            .collect()
    }

    fn has_log(&self, kind: LogKind, needle: &str) -> bool {
        self.logs()
            .iter()
            .any(|(k, message, _)| *k == kind && message.contains(needle))
    }

    fn lifecycle(&self) -> Vec<&'static str> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event.kind {
                EventKind::DidLaunch { .. } => Some("did-launch"),
                EventKind::DidHeartbeat => Some("did-heartbeat"),
                EventKind::WillGraceful => Some("will-graceful"),
                EventKind::WillExit => Some("will-exit"),
                EventKind::DidLog { .. } => None,
            })
            .collect()
    }
}

#[derive(Default)]
struct RecordingOverseer(Mutex<Vec<&'static str>>);

impl Overseer for RecordingOverseer {
    fn did_begin_work(&self, _supervisor: &Supervisor) {
        self.0.lock().unwrap().push("work");
    }

    fn did_begin_idle(&self, _supervisor: &Supervisor) {
        self.0.lock().unwrap().push("idle");
    }
}

struct Harness {
    supervisor: Supervisor,
    events: Arc<RecordingSink>,
    overseer: Arc<RecordingOverseer>,
}

fn harness(spec: WorkerSpec) -> Harness {
    let events = Arc::new(RecordingSink::default());
    let overseer = Arc::new(RecordingOverseer::default());
    let supervisor = SupervisorBuilder::new(spec)
        .events(events.clone())
        .overseer(overseer.clone())
        .silent(true)
        .build();
    Harness {
        supervisor,
        events,
        overseer,
    }
}

fn shell(script: &str) -> WorkerSpec {
    WorkerSpec::new("/bin/sh").args(["-c", script])
}

/// Poll on a short tick until the condition holds or ten seconds pass.
async fn poll_until<F>(supervisor: &mut Supervisor, mut cond: F) -> bool
where
    F: FnMut(&Supervisor) -> bool,
{
    let deadline = time::Instant::now() + Duration::from_secs(10);
    loop {
        supervisor.poll().await;
        if cond(supervisor) {
            return true;
        }
        if time::Instant::now() > deadline {
            return false;
        }
        time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn supervises_a_protocol_speaking_worker() {
    let script = r#"printf '["BUSY"]\n["STDOUT","batch finished"]\n["IDLE"]\n'; exit 0"#;
    let mut h = harness(shell(script));

    assert!(poll_until(&mut h.supervisor, |s| !s.is_running()).await);

    assert!(h.events.has_log(LogKind::Init, "Starting process."));
    assert!(h.events.has_log(LogKind::Stdout, "batch finished"));
    assert!(h.events.has_log(LogKind::Done, "Process exited normally."));
    assert!(h.events.has_log(LogKind::Wait, "Waiting to restart process."));
    assert_eq!(*h.overseer.0.lock().unwrap(), vec!["work", "idle"]);
    // A normal exit is not the end: a respawn is pending.
    assert!(!h.supervisor.is_done());
}

#[tokio::test]
async fn config_payload_is_delivered_before_eof() {
    // cat copies the payload back and exits on the EOF that follows it; the
    // echoed JSON is not a control array so it surfaces as a malformed line.
    let spec = shell("cat; echo").config(json!({ "marker": "paydirt" }));
    let mut h = harness(spec);

    assert!(poll_until(&mut h.supervisor, |s| !s.is_running()).await);

    assert!(h.events.has_log(LogKind::Stdout, "paydirt"));
    assert!(h.events.has_log(LogKind::Stdout, "<Malformed>"));
    assert!(h.events.has_log(LogKind::Done, "Process exited normally."));
}

#[tokio::test]
async fn graceful_signal_interrupts_the_worker() {
    let mut h = harness(shell("sleep 30"));

    assert!(poll_until(&mut h.supervisor, |s| s.is_running()).await);
    h.supervisor.on_graceful_signal(Signal::SIGINT as i32);

    assert!(poll_until(&mut h.supervisor, |s| s.is_done()).await);
    assert!(h.events.lifecycle().contains(&"will-graceful"));
    assert!(h.events.lifecycle().contains(&"will-exit"));
    assert!(h.events.logs().iter().any(|(kind, _, context)| {
        *kind == LogKind::Done && *context == Some(Signal::SIGINT as i32)
    }));
}

#[tokio::test]
async fn terminal_signal_kills_a_stubborn_worker() {
    // The worker ignores TERM and INT, so only the KILL phase removes it.
    let mut h = harness(shell("trap '' TERM INT; sleep 30"));

    assert!(poll_until(&mut h.supervisor, |s| s.is_running()).await);
    time::sleep(Duration::from_millis(100)).await;
    h.supervisor
        .on_terminal_signal(Signal::SIGTERM as i32)
        .await;

    assert!(h.events.lifecycle().contains(&"will-exit"));
    assert!(poll_until(&mut h.supervisor, |s| s.is_done()).await);
    assert!(h.events.has_log(LogKind::Exit, "Shutting down in response to signal"));
    assert!(h.events.has_log(LogKind::Fail, "Process exited with error signal"));
}

#[tokio::test]
async fn stderr_and_exit_codes_are_reported() {
    let mut h = harness(shell("echo boom >&2; exit 7"));

    assert!(poll_until(&mut h.supervisor, |s| !s.is_running()).await);

    assert!(h.events.has_log(LogKind::Stderr, "boom"));
    assert!(h.events.has_log(LogKind::Fail, "Process exited with error 7"));
    assert!(h.events.has_log(LogKind::Wait, "Waiting to restart process."));
    assert!(!h.supervisor.is_done());
}
