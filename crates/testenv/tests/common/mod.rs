//! Test helpers for session integration tests

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use testenv::{ConfigDocument, PortPool, Runner, RunnerError, ServerEvent, ShutdownListener};
use tokio::sync::mpsc;

/// The mock server binary built alongside these tests
pub fn mock_bin() -> &'static str {
    env!("CARGO_BIN_EXE_testenv-mock")
}

/// Write `yaml` as `testenv.yml` in `dir` and return its path
///
/// `@MOCK@` is replaced with the mock binary path.
pub fn write_config(dir: &Path, yaml: &str) -> PathBuf {
    let path = dir.join("testenv.yml");
    std::fs::write(&path, yaml.replace("@MOCK@", mock_bin())).unwrap();
    // Empty routes file for generic servers running the mock binary
    std::fs::write(dir.join("routes.yaml"), "").unwrap();
    path
}

/// Outcome of one session
pub struct SessionResult {
    pub runner: Runner,
    pub result: Result<i32, RunnerError>,
    pub events: Vec<(String, ServerEvent)>,
}

impl SessionResult {
    /// Index of the first `event` reported for `server`
    pub fn position(&self, server: &str, event: &ServerEvent) -> Option<usize> {
        self.events
            .iter()
            .position(|(name, e)| name == server && e == event)
    }

    /// Index of the first stop report for `server`
    pub fn stop_position(&self, server: &str) -> Option<usize> {
        self.events.iter().position(|(name, e)| {
            name == server && matches!(e, ServerEvent::Stopped(_) | ServerEvent::StopFailed(_))
        })
    }

    /// Pid reported when `server` started
    pub fn pid(&self, server: &str) -> Option<u32> {
        self.events.iter().find_map(|(name, e)| match e {
            ServerEvent::Started { pid } if name == server => *pid,
            _ => None,
        })
    }
}

/// Run a full session for the config at `config`
pub async fn run_session(
    config: &Path,
    command: &[&str],
    shutdown: ShutdownListener,
) -> SessionResult {
    run_session_with_events(config, command, shutdown, None).await
}

/// Run a full session, forwarding events to `observer` as they happen
pub async fn run_session_with_events(
    config: &Path,
    command: &[&str],
    shutdown: ShutdownListener,
    observer: Option<mpsc::UnboundedSender<(String, ServerEvent)>>,
) -> SessionResult {
    let document = ConfigDocument::from_file(config).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    // Sessions in one test binary share the process-wide pool so that
    // concurrently running tests never promise the same port twice
    let mut runner = Runner::new(document, command.iter().map(|s| s.to_string()).collect())
        .with_ports(PortPool::process())
        .with_event_sender(tx);

    let forward = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            if let Some(observer) = &observer {
                let _ = observer.send(event.clone());
            }
            events.push(event);
        }
        events
    });

    let result = runner.run(shutdown).await;
    // The runner closes the event channel once the session is over
    let events = forward.await.unwrap();

    SessionResult {
        runner,
        result,
        events,
    }
}
