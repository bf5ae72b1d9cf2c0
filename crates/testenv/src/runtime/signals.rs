//! Shutdown requests from OS signals

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Requests a session shutdown, naming the reason
#[derive(Debug, Clone)]
pub struct ShutdownTrigger(watch::Sender<Option<&'static str>>);

/// Observes shutdown requests
#[derive(Debug, Clone)]
pub struct ShutdownListener(watch::Receiver<Option<&'static str>>);

/// Create a connected trigger/listener pair
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownListener) {
    let (tx, rx) = watch::channel(None);
    (ShutdownTrigger(tx), ShutdownListener(rx))
}

impl ShutdownTrigger {
    /// Request shutdown; only the first reason is kept
    pub fn trigger(&self, reason: &'static str) {
        self.0.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }
}

impl ShutdownListener {
    /// Reason of a pending request, if any
    pub fn requested(&self) -> Option<&'static str> {
        *self.0.borrow()
    }

    /// Resolve once shutdown is requested
    ///
    /// Never resolves if every trigger is dropped without firing.
    pub async fn wait(&mut self) -> &'static str {
        loop {
            if let Some(reason) = *self.0.borrow_and_update() {
                return reason;
            }
            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Route SIGINT, SIGQUIT and SIGTERM into `trigger`
///
/// Handlers are registered before this returns, so a signal arriving right
/// after is never lost. Later signals are logged and otherwise ignored: the
/// session is already on its way down.
pub fn install_signal_handlers(trigger: ShutdownTrigger) -> std::io::Result<JoinHandle<()>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = sigint.recv() => "SIGINT",
                _ = sigquit.recv() => "SIGQUIT",
                _ = sigterm.recv() => "SIGTERM",
            };
            if trigger.0.borrow().is_some() {
                log::warn!("Received {}, shutdown already in progress", name);
            } else {
                log::info!("Received {}, shutting down", name);
                trigger.trigger(name);
            }
        }
    }))
}
