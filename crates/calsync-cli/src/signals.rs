//! Process signals for the sync daemon.
//!
//! - SIGTERM/SIGINT (Ctrl-C elsewhere): graceful shutdown
//! - SIGHUP: sync every account now

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::CliResult;

/// What the daemon was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Resync,
}

/// Turns OS signals into [`Signal`] events.
pub struct SignalHandler {
    tx: mpsc::UnboundedSender<Signal>,
    rx: mpsc::UnboundedReceiver<Signal>,
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalHandler {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// Installs the OS handlers and forwards what they receive.
    #[cfg(unix)]
    pub fn spawn_listener(&self) -> CliResult<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let tx = self.tx.clone();

        tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    _ = sigterm.recv() => {
                        info!("received SIGTERM, shutting down");
                        Signal::Shutdown
                    }
                    _ = sigint.recv() => {
                        info!("received SIGINT, shutting down");
                        Signal::Shutdown
                    }
                    _ = sighup.recv() => {
                        info!("received SIGHUP, syncing all accounts");
                        Signal::Resync
                    }
                };
                if tx.send(signal).is_err() || signal == Signal::Shutdown {
                    break;
                }
            }
            debug!("signal listener stopped");
        });
        Ok(())
    }

    /// Non-Unix: Ctrl-C only.
    #[cfg(not(unix))]
    pub fn spawn_listener(&self) -> CliResult<()> {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received Ctrl-C, shutting down");
                let _ = tx.send(Signal::Shutdown);
            }
        });
        Ok(())
    }

    /// Injects a signal as if the OS had delivered it.
    pub fn trigger(&self, signal: Signal) {
        let _ = self.tx.send(signal);
    }

    /// Waits for the next signal.
    pub async fn recv(&mut self) -> Signal {
        self.rx.recv().await.unwrap_or(Signal::Shutdown)
    }
}
