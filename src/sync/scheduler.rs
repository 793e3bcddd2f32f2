//! Per-peer sync scheduler (§4.7): polls on a fixed interval, backs off
//! after idle cycles, and can be woken immediately by a local commit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::Instant;

use crate::repository::Repository;

use super::PeerTransport;

pub const POLL_INTERVAL: Duration = Duration::from_millis(300);
pub const BACKOFF_INTERVAL: Duration = Duration::from_millis(1500);
pub const BACKOFF_AFTER_IDLE_CYCLES: u32 = 5;
pub const CLOSE_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Drives one (repository, peer) pair's sync rounds on a background task.
pub struct PeerScheduler {
    cancel: Arc<AtomicBool>,
    trigger: mpsc::UnboundedSender<()>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl PeerScheduler {
    pub fn start(repo: Arc<Repository>, repo_path: String, peer: Arc<dyn PeerTransport>) -> PeerScheduler {
        let cancel = Arc::new(AtomicBool::new(false));
        let (trigger_tx, mut trigger_rx) = mpsc::unbounded_channel::<()>();
        let in_flight = Arc::new(AsyncMutex::new(()));

        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut idle_cycles: u32 = 0;
            loop {
                if task_cancel.load(Ordering::Relaxed) {
                    break;
                }
                let interval = if idle_cycles >= BACKOFF_AFTER_IDLE_CYCLES {
                    BACKOFF_INTERVAL
                } else {
                    POLL_INTERVAL
                };
                let deadline = Instant::now() + interval;
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = trigger_rx.recv() => {}
                }
                if task_cancel.load(Ordering::Relaxed) {
                    break;
                }

                let _guard = match in_flight.try_lock() {
                    Ok(g) => g,
                    Err(_) => continue, // a round is already running; skip this tick
                };
                match super::run_round(
                    &repo,
                    &repo_path,
                    peer.as_ref(),
                    crate::bloom::DEFAULT_CAPACITY,
                    crate::bloom::DEFAULT_FPR,
                )
                .await
                {
                    Ok(status) if status.received == 0 && status.sent == 0 => idle_cycles += 1,
                    Ok(_) => idle_cycles = 0,
                    Err(error) => {
                        tracing::warn!(%error, "sync round failed");
                        idle_cycles += 1;
                    }
                }
            }
        });

        PeerScheduler { cancel, trigger: trigger_tx, handle: Some(handle) }
    }

    /// A freshly committed local change triggers an immediate poll
    /// instead of waiting out the current interval (§4.7, push-triggered
    /// sync).
    pub fn notify_local_commit(&self) {
        let _ = self.trigger.send(());
    }

    /// Cancels the loop and waits for the in-flight round to finish, up
    /// to a 5-second drain deadline (§4.7).
    pub async fn stop(mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        let _ = self.trigger.send(());
        if let Some(handle) = self.handle.take() {
            let _ = tokio::time::timeout(CLOSE_DRAIN_DEADLINE, handle).await;
        }
    }
}
