//! Control-privilege keepalive task.
//!
//! Spawned at session construction, cancelled at teardown. While the session
//! holds the control privilege, the task re-reads the privilege register every
//! period so the device-side lease never expires; a register read returning no
//! privilege bits means another controller took over, which is reported once
//! through the session's control-lost listener.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::device::SessionShared;
use crate::registers::{bootstrap, ControlPrivilege};

/// Delay between privilege re-reads after a transient failure.
const RETRY_DELAY: Duration = Duration::from_millis(10);
/// How long transient failures are retried before the beat is skipped.
const RETRY_WINDOW: Duration = Duration::from_secs(5);

/// Cancellation primitive: an atomic flag plus a wake channel, so the
/// heartbeat sleep ends promptly on cancel.
pub(crate) struct Cancellation {
    cancelled: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    async fn cancelled_wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Handle of the spawned heartbeat task.
pub(crate) struct Heartbeat {
    cancel: Arc<Cancellation>,
    task: JoinHandle<()>,
}

impl Heartbeat {
    /// Spawn the keepalive loop for `shared`.
    pub(crate) fn spawn(shared: Arc<SessionShared>, period: Duration) -> Self {
        let cancel = Arc::new(Cancellation::new());
        let task = tokio::spawn(run(shared, period, cancel.clone()));
        Self { cancel, task }
    }

    /// Cancel the task and wait for it to finish.
    pub(crate) async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            debug!(error = %err, "heartbeat task did not exit cleanly");
        }
    }

    /// Best-effort synchronous teardown, for drop paths.
    pub(crate) fn abort(&self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

async fn run(shared: Arc<SessionShared>, period: Duration, cancel: Arc<Cancellation>) {
    debug!(?period, "heartbeat started");
    loop {
        tokio::select! {
            _ = cancel.cancelled_wait() => break,
            _ = sleep(period) => {}
        }
        if !shared.is_controller.load(Ordering::Relaxed) {
            continue;
        }

        let give_up = Instant::now() + RETRY_WINDOW;
        loop {
            match shared
                .channel
                .read_register(bootstrap::CONTROL_CHANNEL_PRIVILEGE)
                .await
            {
                Ok(value) => {
                    let privilege = ControlPrivilege::from_bits_truncate(value);
                    if !privilege
                        .intersects(ControlPrivilege::CONTROL | ControlPrivilege::EXCLUSIVE)
                    {
                        warn!("control privilege lost");
                        shared.is_controller.store(false, Ordering::Relaxed);
                        shared.notify_control_lost();
                    }
                    break;
                }
                Err(err) if Instant::now() < give_up => {
                    debug!(error = %err, "heartbeat read failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled_wait() => return,
                        _ = sleep(RETRY_DELAY) => {}
                    }
                }
                Err(err) => {
                    warn!(error = %err, "heartbeat read kept failing, skipping beat");
                    break;
                }
            }
        }
    }
    debug!("heartbeat stopped");
}
