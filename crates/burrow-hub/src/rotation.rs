//! Debounced background bucket rotation.
//!
//! Mutations notify the task instead of rotating inline; the task
//! waits for a quiet period before re-keying, so bursts of writes cost
//! one rotation. A hard ceiling bounds how long continuous activity
//! can postpone it.

use std::sync::Arc;
use std::time::Duration;

use burrow_core::config::RotationConfig;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::bucket::BucketIo;
use crate::hub::Hub;

enum Signal {
    Touch,
    Shutdown,
}

/// Control handle for a spawned rotation task.
pub struct RotationHandle {
    tx: mpsc::UnboundedSender<Signal>,
    task: JoinHandle<()>,
}

impl RotationHandle {
    /// Record activity. Cheap and non-blocking; safe after shutdown.
    pub fn notify(&self) {
        let _ = self.tx.send(Signal::Touch);
    }

    /// Stop the task, flushing a pending rotation first.
    pub async fn shutdown(self) {
        let _ = self.tx.send(Signal::Shutdown);
        if let Err(e) = self.task.await {
            warn!("rotation task panicked: {e}");
        }
    }
}

/// Spawn the rotation task over a shared hub. The hub slot may be
/// emptied (vault locked) while the task lives; rotation then skips.
pub fn spawn_rotation_task(
    hub: Arc<Mutex<Option<Hub>>>,
    io: BucketIo,
    config: RotationConfig,
) -> RotationHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(hub, io, config, rx));
    RotationHandle { tx, task }
}

async fn run(
    hub: Arc<Mutex<Option<Hub>>>,
    io: BucketIo,
    config: RotationConfig,
    mut rx: mpsc::UnboundedReceiver<Signal>,
) {
    let debounce = Duration::from_millis(config.debounce_ms);
    let max_delay = Duration::from_millis(config.max_delay_ms);

    loop {
        // Idle until something happens.
        match rx.recv().await {
            Some(Signal::Touch) => {}
            Some(Signal::Shutdown) | None => return,
        }

        let ceiling = Instant::now() + max_delay;
        let mut deadline = Instant::now() + debounce;
        let mut shutdown = false;

        loop {
            tokio::select! {
                _ = sleep_until(deadline.min(ceiling)) => break,
                msg = rx.recv() => match msg {
                    Some(Signal::Touch) => {
                        deadline = Instant::now() + debounce;
                    }
                    Some(Signal::Shutdown) | None => {
                        shutdown = true;
                        break;
                    }
                },
            }
        }

        rotate(&hub, &io).await;
        if shutdown {
            return;
        }
    }
}

async fn rotate(hub: &Arc<Mutex<Option<Hub>>>, io: &BucketIo) {
    // Store lock first, hub lock second, same order as foreground
    // mutations.
    let _store_lock = io.store().acquire().await;
    let mut slot = hub.lock().await;
    let Some(hub) = slot.as_mut() else {
        debug!("rotation skipped, vault is locked");
        return;
    };
    if let Err(e) = hub.rotate_buckets(io).await {
        warn!("bucket rotation failed: {e}");
    }
}
