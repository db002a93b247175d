use std::io::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::warn;

use super::PerCoreDevice;

const SHUTDOWN: usize = usize::MAX;

/// Moves waking a device's waiters out of interrupt context.
///
/// Scheduling is coalesced: at most one wake per device is queued at a time.
pub(crate) struct DeferredWake {
    slot: usize,
    pending: AtomicBool,
    tx: SyncSender<usize>,
}

impl DeferredWake {
    /// Queues a wake for the worker. Never blocks and never allocates.
    pub fn schedule(&self) {
        if self.pending.swap(true, Ordering::AcqRel) {
            return;
        }
        // The queue has room for every device, so this only fails once the worker is gone.
        if self.tx.try_send(self.slot).is_err() {
            self.pending.store(false, Ordering::Release);
        }
    }

    /// Called by the worker before waking, so records pushed from now on queue a new wake.
    pub fn clear(&self) {
        self.pending.store(false, Ordering::Release);
    }
}

/// The worker thread running deferred wakes.
pub(crate) struct WakeQueue {
    tx: SyncSender<usize>,
    worker: Option<JoinHandle<()>>,
}

/// Receiving end of a [`WakeQueue`], handed to [`WakeQueue::start`].
pub(crate) struct WakeRx(Receiver<usize>);

impl WakeQueue {
    pub fn new(slots: usize) -> (Self, WakeRx) {
        let (tx, rx) = sync_channel(slots + 1);
        (Self { tx, worker: None }, WakeRx(rx))
    }

    pub fn handle(&self, slot: usize) -> DeferredWake {
        DeferredWake {
            slot,
            pending: AtomicBool::new(false),
            tx: self.tx.clone(),
        }
    }

    /// Starts the worker. `devices[slot]` must be the owner of [`handle(slot)`][Self::handle].
    pub fn start(&mut self, WakeRx(rx): WakeRx, devices: Vec<Arc<PerCoreDevice>>) -> Result<()> {
        let worker = thread::Builder::new()
            .name("ibs-wake".to_string())
            .spawn(move || {
                while let Ok(slot) = rx.recv() {
                    match devices.get(slot) {
                        Some(dev) => dev.wake_waiters(),
                        None => break,
                    }
                }
            })?;
        self.worker = Some(worker);
        Ok(())
    }

    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.tx.send(SHUTDOWN);
        if worker.join().is_err() {
            warn!("IBS: wake worker panicked");
        }
    }
}

impl Drop for WakeQueue {
    fn drop(&mut self) {
        self.stop();
    }
}
