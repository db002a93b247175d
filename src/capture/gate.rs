use std::hint::spin_loop;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Per-core switch for interrupt delivery.
///
/// Closing the gate waits for handlers already inside to leave, so state
/// they touch may be torn down right after [`close`][Self::close] returns.
#[derive(Debug, Default)]
pub(crate) struct IrqGate {
    open: AtomicBool,
    in_flight: AtomicU32,
}

pub(crate) struct GateGuard<'a>(&'a IrqGate);

impl IrqGate {
    /// Enters from interrupt context. Never blocks.
    pub fn enter(&self) -> Option<GateGuard<'_>> {
        // SeqCst on both sides: either `close` sees this increment or this sees the gate closed.
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if !self.open.load(Ordering::SeqCst) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(GateGuard(self))
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        while self.in_flight.load(Ordering::SeqCst) != 0 {
            spin_loop();
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
