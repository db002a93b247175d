//! Per-core sampling endpoints.
//!
//! A [`PerCoreDevice`] exists for every (possible core, flavor) pair from
//! driver load to unload. Consumers [`open`][PerCoreDevice::open] it to get
//! an exclusive [`Handle`].


mod wake;

use std::slice::ChunksExact;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::future::poll_fn;
use futures::task::AtomicWaker;
use log::{debug, warn};
pub(crate) use wake::{DeferredWake, WakeQueue};

use crate::cap::{CapabilitySet, WorkaroundFlags};
use crate::config::Config;
use crate::ffi::msr::*;
use crate::hw::Hardware;
use crate::sample::{Accounting, BufferStats, Flavor, SampleBuffer};
use crate::workaround::Workarounds;
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Liveness {
    Live,
    Offline,
    Unloaded,
}

struct State {
    live: Liveness,
    // Bumped whenever the endpoint goes away, so handles opened before are stale.
    epoch: u64,
}

struct Control {
    max_count: u32,
}

/// What a device is built from.
pub(crate) struct DeviceEnv<'a> {
    pub hw: &'a Arc<dyn Hardware>,
    pub errata: &'a Arc<Workarounds>,
    pub caps: CapabilitySet,
    pub workarounds: WorkaroundFlags,
    pub config: &'a Config,
    pub accounting: &'a Accounting,
}

/// Sampling state of one (core, flavor) endpoint.
pub struct PerCoreDevice {
    core: u32,
    flavor: Flavor,
    caps: CapabilitySet,
    workarounds: WorkaroundFlags,
    buffer: SampleBuffer,
    in_use: AtomicBool,
    // Mirrors the enable bit for the capture handler, which never takes `ctl_lock`.
    active: AtomicBool,
    poll_threshold: AtomicUsize,
    ctl_lock: Mutex<Control>,
    state: Mutex<State>,
    data_ready: Condvar,
    poll_ready: AtomicWaker,
    wake: DeferredWake,
    hw: Arc<dyn Hardware>,
    errata: Arc<Workarounds>,
}

impl PerCoreDevice {
    pub(crate) fn new(env: &DeviceEnv<'_>, core: u32, flavor: Flavor, wake: DeferredWake) -> Result<Self> {
        let buffer = SampleBuffer::new(flavor.record_size(), env.config.buffer_size, env.accounting)?;
        Ok(Self {
            core,
            flavor,
            caps: env.caps,
            workarounds: env.workarounds,
            buffer,
            in_use: AtomicBool::new(false),
            active: AtomicBool::new(false),
            poll_threshold: AtomicUsize::new(env.config.poll_threshold),
            ctl_lock: Mutex::new(Control {
                max_count: env.config.max_count,
            }),
            state: Mutex::new(State {
                live: Liveness::Offline,
                epoch: 0,
            }),
            data_ready: Condvar::new(),
            poll_ready: AtomicWaker::new(),
            wake,
            hw: env.hw.clone(),
            errata: env.errata.clone(),
        })
    }

    pub fn core(&self) -> u32 {
        self.core
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    pub fn record_size(&self) -> usize {
        self.buffer.record_size()
    }

    /// Capabilities as detected when the device was created.
    pub fn caps(&self) -> &CapabilitySet {
        &self.caps
    }

    pub fn workarounds(&self) -> &WorkaroundFlags {
        &self.workarounds
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Whether sampling is enabled.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> BufferStats {
        self.buffer.stats()
    }

    pub(crate) fn buffer(&self) -> &SampleBuffer {
        &self.buffer
    }

    pub(crate) fn deferred_wake(&self) -> &DeferredWake {
        &self.wake
    }

    /// Opens the endpoint exclusively.
    pub fn open(self: &Arc<Self>) -> Result<Handle> {
        if self
            .in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("IBS: {} on core {} already open", self.flavor, self.core);
            return Err(Error::Busy);
        }

        let state = self.lock_state();
        if state.live != Liveness::Live {
            let err = match state.live {
                Liveness::Unloaded => Error::Unloaded,
                _ => Error::Offline,
            };
            drop(state);
            self.in_use.store(false, Ordering::Release);
            return Err(err);
        }

        Ok(Handle {
            dev: self.clone(),
            epoch: state.epoch,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_ctl(&self) -> MutexGuard<'_, Control> {
        self.ctl_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        // Taking the lock orders this against a reader between its check and its wait.
        drop(self.lock_state());
        self.data_ready.notify_all();
        self.poll_ready.wake();
    }

    pub(crate) fn wake_waiters(&self) {
        self.wake.clear();
        self.notify();
    }

    pub(crate) fn mark_online(&self) {
        let mut state = self.lock_state();
        if state.live == Liveness::Offline {
            state.live = Liveness::Live;
        }
    }

    /// Fails every current handle with [`Error::Offline`].
    pub(crate) fn mark_offline(&self) {
        let mut state = self.lock_state();
        if state.live == Liveness::Live {
            state.live = Liveness::Offline;
        }
        state.epoch += 1;
        drop(state);
        self.notify();
    }

    /// Fails every current and future handle with [`Error::Unloaded`].
    pub(crate) fn mark_unloaded(&self) {
        let mut state = self.lock_state();
        state.live = Liveness::Unloaded;
        state.epoch += 1;
        drop(state);
        self.notify();
    }

    /// Stops sampling, as on core shutdown.
    pub(crate) fn disable_sampling(&self) -> Result<()> {
        let _ctl = self.lock_ctl();
        self.disable_locked()
    }

    /// Stops sampling if a handle left it running.
    pub(crate) fn quiesce(&self) -> Result<()> {
        let _ctl = self.lock_ctl();
        match self.is_active() {
            true => self.disable_locked(),
            false => Ok(()),
        }
    }

    fn enable_locked(&self, ctl: &Control) -> Result<()> {
        let bits = match self.flavor {
            Flavor::Op => op_max_cnt_bits(ctl.max_count) | IBS_OP_EN,
            Flavor::Fetch => (ctl.max_count as u64 & IBS_FETCH_MAX_CNT) | IBS_FETCH_EN,
        };
        // Set first so the very first sample is not declined.
        self.active.store(true, Ordering::Release);
        if let Err(e) = self.hw.write_msr(self.core, self.flavor.ctl_msr(), bits) {
            self.active.store(false, Ordering::Release);
            return Err(e.into());
        }
        Ok(())
    }

    fn disable_locked(&self) -> Result<()> {
        // Cleared first so the capture handler stops re-arming.
        let was_active = self.active.swap(false, Ordering::AcqRel);
        let result = self.write_disable();
        if result.is_err() {
            // The sampler may still be running, keep capturing its samples.
            self.active.store(was_active, Ordering::Release);
        }
        result
    }

    fn write_disable(&self) -> Result<()> {
        let msr = self.flavor.ctl_msr();
        let ctl = self.hw.read_msr(self.core, msr)?;
        self.errata
            .before_disable(&*self.hw, self.core, self.flavor, ctl)?;
        let off = ctl & !(self.flavor.enable_bit() | self.flavor.valid_bit());
        self.hw.write_msr(self.core, msr, off)?;
        Ok(())
    }

    fn max_count_limit(&self) -> u32 {
        match (self.flavor, self.caps.op_count_ext) {
            (Flavor::Op, true) => OP_MAX_CNT_EXT_LIMIT,
            _ => MAX_CNT_LIMIT,
        }
    }

    fn is_poll_ready(&self) -> bool {
        let threshold = self.poll_threshold.load(Ordering::Acquire);
        self.buffer.readiness_level() >= threshold.max(1)
    }
}

/// Whole records read from an endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Records {
    record_size: usize,
    bytes: Vec<u8>,
}

impl Records {
    fn empty(record_size: usize) -> Self {
        Self {
            record_size,
            bytes: vec![],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len() / self.record_size
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    pub fn iter(&self) -> ChunksExact<'_, u8> {
        self.bytes.chunks_exact(self.record_size)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl<'a> IntoIterator for &'a Records {
    type Item = &'a [u8];
    type IntoIter = ChunksExact<'a, u8>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Cancels blocked and future reads of one [`Handle`].
#[derive(Clone)]
pub struct Canceller {
    dev: Arc<PerCoreDevice>,
    cancelled: Arc<AtomicBool>,
}

impl Canceller {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.dev.notify();
    }
}

/// Exclusive access to an endpoint.
///
/// Dropping the handle stops sampling and releases the endpoint.
pub struct Handle {
    dev: Arc<PerCoreDevice>,
    epoch: u64,
    cancelled: Arc<AtomicBool>,
}

impl Handle {
    pub fn device(&self) -> &PerCoreDevice {
        &self.dev
    }

    pub fn canceller(&self) -> Canceller {
        Canceller {
            dev: self.dev.clone(),
            cancelled: self.cancelled.clone(),
        }
    }

    fn check(&self, state: &State) -> Result<()> {
        if state.live == Liveness::Unloaded {
            return Err(Error::Unloaded);
        }
        if state.live != Liveness::Live || state.epoch != self.epoch {
            return Err(Error::Offline);
        }
        if self.cancelled.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn pop(&self, max: usize) -> Records {
        let mut bytes = vec![];
        self.dev.buffer.pop(max, &mut bytes);
        Records {
            record_size: self.dev.record_size(),
            bytes,
        }
    }

    /// Reads up to `max` records, blocking until at least one is available.
    ///
    /// Returns empty records if `timeout` elapses first. Fails if the core
    /// goes offline, the driver unloads, or the read is cancelled while
    /// waiting.
    pub fn read(&self, max: usize, timeout: Option<Duration>) -> Result<Records> {
        if max == 0 {
            return Err(Error::InvalidArgument("must read at least one record"));
        }
        let dev = &*self.dev;
        // A deadline past what `Instant` can hold is no deadline.
        let deadline = timeout.and_then(|it| Instant::now().checked_add(it));

        let mut state = dev.lock_state();
        loop {
            self.check(&state)?;
            if dev.buffer.readiness_level() > 0 {
                drop(state);
                let records = self.pop(max);
                if !records.is_empty() {
                    return Ok(records);
                }
                // Another thread reading through this handle got there first.
                state = dev.lock_state();
                continue;
            }
            state = match deadline {
                None => dev
                    .data_ready
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Records::empty(dev.record_size()));
                    }
                    dev.data_ready
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Reads up to `max` buffered records without blocking.
    pub fn try_read(&self, max: usize) -> Result<Records> {
        self.check(&self.dev.lock_state())?;
        Ok(self.pop(max))
    }

    /// Whether at least [`poll_threshold`][Self::poll_threshold] records are buffered.
    pub fn poll_ready(&self) -> Result<bool> {
        self.check(&self.dev.lock_state())?;
        Ok(self.dev.is_poll_ready())
    }

    /// Registers for a wake once the endpoint becomes poll-ready.
    pub fn poll_readable(&self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.dev.poll_ready.register(cx.waker());
        if let Err(e) = self.check(&self.dev.lock_state()) {
            return Poll::Ready(Err(e));
        }
        match self.dev.is_poll_ready() {
            true => Poll::Ready(Ok(())),
            false => Poll::Pending,
        }
    }

    /// Waits until the endpoint is poll-ready, then reads up to `max` records.
    pub async fn read_async(&self, max: usize) -> Result<Records> {
        if max == 0 {
            return Err(Error::InvalidArgument("must read at least one record"));
        }
        loop {
            poll_fn(|cx| self.poll_readable(cx)).await?;
            let records = self.try_read(max)?;
            if !records.is_empty() {
                return Ok(records);
            }
        }
    }

    /// Locks the control state of a still live endpoint.
    ///
    /// Teardown marks the endpoint before it takes `ctl_lock`, so nothing
    /// passing this check can re-arm the sampler after teardown.
    fn lock_live_ctl(&self) -> Result<MutexGuard<'_, Control>> {
        let ctl = self.dev.lock_ctl();
        self.check(&self.dev.lock_state())?;
        Ok(ctl)
    }

    pub fn enable(&self) -> Result<()> {
        let ctl = self.lock_live_ctl()?;
        self.dev.enable_locked(&ctl)
    }

    pub fn disable(&self) -> Result<()> {
        let _ctl = self.lock_live_ctl()?;
        self.dev.disable_locked()
    }

    /// Sets the max count, re-arming the sampler if it is running.
    pub fn set_max_count(&self, max_count: u32) -> Result<()> {
        if max_count == 0 || max_count > self.dev.max_count_limit() {
            return Err(Error::InvalidArgument("max count out of range"));
        }
        let mut ctl = self.lock_live_ctl()?;
        ctl.max_count = max_count;
        if self.dev.is_active() {
            self.dev.enable_locked(&ctl)?;
        }
        Ok(())
    }

    pub fn max_count(&self) -> u32 {
        self.dev.lock_ctl().max_count
    }

    pub fn set_poll_threshold(&self, records: usize) -> Result<()> {
        if records == 0 || records > self.dev.buffer.capacity() {
            return Err(Error::InvalidArgument("poll threshold out of range"));
        }
        let _ctl = self.dev.lock_ctl();
        self.dev.poll_threshold.store(records, Ordering::Release);
        Ok(())
    }

    pub fn poll_threshold(&self) -> usize {
        self.dev.poll_threshold.load(Ordering::Acquire)
    }

    /// Buffer capacity in records.
    pub fn capacity(&self) -> usize {
        self.dev.buffer.capacity()
    }

    pub fn reset_buffer(&self) -> Result<()> {
        let _ctl = self.lock_live_ctl()?;
        self.dev.buffer.reset();
        Ok(())
    }

    /// Records dropped because the buffer was full.
    pub fn lost(&self) -> u64 {
        self.dev.buffer.dropped()
    }

    pub fn stats(&self) -> BufferStats {
        self.dev.buffer.stats()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Err(e) = self.dev.quiesce() {
            warn!("IBS: failed to stop {} on core {}: {}", self.dev.flavor, self.dev.core, e);
        }
        self.dev.in_use.store(false, Ordering::Release);
    }
}
