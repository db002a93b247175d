//! Interrupt-context capture.
//!
//! Everything here runs when the hardware signals a sample: no blocking,
//! no allocation, no error reporting beyond counters.


mod gate;

use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) use gate::IrqGate;

use crate::cap::CapabilitySet;
use crate::device::PerCoreDevice;
use crate::ffi::msr::*;
use crate::hw::Hardware;
use crate::sample::record::{fetch, op, LocalRecord};
use crate::sample::Flavor;
use crate::workaround::Workarounds;

/// Whether an interrupt was ours.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqReturn {
    Handled,
    NotHandled,
}

/// Interrupt counters.
#[derive(Debug, Default)]
pub struct IrqStats {
    handled: AtomicU64,
    declined: AtomicU64,
    hw_errors: AtomicU64,
    workaround_errors: AtomicU64,
}

impl IrqStats {
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    /// Interrupts that were not for a flavor this driver manages.
    pub fn declined(&self) -> u64 {
        self.declined.load(Ordering::Relaxed)
    }

    /// Register accesses that failed while capturing.
    pub fn hw_errors(&self) -> u64 {
        self.hw_errors.load(Ordering::Relaxed)
    }

    pub fn workaround_errors(&self) -> u64 {
        self.workaround_errors.load(Ordering::Relaxed)
    }

    pub(crate) fn record(&self, ret: IrqReturn) {
        let counter = match ret {
            IrqReturn::Handled => &self.handled,
            IrqReturn::NotHandled => &self.declined,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The only view of a device interrupt-context code gets.
pub struct IrqContext<'a> {
    dev: &'a PerCoreDevice,
}

impl<'a> IrqContext<'a> {
    pub(crate) fn new(dev: &'a PerCoreDevice) -> Self {
        Self { dev }
    }

    pub fn core(&self) -> u32 {
        self.dev.core()
    }

    pub fn flavor(&self) -> Flavor {
        self.dev.flavor()
    }

    pub fn is_active(&self) -> bool {
        self.dev.is_active()
    }

    /// Stores a record, dropping it if the buffer is full.
    pub fn try_push(&self, record: &LocalRecord) -> bool {
        self.dev.buffer().try_push(&record.bytes())
    }

    /// Wakes blocked readers and pollers later, from schedulable context.
    pub fn schedule_wake(&self) {
        self.dev.deferred_wake().schedule();
    }
}

struct Reader<'a> {
    hw: &'a dyn Hardware,
    core: u32,
    stats: &'a IrqStats,
}

impl Reader<'_> {
    fn read(&self, msr: u32) -> u64 {
        self.hw.read_msr(self.core, msr).unwrap_or_else(|_| {
            self.stats.hw_errors.fetch_add(1, Ordering::Relaxed);
            0
        })
    }
}

/// Captures a latched sample of `ctx`'s flavor, if there is one.
pub(crate) fn handle(ctx: &IrqContext<'_>, hw: &dyn Hardware, errata: &Workarounds, stats: &IrqStats) -> bool {
    if !ctx.is_active() {
        return false;
    }
    let flavor = ctx.flavor();
    let core = ctx.core();
    let reader = Reader { hw, core, stats };

    let ctl = match hw.read_msr(core, flavor.ctl_msr()) {
        Ok(ctl) => ctl,
        Err(_) => {
            stats.hw_errors.fetch_add(1, Ordering::Relaxed);
            return false;
        }
    };
    if ctl & flavor.valid_bit() == 0 {
        return false;
    }

    let caps = ctx.dev.caps();
    let mut record = LocalRecord::new(flavor);
    match flavor {
        Flavor::Op => read_op(&reader, caps, ctl, &mut record),
        Flavor::Fetch => read_fetch(&reader, caps, ctl, &mut record),
    }
    record.set(
        match flavor {
            Flavor::Op => op::TSC,
            Flavor::Fetch => fetch::TSC,
        },
        hw.timestamp(),
    );

    let failed = errata.capture(hw, core, &mut record);
    stats.workaround_errors.fetch_add(failed, Ordering::Relaxed);

    ctx.try_push(&record);

    // A concurrent disable already cleared the enable bit, leave it off.
    if ctx.is_active() {
        let rearm = (ctl & !(flavor.valid_bit() | flavor.cur_cnt_mask())) | flavor.enable_bit();
        if hw.write_msr(core, flavor.ctl_msr(), rearm).is_err() {
            stats.hw_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    ctx.schedule_wake();
    true
}

fn read_op(r: &Reader<'_>, caps: &CapabilitySet, ctl: u64, record: &mut LocalRecord) {
    record.set(op::CTL, ctl);
    record.set(op::RIP, r.read(IBS_OP_RIP));
    record.set(op::DATA, r.read(IBS_OP_DATA));
    record.set(op::DATA2, r.read(IBS_OP_DATA2));
    record.set(op::DATA3, r.read(IBS_OP_DATA3));
    if caps.op_data4 {
        record.set(op::DATA4, r.read(IBS_OP_DATA4));
    }
    record.set(op::DC_LIN_AD, r.read(IBS_DC_LIN_AD));
    record.set(op::DC_PHYS_AD, r.read(IBS_DC_PHYS_AD));
    if caps.branch_target {
        record.set(op::BR_TARGET, r.read(IBS_BR_TARGET));
    }
    record.set(op::CPU, r.core as u64);
}

fn read_fetch(r: &Reader<'_>, caps: &CapabilitySet, ctl: u64, record: &mut LocalRecord) {
    record.set(fetch::CTL, ctl);
    if caps.fetch_ctl_extd {
        record.set(fetch::CTL_EXTD, r.read(IBS_FETCH_CTL_EXTD));
    }
    record.set(fetch::LIN_AD, r.read(IBS_FETCH_LIN_AD));
    record.set(fetch::PHYS_AD, r.read(IBS_FETCH_PHYS_AD));
    record.set(fetch::CPU, r.core as u64);
}
