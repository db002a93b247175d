//! Errata workarounds.
//!
//! Each [`Erratum`] set in [`WorkaroundFlags`] maps to one [`Workaround`]
//! strategy. Strategies run in flag definition order.

#[cfg(test)]
mod test;

use std::collections::BTreeMap;
use std::io::Result;
use std::sync::{Mutex, PoisonError};

use log::{info, warn};

use crate::cap::{Erratum, WorkaroundFlags};
use crate::ffi::msr::*;
use crate::hw::Hardware;
use crate::sample::record::{op, LocalRecord};
use crate::sample::Flavor;
use crate::Error;

/// Hooks of one erratum workaround.
///
/// Per-core hooks may be redelivered and must be idempotent.
pub trait Workaround: Send + Sync {
    fn erratum(&self) -> Erratum;

    /// Runs once before any core is used. Failure aborts the driver load.
    fn on_install(&self, hw: &dyn Hardware) -> Result<()> {
        let _ = hw;
        Ok(())
    }

    /// Runs once at unload, after every core stopped sampling.
    fn on_teardown(&self, hw: &dyn Hardware) {
        let _ = hw;
    }

    fn on_core_online(&self, hw: &dyn Hardware, core: u32) -> Result<()> {
        let _ = (hw, core);
        Ok(())
    }

    fn on_core_offline(&self, hw: &dyn Hardware, core: u32) -> Result<()> {
        let _ = (hw, core);
        Ok(())
    }

    /// Runs in interrupt context after a record was read.
    ///
    /// Must not block or allocate.
    fn on_capture(&self, hw: &dyn Hardware, core: u32, record: &mut LocalRecord) -> Result<()> {
        let _ = (hw, core, record);
        Ok(())
    }

    /// Runs before the control register of `flavor` is written with sampling disabled.
    fn before_disable(&self, hw: &dyn Hardware, core: u32, flavor: Flavor, ctl: u64) -> Result<()> {
        let _ = (hw, core, flavor, ctl);
        Ok(())
    }
}

/// Family 10h erratum 420.
///
/// The count field must be cleared while the sampler is still enabled,
/// otherwise the interrupt may never clear.
pub struct Fam10hErr420;

impl Workaround for Fam10hErr420 {
    fn erratum(&self) -> Erratum {
        Erratum::Fam10hErr420
    }

    fn before_disable(&self, hw: &dyn Hardware, core: u32, flavor: Flavor, ctl: u64) -> Result<()> {
        hw.write_msr(core, flavor.ctl_msr(), ctl & !flavor.max_cnt_mask())
    }
}

/// Family 15h models 00h-1Fh erratum 718.
pub struct Fam15hErr718;

impl Workaround for Fam15hErr718 {
    fn erratum(&self) -> Erratum {
        Erratum::Fam15hErr718
    }

    fn on_capture(&self, hw: &dyn Hardware, core: u32, record: &mut LocalRecord) -> Result<()> {
        if record.flavor() != Flavor::Op {
            return Ok(());
        }
        let data3 = record.get(op::DATA3);
        if data3 & IBS_OP_DATA3_STICKY == 0 {
            return Ok(());
        }
        hw.write_msr(core, IBS_OP_DATA3, data3 & !IBS_OP_DATA3_STICKY)
    }
}

/// Family 17h model 01h.
///
/// Sets the per-core bits that turn IBS on, remembering the firmware values
/// so they can be restored.
#[derive(Default)]
pub struct Fam17hM01h {
    saved: Mutex<BTreeMap<u32, [u64; FAM17H_M01H_ENABLE.len()]>>,
}

impl Fam17hM01h {
    fn restore(&self, hw: &dyn Hardware, core: u32) -> Result<()> {
        let saved = self
            .saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&core);
        let Some(saved) = saved else {
            return Ok(());
        };
        for ((msr, _), val) in FAM17H_M01H_ENABLE.iter().zip(saved) {
            hw.write_msr(core, *msr, val)?;
        }
        Ok(())
    }
}

impl Workaround for Fam17hM01h {
    fn erratum(&self) -> Erratum {
        Erratum::Fam17hM01h
    }

    fn on_install(&self, hw: &dyn Hardware) -> Result<()> {
        // The enable registers must at least be readable.
        if let Some(&core) = hw.online_cores()?.first() {
            for (msr, _) in FAM17H_M01H_ENABLE {
                hw.read_msr(core, msr)?;
            }
        }
        Ok(())
    }

    fn on_teardown(&self, hw: &dyn Hardware) {
        let cores: Vec<_> = {
            let saved = self.saved.lock().unwrap_or_else(PoisonError::into_inner);
            saved.keys().copied().collect()
        };
        for core in cores {
            if let Err(e) = self.restore(hw, core) {
                warn!("IBS: failed to restore core {} configuration: {}", core, e);
            }
        }
    }

    fn on_core_online(&self, hw: &dyn Hardware, core: u32) -> Result<()> {
        let mut saved = self.saved.lock().unwrap_or_else(PoisonError::into_inner);
        if !saved.contains_key(&core) {
            let mut old = [0; FAM17H_M01H_ENABLE.len()];
            for (slot, (msr, _)) in old.iter_mut().zip(FAM17H_M01H_ENABLE) {
                *slot = hw.read_msr(core, msr)?;
            }
            saved.insert(core, old);
        }
        for (msr, bits) in FAM17H_M01H_ENABLE {
            let val = hw.read_msr(core, msr)?;
            if val & bits != bits {
                hw.write_msr(core, msr, val | bits)?;
            }
        }
        Ok(())
    }

    fn on_core_offline(&self, hw: &dyn Hardware, core: u32) -> Result<()> {
        self.restore(hw, core)
    }
}

/// Active workaround strategies.
pub struct Workarounds(Vec<Box<dyn Workaround>>);

impl Workarounds {
    pub fn for_flags(flags: &WorkaroundFlags) -> Self {
        let list = flags
            .active()
            .map(|erratum| -> Box<dyn Workaround> {
                match erratum {
                    Erratum::Fam10hErr420 => Box::new(Fam10hErr420),
                    Erratum::Fam15hErr718 => Box::new(Fam15hErr718),
                    Erratum::Fam17hM01h => Box::new(Fam17hM01h::default()),
                }
            })
            .collect();
        Self(list)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn errata(&self) -> impl Iterator<Item = Erratum> + '_ {
        self.0.iter().map(|it| it.erratum())
    }

    /// Installs every strategy, tearing down the installed ones on failure.
    pub fn install(&self, hw: &dyn Hardware) -> crate::Result<()> {
        for (i, it) in self.0.iter().enumerate() {
            if let Err(source) = it.on_install(hw) {
                for done in self.0[..i].iter().rev() {
                    done.on_teardown(hw);
                }
                return Err(Error::Workaround {
                    erratum: it.erratum(),
                    source,
                });
            }
        }
        Ok(())
    }

    pub fn teardown(&self, hw: &dyn Hardware) {
        for it in self.0.iter().rev() {
            it.on_teardown(hw);
        }
    }

    /// Runs the online hooks. Failures leave the core degraded and are only logged.
    pub fn core_online(&self, hw: &dyn Hardware, core: u32) -> usize {
        let mut failed = 0;
        for it in &self.0 {
            match it.on_core_online(hw, core) {
                Ok(()) => info!("IBS: {} workaround active on core {}", it.erratum(), core),
                Err(e) => {
                    warn!("IBS: {} workaround failed on core {}: {}", it.erratum(), core, e);
                    failed += 1;
                }
            }
        }
        failed
    }

    pub fn core_offline(&self, hw: &dyn Hardware, core: u32) -> usize {
        let mut failed = 0;
        for it in &self.0 {
            if let Err(e) = it.on_core_offline(hw, core) {
                warn!("IBS: {} workaround teardown failed on core {}: {}", it.erratum(), core, e);
                failed += 1;
            }
        }
        failed
    }

    /// Interrupt-context corrections, returns the number of failed hooks.
    pub fn capture(&self, hw: &dyn Hardware, core: u32, record: &mut LocalRecord) -> u64 {
        let mut failed = 0;
        for it in &self.0 {
            if it.on_capture(hw, core, record).is_err() {
                failed += 1;
            }
        }
        failed
    }

    pub fn before_disable(&self, hw: &dyn Hardware, core: u32, flavor: Flavor, ctl: u64) -> Result<()> {
        for it in &self.0 {
            it.before_disable(hw, core, flavor, ctl)?;
        }
        Ok(())
    }
}
