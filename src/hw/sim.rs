//! Simulated CPUs for tests.

use std::collections::{HashMap, HashSet};
use std::io::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::Hardware;
use crate::cap::CpuIdent;
use crate::ffi::msr::*;
use crate::ffi::EXT_FEATURE_IBS;
use crate::sample::Flavor;

pub struct SimHardware {
    ident: CpuIdent,
    possible: Vec<u32>,
    online: Mutex<Vec<u32>>,
    msrs: Mutex<HashMap<(u32, u32), u64>>,
    writes: Mutex<Vec<(u32, u32, u64)>>,
    failing: Mutex<HashSet<u32>>,
    routed: Mutex<Vec<(u32, u8)>>,
    tsc: AtomicU64,
}

impl SimHardware {
    /// A Zen-like CPU with every IBS capability.
    pub fn zen(cores: u32) -> Self {
        Self::new(ident(0x17, 0x31), cores)
    }

    pub fn new(ident: CpuIdent, cores: u32) -> Self {
        let possible: Vec<_> = (0..cores).collect();
        let msrs = possible
            .iter()
            .map(|&core| ((core, IBS_CONTROL), IBS_LVT_OFFSET_VAL | 1))
            .collect();
        Self {
            ident,
            online: Mutex::new(possible.clone()),
            possible,
            msrs: Mutex::new(msrs),
            writes: Mutex::new(vec![]),
            failing: Mutex::new(HashSet::new()),
            routed: Mutex::new(vec![]),
            tsc: AtomicU64::new(0),
        }
    }

    pub fn set_online(&self, cores: &[u32]) {
        *self.online.lock().unwrap() = cores.to_vec();
    }

    pub fn set_msr(&self, core: u32, msr: u32, val: u64) {
        self.msrs.lock().unwrap().insert((core, msr), val);
    }

    pub fn msr(&self, core: u32, msr: u32) -> u64 {
        self.msrs.lock().unwrap().get(&(core, msr)).copied().unwrap_or(0)
    }

    /// Values written to `msr` on `core`, oldest first.
    pub fn writes_to(&self, core: u32, msr: u32) -> Vec<u64> {
        let writes = self.writes.lock().unwrap();
        writes
            .iter()
            .filter(|(c, m, _)| *c == core && *m == msr)
            .map(|(_, _, v)| *v)
            .collect()
    }

    pub fn fail_msr(&self, msr: u32) {
        self.failing.lock().unwrap().insert(msr);
    }

    pub fn routed(&self) -> Vec<(u32, u8)> {
        self.routed.lock().unwrap().clone()
    }

    /// Latches a sample for `flavor` on `core` as the hardware would.
    pub fn latch(&self, core: u32, flavor: Flavor, tag: u64) {
        let mut msrs = self.msrs.lock().unwrap();
        let (ctl, val, data) = match flavor {
            Flavor::Op => (IBS_OP_CTL, IBS_OP_VAL, IBS_OP_RIP),
            Flavor::Fetch => (IBS_FETCH_CTL, IBS_FETCH_VAL, IBS_FETCH_LIN_AD),
        };
        *msrs.entry((core, ctl)).or_default() |= val;
        msrs.insert((core, data), tag);
    }
}

pub fn ident(family: u32, model: u32) -> CpuIdent {
    CpuIdent {
        vendor: "AuthenticAMD".to_string(),
        family,
        model,
        stepping: 0,
        ext_features: EXT_FEATURE_IBS,
        ibs_caps: 0x7ff,
    }
}

impl Hardware for SimHardware {
    fn ident(&self) -> Result<CpuIdent> {
        Ok(self.ident.clone())
    }

    fn possible_cores(&self) -> Result<Vec<u32>> {
        Ok(self.possible.clone())
    }

    fn online_cores(&self) -> Result<Vec<u32>> {
        Ok(self.online.lock().unwrap().clone())
    }

    fn read_msr(&self, core: u32, msr: u32) -> Result<u64> {
        if self.failing.lock().unwrap().contains(&msr) {
            return Err(Error::other("simulated #GP"));
        }
        Ok(self.msr(core, msr))
    }

    fn write_msr(&self, core: u32, msr: u32, val: u64) -> Result<()> {
        if self.failing.lock().unwrap().contains(&msr) {
            return Err(Error::other("simulated #GP"));
        }
        self.writes.lock().unwrap().push((core, msr, val));
        self.set_msr(core, msr, val);
        Ok(())
    }

    fn route_nmi(&self, core: u32, lvt_offset: u8) -> Result<()> {
        self.routed.lock().unwrap().push((core, lvt_offset));
        Ok(())
    }

    fn timestamp(&self) -> u64 {
        self.tsc.fetch_add(1, Ordering::Relaxed)
    }
}
