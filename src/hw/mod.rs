//! Host hardware boundary.

#[cfg(test)]
pub(crate) mod sim;
#[cfg(test)]
mod test;

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Error, ErrorKind, Result};
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use crate::cap::CpuIdent;
use crate::ffi::syscall::{pread_u64, pwrite_u64, rdtsc};

/// Access to the CPUs the driver samples.
///
/// The MSR accessors and [`timestamp`][Self::timestamp] are called from the
/// capture handler. For a core between [`prepare_core`][Self::prepare_core]
/// and [`release_core`][Self::release_core] they must neither block nor
/// allocate. Everything else runs in schedulable context.
pub trait Hardware: Send + Sync + 'static {
    fn ident(&self) -> Result<CpuIdent>;

    /// Every core the system could ever bring online.
    fn possible_cores(&self) -> Result<Vec<u32>>;

    fn online_cores(&self) -> Result<Vec<u32>>;

    fn read_msr(&self, core: u32, msr: u32) -> Result<u64>;

    fn write_msr(&self, core: u32, msr: u32, val: u64) -> Result<()>;

    /// Routes the IBS local vector table entry at `lvt_offset` to NMI on `core`.
    ///
    /// Hosts where the platform already owns the APIC keep the default.
    fn route_nmi(&self, core: u32, lvt_offset: u8) -> Result<()> {
        let _ = (core, lvt_offset);
        Ok(())
    }

    fn timestamp(&self) -> u64;

    /// Readies register access to `core` before it takes interrupts.
    fn prepare_core(&self, core: u32) -> Result<()> {
        let _ = core;
        Ok(())
    }

    /// Undoes [`prepare_core`][Self::prepare_core] once `core` takes no more interrupts.
    fn release_core(&self, core: u32) {
        let _ = core;
    }
}

/// [`Hardware`] backed by the Linux `msr` driver and `cpuid`.
///
/// Prepared cores keep their MSR device open. Any other core has its device
/// opened per access.
#[derive(Debug)]
pub struct MsrHardware {
    root: PathBuf,
    files: RwLock<BTreeMap<u32, File>>,
}

impl MsrHardware {
    pub fn new() -> Self {
        Self::with_root("/dev/cpu")
    }

    /// Uses `<root>/<core>/msr` as the MSR device of each core.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: RwLock::new(BTreeMap::new()),
        }
    }

    fn open(&self, core: u32, write: bool) -> Result<File> {
        let path = self.root.join(core.to_string()).join("msr");
        OpenOptions::new().read(true).write(write).open(path)
    }

    fn with_file<T>(&self, core: u32, write: bool, f: impl FnOnce(&File) -> Result<T>) -> Result<T> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        match files.get(&core) {
            Some(file) => f(file),
            None => {
                drop(files);
                f(&self.open(core, write)?)
            }
        }
    }
}

impl Default for MsrHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl Hardware for MsrHardware {
    fn ident(&self) -> Result<CpuIdent> {
        CpuIdent::read()
    }

    fn possible_cores(&self) -> Result<Vec<u32>> {
        parse_cpu_list(&fs::read_to_string("/sys/devices/system/cpu/possible")?)
    }

    fn online_cores(&self) -> Result<Vec<u32>> {
        parse_cpu_list(&fs::read_to_string("/sys/devices/system/cpu/online")?)
    }

    fn read_msr(&self, core: u32, msr: u32) -> Result<u64> {
        self.with_file(core, false, |file| pread_u64(file, msr as _))
    }

    fn write_msr(&self, core: u32, msr: u32, val: u64) -> Result<()> {
        self.with_file(core, true, |file| pwrite_u64(file, msr as _, val))
    }

    fn timestamp(&self) -> u64 {
        rdtsc()
    }

    fn prepare_core(&self, core: u32) -> Result<()> {
        let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
        if !files.contains_key(&core) {
            files.insert(core, self.open(core, true)?);
        }
        Ok(())
    }

    fn release_core(&self, core: u32) {
        let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
        files.remove(&core);
    }
}

/// Parses a kernel CPU list such as `0-3,8,10-11`.
pub fn parse_cpu_list(s: &str) -> Result<Vec<u32>> {
    let invalid = |part: &str| Error::new(ErrorKind::InvalidData, format!("bad cpu list: {part:?}"));
    let mut cores = vec![];
    for part in s.trim().split(',').filter(|it| !it.is_empty()) {
        let parse = |it: &str| it.trim().parse::<u32>().map_err(|_| invalid(part));
        match part.split_once('-') {
            Some((lo, hi)) => {
                let (lo, hi) = (parse(lo)?, parse(hi)?);
                if lo > hi {
                    return Err(invalid(part));
                }
                cores.extend(lo..=hi);
            }
            None => cores.push(parse(part)?),
        }
    }
    Ok(cores)
}
