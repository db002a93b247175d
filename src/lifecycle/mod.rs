//! Driver load, CPU hotplug and unload.
//!
//! The [`Driver`] owns a device pair for every possible core and publishes
//! endpoints only for cores that are online:
//!
//! ```text
//! load ──► UpPrepare ──► Online ──► DownPrepare ──► Dead ──► ... ──► unload
//!            │ publish     │ irq on     │ sampling off    │ irq off, unpublish
//!            └── UpCanceled (irq off, unpublish)
//! ```


mod registry;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use arrayvec::ArrayVec;
use log::{error, info, warn};
pub use registry::*;

use crate::cap::{detect, CapabilitySet, WorkaroundFlags};
use crate::capture::{self, IrqContext, IrqGate, IrqReturn, IrqStats};
use crate::config::Config;
use crate::device::{DeviceEnv, PerCoreDevice, WakeQueue};
use crate::ffi::msr::{IBS_CONTROL, IBS_LVT_OFFSET, IBS_LVT_OFFSET_VAL};
use crate::hw::Hardware;
use crate::sample::{Accounting, Flavor};
use crate::workaround::Workarounds;
use crate::{Error, Result};

/// CPU hotplug transitions, as delivered by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HotplugEvent {
    /// The core is about to come up. Failing this cancels the bring-up.
    UpPrepare,
    /// The core is up.
    Online,
    /// A prepared bring-up was abandoned.
    UpCanceled,
    /// The core is about to go down but still runs.
    DownPrepare,
    /// The core is gone.
    Dead,
}

#[derive(Debug, Default)]
struct Published {
    op: bool,
    fetch: bool,
}

impl Published {
    fn get(&self, flavor: Flavor) -> bool {
        match flavor {
            Flavor::Op => self.op,
            Flavor::Fetch => self.fetch,
        }
    }

    fn set(&mut self, flavor: Flavor, val: bool) {
        match flavor {
            Flavor::Op => self.op = val,
            Flavor::Fetch => self.fetch = val,
        }
    }
}

struct CoreSlot {
    op: Arc<PerCoreDevice>,
    fetch: Arc<PerCoreDevice>,
    // Held for the whole of a transition, so transitions of one core never overlap.
    published: Mutex<Published>,
    gate: IrqGate,
}

impl CoreSlot {
    fn device(&self, flavor: Flavor) -> &Arc<PerCoreDevice> {
        match flavor {
            Flavor::Op => &self.op,
            Flavor::Fetch => &self.fetch,
        }
    }
}

/// The sampling driver.
///
/// Dropping it is the same as [`unload`][Self::unload].
pub struct Driver {
    hw: Arc<dyn Hardware>,
    registry: Arc<dyn Registry>,
    caps: CapabilitySet,
    flags: WorkaroundFlags,
    errata: Arc<Workarounds>,
    // Flavors the CPU supports; only these are published or captured.
    flavors: ArrayVec<Flavor, 2>,
    cores: BTreeMap<u32, CoreSlot>,
    irq_registered: AtomicBool,
    irq_stats: IrqStats,
    wake: WakeQueue,
    accounting: Accounting,
    unloaded: bool,
}

impl Driver {
    /// Detects the CPU, allocates every device and publishes the online cores.
    ///
    /// On failure everything done so far is rolled back.
    pub fn load(hw: Arc<dyn Hardware>, registry: Arc<dyn Registry>, config: Config) -> Result<Self> {
        config.validate()?;
        let (caps, flags) = detect(&hw.ident()?)?;
        let mut possible = hw.possible_cores()?;
        possible.sort_unstable();
        possible.dedup();

        info!("Initializing IBS module");
        let errata = Arc::new(Workarounds::for_flags(&flags));
        errata.install(&*hw)?;

        let flavors = Flavor::ALL
            .into_iter()
            .filter(|it| match it {
                Flavor::Op => caps.op,
                Flavor::Fetch => caps.fetch,
            })
            .collect();

        let (wake, wake_rx) = WakeQueue::new(possible.len() * Flavor::ALL.len());
        // From here on, dropping `driver` undoes the load.
        let mut driver = Self {
            hw,
            registry,
            caps,
            flags,
            errata,
            flavors,
            cores: BTreeMap::new(),
            irq_registered: AtomicBool::new(false),
            irq_stats: IrqStats::default(),
            wake,
            accounting: Accounting::default(),
            unloaded: false,
        };

        let env = DeviceEnv {
            hw: &driver.hw,
            errata: &driver.errata,
            caps,
            workarounds: flags,
            config: &config,
            accounting: &driver.accounting,
        };
        let mut devices = Vec::with_capacity(possible.len() * Flavor::ALL.len());
        for &core in &possible {
            let mut alloc = |flavor: Flavor| -> Result<Arc<PerCoreDevice>> {
                let wake = driver.wake.handle(devices.len());
                let dev = PerCoreDevice::new(&env, core, flavor, wake).inspect_err(|e| {
                    error!("CPU {} failed to allocate IBS device buffer: {}", core, e);
                })?;
                let dev = Arc::new(dev);
                devices.push(dev.clone());
                Ok(dev)
            };
            let slot = CoreSlot {
                op: alloc(Flavor::Op)?,
                fetch: alloc(Flavor::Fetch)?,
                published: Mutex::new(Published::default()),
                gate: IrqGate::default(),
            };
            driver.cores.insert(core, slot);
        }
        driver.wake.start(wake_rx, devices)?;

        for core in driver.hw.online_cores()? {
            let Some(slot) = driver.cores.get(&core) else {
                warn!("IBS: online core {} is not a possible core", core);
                continue;
            };
            let mut published = slot.published.lock().unwrap_or_else(PoisonError::into_inner);
            driver.prepare_core(core);
            driver.setup_lvt(core);
            driver.errata.core_online(&*driver.hw, core);
            driver.publish_core(core, slot, &mut published).inspect_err(|e| {
                error!("Failed to create IBS devices: {}", e);
            })?;
            slot.gate.open();
        }

        driver.irq_registered.store(true, Ordering::SeqCst);
        Ok(driver)
    }

    pub fn caps(&self) -> &CapabilitySet {
        &self.caps
    }

    pub fn workarounds(&self) -> &WorkaroundFlags {
        &self.flags
    }

    /// Supported flavors.
    pub fn flavors(&self) -> &[Flavor] {
        &self.flavors
    }

    /// Every possible core, ascending.
    pub fn cores(&self) -> impl Iterator<Item = u32> + '_ {
        self.cores.keys().copied()
    }

    pub fn device(&self, core: u32, flavor: Flavor) -> Option<&Arc<PerCoreDevice>> {
        self.cores.get(&core).map(|it| it.device(flavor))
    }

    pub fn is_published(&self, endpoint: Endpoint) -> bool {
        self.cores.get(&endpoint.core).is_some_and(|it| {
            let published = it.published.lock().unwrap_or_else(PoisonError::into_inner);
            published.get(endpoint.flavor)
        })
    }

    pub fn irq_stats(&self) -> &IrqStats {
        &self.irq_stats
    }

    /// Buffer bytes currently allocated by this driver.
    pub fn accounting(&self) -> &Accounting {
        &self.accounting
    }

    /// Reacts to a hotplug transition of `core`.
    ///
    /// Only [`HotplugEvent::UpPrepare`] can fail, in which case the host
    /// should cancel the bring-up. Other failures degrade the core and are
    /// logged.
    pub fn hotplug(&self, core: u32, event: HotplugEvent) -> Result<()> {
        let slot = self.cores.get(&core).ok_or(Error::NoCore(core))?;
        let mut published = slot.published.lock().unwrap_or_else(PoisonError::into_inner);

        match event {
            HotplugEvent::UpPrepare => self.publish_core(core, slot, &mut published)?,
            HotplugEvent::Online => {
                self.prepare_core(core);
                self.setup_lvt(core);
                self.errata.core_online(&*self.hw, core);
                slot.gate.open();
            }
            HotplugEvent::DownPrepare => {
                info!("IBS: Trying to kill core: {}", core);
                for &flavor in &self.flavors {
                    if let Err(e) = slot.device(flavor).disable_sampling() {
                        warn!("IBS: failed to stop {} on core {}: {}", flavor, core, e);
                    }
                }
                self.errata.core_offline(&*self.hw, core);
            }
            HotplugEvent::UpCanceled | HotplugEvent::Dead => {
                slot.gate.close();
                self.unpublish_core(core, slot, &mut published);
                self.hw.release_core(core);
            }
        }
        Ok(())
    }

    /// Handles a sampling interrupt on `core`. Callable from interrupt context.
    pub fn irq(&self, core: u32) -> IrqReturn {
        let ret = self.irq_inner(core);
        self.irq_stats.record(ret);
        ret
    }

    fn irq_inner(&self, core: u32) -> IrqReturn {
        if !self.irq_registered.load(Ordering::SeqCst) {
            return IrqReturn::NotHandled;
        }
        let Some(slot) = self.cores.get(&core) else {
            return IrqReturn::NotHandled;
        };
        let Some(_guard) = slot.gate.enter() else {
            return IrqReturn::NotHandled;
        };

        let mut handled = false;
        for &flavor in &self.flavors {
            let ctx = IrqContext::new(slot.device(flavor));
            handled |= capture::handle(&ctx, &*self.hw, &self.errata, &self.irq_stats);
        }
        match handled {
            true => IrqReturn::Handled,
            false => IrqReturn::NotHandled,
        }
    }

    /// Tears down every endpoint and frees every buffer.
    ///
    /// Buffers of endpoints still held open are freed when their last
    /// [`Handle`][crate::device::Handle] is dropped; such handles fail with
    /// [`Error::Unloaded`].
    pub fn unload(mut self) {
        self.shutdown();
    }

    fn prepare_core(&self, core: u32) {
        if let Err(e) = self.hw.prepare_core(core) {
            warn!("IBS: failed to prepare register access on cpu {}: {}", core, e);
        }
    }

    // Routes the IBS interrupt of `core` to NMI. Idempotent.
    fn setup_lvt(&self, core: u32) {
        let result = self.hw.read_msr(core, IBS_CONTROL).and_then(|ctl| {
            if ctl & IBS_LVT_OFFSET_VAL == 0 {
                return Err(std::io::Error::other("LVT offset not valid"));
            }
            self.hw.route_nmi(core, (ctl & IBS_LVT_OFFSET) as u8)
        });
        if let Err(e) = result {
            warn!("IBS APIC setup fail on cpu {}: {}", core, e);
        }
    }

    // Publishes every supported flavor of `core`, or none of them.
    fn publish_core(&self, core: u32, slot: &CoreSlot, published: &mut Published) -> Result<()> {
        for &flavor in &self.flavors {
            if published.get(flavor) {
                continue;
            }
            let endpoint = Endpoint { core, flavor };
            let dev = slot.device(flavor);
            dev.mark_online();
            if let Err(source) = self.registry.publish(endpoint, dev) {
                warn!("IBS: failed to publish {}: {}", endpoint, source);
                dev.mark_offline();
                self.unpublish_core(core, slot, published);
                return Err(Error::Publish { endpoint, source });
            }
            published.set(flavor, true);
        }
        Ok(())
    }

    fn unpublish_core(&self, core: u32, slot: &CoreSlot, published: &mut Published) {
        for flavor in Flavor::ALL {
            if !published.get(flavor) {
                continue;
            }
            let endpoint = Endpoint { core, flavor };
            slot.device(flavor).mark_offline();
            if let Err(e) = self.registry.unpublish(endpoint) {
                warn!("IBS: failed to unpublish {}: {}", endpoint, e);
            }
            published.set(flavor, false);
        }
    }

    fn shutdown(&mut self) {
        if self.unloaded {
            return;
        }
        self.unloaded = true;

        self.irq_registered.store(false, Ordering::SeqCst);
        for slot in self.cores.values() {
            slot.gate.close();
        }

        for (&core, slot) in &self.cores {
            let mut published = slot.published.lock().unwrap_or_else(PoisonError::into_inner);
            // Marked before stopping, so no handle can enable again afterwards.
            for flavor in Flavor::ALL {
                slot.device(flavor).mark_unloaded();
            }
            for &flavor in &self.flavors {
                if let Err(e) = slot.device(flavor).quiesce() {
                    warn!("IBS: failed to stop {} on core {}: {}", flavor, core, e);
                }
            }
            self.unpublish_core(core, slot, &mut published);
        }

        self.errata.teardown(&*self.hw);
        for &core in self.cores.keys() {
            self.hw.release_core(core);
        }
        self.wake.stop();
        self.cores.clear();
        info!("Exited ibs module");
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown();
    }
}
