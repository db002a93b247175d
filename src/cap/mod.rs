//! Capability detection.
//!
//! Runs once before any per-core state exists and turns the CPU identity
//! into an immutable [`CapabilitySet`] and [`WorkaroundFlags`] pair.


use std::fmt;
use std::io::Result;

use log::{error, info};
use thiserror::Error;

use crate::ffi::syscall::cpuid;
use crate::ffi::*;

const VENDOR_AMD: &str = "AuthenticAMD";
const MIN_FAMILY: u32 = 0x10;
// Family 11h never shipped IBS.
const EXCLUDED_FAMILY: u32 = 0x11;

/// Why detection refused the CPU.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Unsupported {
    #[error("not an AMD processor (vendor {0:?})")]
    Vendor(String),
    #[error("family {0:#x} does not support IBS")]
    Family(u32),
    #[error("CPUID_Fn8000_0001 indicates no IBS support")]
    NoFeature,
    #[error("CPUID_Fn8000_001B capability flags are not valid")]
    InvalidCapabilityData,
    #[error("CPUID_Fn8000_001B reports neither op nor fetch sampling")]
    NoFlavor,
}

/// Identification inputs of the running CPU.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpuIdent {
    pub vendor: String,
    pub family: u32,
    pub model: u32,
    pub stepping: u32,
    /// `CPUID_Fn8000_0001_ECX`.
    pub ext_features: u32,
    /// `CPUID_Fn8000_001B_EAX`, zero if the leaf is not implemented.
    pub ibs_caps: u32,
}

impl CpuIdent {
    /// Reads the identity of the CPU this thread runs on.
    pub fn read() -> Result<Self> {
        let [_, ebx, ecx, edx] = cpuid(CPUID_VENDOR)?;
        let mut vendor = Vec::with_capacity(12);
        for reg in [ebx, edx, ecx] {
            vendor.extend(reg.to_le_bytes());
        }
        let vendor = String::from_utf8_lossy(&vendor).into_owned();

        let [signature, ..] = cpuid(CPUID_SIGNATURE)?;
        let (family, model, stepping) = decode_signature(signature);

        let [ext_max, ..] = cpuid(CPUID_EXT_MAX)?;
        let ext_features = match ext_max >= CPUID_EXT_FEATURES {
            true => cpuid(CPUID_EXT_FEATURES)?[2],
            false => 0,
        };
        let ibs_caps = match ext_max >= CPUID_IBS_CAPS {
            true => cpuid(CPUID_IBS_CAPS)?[0],
            false => 0,
        };

        Ok(Self {
            vendor,
            family,
            model,
            stepping,
            ext_features,
            ibs_caps,
        })
    }
}

/// Splits `CPUID_Fn0000_0001_EAX` into family, model and stepping.
pub fn decode_signature(eax: u32) -> (u32, u32, u32) {
    let base_family = (eax >> 8) & 0xf;
    let mut family = base_family;
    let mut model = (eax >> 4) & 0xf;
    if base_family == 0xf {
        family += (eax >> 20) & 0xff;
        model |= ((eax >> 16) & 0xf) << 4;
    }
    (family, model, eax & 0xf)
}

/// Sampling features of the CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CapabilitySet {
    pub fetch: bool,
    /// Any of the three op sub-features below.
    pub op: bool,
    pub op_sampling: bool,
    pub op_read_write_count: bool,
    pub op_count: bool,
    pub branch_target: bool,
    pub op_count_ext: bool,
    pub rip_invalid_check: bool,
    pub op_branch_fuse: bool,
    pub fetch_ctl_extd: bool,
    pub op_data4: bool,
}

impl CapabilitySet {
    /// Decodes `CPUID_Fn8000_001B_EAX`.
    pub fn from_caps(eax: u32) -> Self {
        let has = |bit: u32| eax & bit != 0;
        let op_sampling = has(IBS_CAPS_OPSAM);
        let op_read_write_count = has(IBS_CAPS_RDWROPCNT);
        let op_count = has(IBS_CAPS_OPCNT);
        Self {
            fetch: has(IBS_CAPS_FETCHSAM),
            op: op_sampling || op_read_write_count || op_count,
            op_sampling,
            op_read_write_count,
            op_count,
            branch_target: has(IBS_CAPS_BRNTRGT),
            op_count_ext: has(IBS_CAPS_OPCNTEXT),
            rip_invalid_check: has(IBS_CAPS_RIPINVALIDCHK),
            op_branch_fuse: has(IBS_CAPS_OPBRNFUSE),
            fetch_ctl_extd: has(IBS_CAPS_FETCHCTLEXTD),
            op_data4: has(IBS_CAPS_OPDATA4),
        }
    }
}

/// Known hardware errata, in the order their workarounds run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Erratum {
    /// Family 10h erratum 420: the engine may raise an interrupt that cannot be cleared.
    Fam10hErr420,
    /// Family 15h models 00h-1Fh erratum 718: `IBS_OP_DATA3` bits 3, 6 and 19 never clear.
    Fam15hErr718,
    /// Family 17h model 01h does not enable IBS by default.
    Fam17hM01h,
}

impl Erratum {
    pub const ALL: [Erratum; 3] = [Self::Fam10hErr420, Self::Fam15hErr718, Self::Fam17hM01h];
}

impl fmt::Display for Erratum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Fam10hErr420 => "Family 10h Errata 420",
            Self::Fam15hErr718 => "Family 15h Models 00h-1Fh Errata 718",
            Self::Fam17hM01h => "Family 17h Model 01h",
        };
        f.write_str(name)
    }
}

/// Errata workarounds that apply to the CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WorkaroundFlags {
    pub fam10h_err_420: bool,
    pub fam15h_err_718: bool,
    pub fam17h_m01h: bool,
}

impl WorkaroundFlags {
    pub fn contains(&self, erratum: Erratum) -> bool {
        match erratum {
            Erratum::Fam10hErr420 => self.fam10h_err_420,
            Erratum::Fam15hErr718 => self.fam15h_err_718,
            Erratum::Fam17hM01h => self.fam17h_m01h,
        }
    }

    /// Active errata in definition order.
    pub fn active(&self) -> impl Iterator<Item = Erratum> + '_ {
        Erratum::ALL.into_iter().filter(move |it| self.contains(*it))
    }
}

/// Decides what the CPU supports and which workarounds it needs.
pub fn detect(id: &CpuIdent) -> std::result::Result<(CapabilitySet, WorkaroundFlags), Unsupported> {
    let result = detect_inner(id);
    if let Err(e) = &result {
        error!("Unable to start IBS driver: {}", e);
    }
    result
}

fn detect_inner(id: &CpuIdent) -> std::result::Result<(CapabilitySet, WorkaroundFlags), Unsupported> {
    if id.vendor != VENDOR_AMD {
        return Err(Unsupported::Vendor(id.vendor.clone()));
    }
    if id.family < MIN_FAMILY || id.family == EXCLUDED_FAMILY {
        return Err(Unsupported::Family(id.family));
    }

    let mut flags = WorkaroundFlags {
        fam10h_err_420: id.family == 0x10,
        fam15h_err_718: id.family == 0x15 && id.model <= 0x1f,
        fam17h_m01h: false,
    };

    if id.ext_features & EXT_FEATURE_IBS == 0 {
        if id.family == 0x17 && id.model == 0x01 {
            flags.fam17h_m01h = true;
        } else {
            return Err(Unsupported::NoFeature);
        }
    }

    if id.ibs_caps & IBS_CAPS_AVAIL == 0 {
        return Err(Unsupported::InvalidCapabilityData);
    }
    let caps = CapabilitySet::from_caps(id.ibs_caps);
    if !caps.fetch && !caps.op {
        return Err(Unsupported::NoFlavor);
    }

    for erratum in flags.active() {
        info!("IBS Startup: Enabling workaround for {}", erratum);
    }
    if flags.fam17h_m01h {
        info!("This workaround may slow down your processor.");
    }

    Ok((caps, flags))
}
