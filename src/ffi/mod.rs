use std::sync::LazyLock;

pub mod msr;
pub mod syscall;

// https://github.com/torvalds/linux/blob/v6.13/arch/x86/include/asm/cpufeatures.h
pub const CPUID_VENDOR: u32 = 0x0000_0000;
pub const CPUID_SIGNATURE: u32 = 0x0000_0001;
pub const CPUID_EXT_MAX: u32 = 0x8000_0000;
pub const CPUID_EXT_FEATURES: u32 = 0x8000_0001;
pub const CPUID_IBS_CAPS: u32 = 0x8000_001b;

// CPUID_Fn8000_0001_ECX[10]
pub const EXT_FEATURE_IBS: u32 = 1 << 10;

// CPUID_Fn8000_001B_EAX
pub const IBS_CAPS_AVAIL: u32 = 1 << 0;
pub const IBS_CAPS_FETCHSAM: u32 = 1 << 1;
pub const IBS_CAPS_OPSAM: u32 = 1 << 2;
pub const IBS_CAPS_RDWROPCNT: u32 = 1 << 3;
pub const IBS_CAPS_OPCNT: u32 = 1 << 4;
pub const IBS_CAPS_BRNTRGT: u32 = 1 << 5;
pub const IBS_CAPS_OPCNTEXT: u32 = 1 << 6;
pub const IBS_CAPS_RIPINVALIDCHK: u32 = 1 << 7;
pub const IBS_CAPS_OPBRNFUSE: u32 = 1 << 8;
pub const IBS_CAPS_FETCHCTLEXTD: u32 = 1 << 9;
pub const IBS_CAPS_OPDATA4: u32 = 1 << 10;

pub static PAGE_SIZE: LazyLock<usize> = LazyLock::new(|| {
    let name = libc::_SC_PAGE_SIZE;
    let size = unsafe { libc::sysconf(name) };
    // `sysconf` only fails for unknown names.
    if size > 0 {
        size as _
    } else {
        4096
    }
});
