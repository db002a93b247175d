use std::fs::File;
use std::io::{Error, ErrorKind, Result};
use std::os::fd::AsRawFd;

pub fn pread_u64(file: &File, offset: u64) -> Result<u64> {
    let fd = file.as_raw_fd();
    let mut val = 0_u64;
    let len = size_of::<u64>();
    let bytes = unsafe { libc::pread(fd, &mut val as *mut u64 as _, len, offset as _) };
    match bytes {
        -1 => Err(Error::last_os_error()),
        n if n as usize == len => Ok(val),
        _ => Err(ErrorKind::UnexpectedEof.into()),
    }
}

pub fn pwrite_u64(file: &File, offset: u64, val: u64) -> Result<()> {
    let fd = file.as_raw_fd();
    let len = size_of::<u64>();
    let bytes = unsafe { libc::pwrite(fd, &val as *const u64 as _, len, offset as _) };
    match bytes {
        -1 => Err(Error::last_os_error()),
        n if n as usize == len => Ok(()),
        _ => Err(ErrorKind::WriteZero.into()),
    }
}

/// Executes `cpuid` for `leaf` (subleaf 0), returning `[eax, ebx, ecx, edx]`.
#[cfg(target_arch = "x86_64")]
#[allow(unused_unsafe)]
pub fn cpuid(leaf: u32) -> Result<[u32; 4]> {
    // `cpuid` is always available on x86_64.
    let r = unsafe { std::arch::x86_64::__cpuid(leaf) };
    Ok([r.eax, r.ebx, r.ecx, r.edx])
}

#[cfg(not(target_arch = "x86_64"))]
pub fn cpuid(leaf: u32) -> Result<[u32; 4]> {
    let _ = leaf;
    Err(ErrorKind::Unsupported.into())
}

#[cfg(target_arch = "x86_64")]
#[allow(unused_unsafe)]
pub fn rdtsc() -> u64 {
    unsafe { std::arch::x86_64::_rdtsc() }
}

#[cfg(not(target_arch = "x86_64"))]
pub fn rdtsc() -> u64 {
    0
}
