//! Per-CPU AMD Instruction-Based Sampling (IBS).
//!
//! IBS tags one instruction fetch or one micro-op out of every N and latches
//! what happened to it in a set of model-specific registers. This crate owns
//! that hardware on every core: it exposes one exclusive endpoint per
//! (core, flavor), copies each latched sample into a per-endpoint buffer from
//! the sampling interrupt, and lets consumers read whole records back out,
//! blocking or async.
//!
//! ## Example
//!
//! Sample micro-ops on core 0 and dump the sampled instruction pointers.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use ibs_sample::config::Config;
//! use ibs_sample::hw::MsrHardware;
//! use ibs_sample::lifecycle::{DeviceTable, Driver};
//! use ibs_sample::sample::record::{self, op};
//!
//! let table = Arc::new(DeviceTable::new());
//! let driver = Driver::load(Arc::new(MsrHardware::new()), table.clone(), Config::default()).unwrap();
//!
//! let handle = table.open("cpu/0/ibs/op").unwrap();
//! handle.set_max_count(0x2000).unwrap(); // One sample every 0x2000 * 16 ops.
//! handle.enable().unwrap();
//!
//! // The host's NMI path calls `driver.irq(core)`; readers just wait.
//! let records = handle.read(64, Some(Duration::from_secs(1))).unwrap();
//! for it in &records {
//!     let words: Vec<_> = record::words(it).collect();
//!     println!("rip {:#x}", words[op::RIP]);
//! }
//! println!("{} lost", handle.lost());
//!
//! drop(handle);
//! driver.unload();
//! ```
//!
//! ## CPU support
//!
//! AMD family 10h and later, except family 11h. Family 17h model 01h parts
//! that hide the feature bit are enabled through a workaround.

pub mod cap;
pub mod capture;
pub mod config;
pub mod device;
mod error;
mod ffi;
pub mod hw;
pub mod lifecycle;
pub mod sample;
pub mod workaround;

pub use error::{Error, Result};
