
use crate::ffi::msr::MAX_CNT_LIMIT;
use crate::ffi::PAGE_SIZE;
use crate::{Error, Result};

/// Driver options.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    /// Bytes of sample buffer per (core, flavor) endpoint.
    ///
    /// Allocated for every possible core at load and never resized.
    /// Rounded down to whole records.
    pub buffer_size: usize,

    /// Initial max count of every endpoint, in the control register's units
    /// (16 events each).
    pub max_count: u32,

    /// Initial number of buffered records that make an endpoint poll-ready.
    pub poll_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_size: *PAGE_SIZE << 8,
            max_count: 0x1000,
            poll_threshold: 1,
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_count == 0 || self.max_count > MAX_CNT_LIMIT {
            return Err(Error::InvalidArgument("max count out of range"));
        }
        if self.poll_threshold == 0 {
            return Err(Error::InvalidArgument("poll threshold must not be zero"));
        }
        Ok(())
    }
}
