//! Sample records and the buffers that hold them.

#[cfg(test)]
mod test;

mod buffer;
pub mod record;

use std::fmt;

pub use buffer::*;

use crate::ffi::msr::*;

/// Sampling flavor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Flavor {
    /// Execution (op) sampling.
    Op,
    /// Instruction-fetch sampling.
    Fetch,
}

impl Flavor {
    pub const ALL: [Flavor; 2] = [Flavor::Op, Flavor::Fetch];

    pub fn name(self) -> &'static str {
        match self {
            Self::Op => "op",
            Self::Fetch => "fetch",
        }
    }

    /// Size in bytes of one record of this flavor.
    pub fn record_size(self) -> usize {
        self.words() * size_of::<u64>()
    }

    pub(crate) fn words(self) -> usize {
        match self {
            Self::Op => record::op::WORDS,
            Self::Fetch => record::fetch::WORDS,
        }
    }

    pub(crate) fn ctl_msr(self) -> u32 {
        match self {
            Self::Op => IBS_OP_CTL,
            Self::Fetch => IBS_FETCH_CTL,
        }
    }

    pub(crate) fn enable_bit(self) -> u64 {
        match self {
            Self::Op => IBS_OP_EN,
            Self::Fetch => IBS_FETCH_EN,
        }
    }

    pub(crate) fn valid_bit(self) -> u64 {
        match self {
            Self::Op => IBS_OP_VAL,
            Self::Fetch => IBS_FETCH_VAL,
        }
    }

    /// Control register bits holding the running count.
    pub(crate) fn cur_cnt_mask(self) -> u64 {
        match self {
            Self::Op => IBS_OP_CUR_CNT,
            Self::Fetch => IBS_FETCH_CNT,
        }
    }

    /// Control register bits holding the max count.
    pub(crate) fn max_cnt_mask(self) -> u64 {
        match self {
            Self::Op => IBS_OP_MAX_CNT | IBS_OP_MAX_CNT_EXT,
            Self::Fetch => IBS_FETCH_MAX_CNT,
        }
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
