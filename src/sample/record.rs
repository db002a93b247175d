//! Record layouts.
//!
//! A record is a fixed number of native-endian `u64` words. Fields the CPU
//! cannot provide are left zero.

use arrayvec::ArrayVec;

use super::Flavor;

/// Word indices of an op record.
pub mod op {
    pub const CTL: usize = 0;
    pub const RIP: usize = 1;
    pub const DATA: usize = 2;
    pub const DATA2: usize = 3;
    pub const DATA3: usize = 4;
    pub const DATA4: usize = 5;
    pub const DC_LIN_AD: usize = 6;
    pub const DC_PHYS_AD: usize = 7;
    pub const BR_TARGET: usize = 8;
    pub const TSC: usize = 9;
    pub const CPU: usize = 10;
    pub const WORDS: usize = 11;
}

/// Word indices of a fetch record.
pub mod fetch {
    pub const CTL: usize = 0;
    pub const CTL_EXTD: usize = 1;
    pub const LIN_AD: usize = 2;
    pub const PHYS_AD: usize = 3;
    pub const TSC: usize = 4;
    pub const CPU: usize = 5;
    pub const WORDS: usize = 6;
}

pub const MAX_WORDS: usize = op::WORDS;
pub const MAX_RECORD_SIZE: usize = MAX_WORDS * 8;

/// A record under construction in interrupt context.
///
/// Lives on the stack; building one never allocates.
#[derive(Clone, Debug)]
pub struct LocalRecord {
    flavor: Flavor,
    words: ArrayVec<u64, MAX_WORDS>,
}

impl LocalRecord {
    pub fn new(flavor: Flavor) -> Self {
        let mut words = ArrayVec::new();
        for _ in 0..flavor.words() {
            words.push(0);
        }
        Self { flavor, words }
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    pub fn get(&self, idx: usize) -> u64 {
        self.words[idx]
    }

    pub fn set(&mut self, idx: usize, val: u64) {
        self.words[idx] = val;
    }

    pub fn bytes(&self) -> ArrayVec<u8, MAX_RECORD_SIZE> {
        let mut bytes = ArrayVec::new();
        for word in &self.words {
            // `words` never exceeds `MAX_WORDS`, so this always fits.
            let _ = bytes.try_extend_from_slice(&word.to_ne_bytes());
        }
        bytes
    }
}

/// Decodes the words of a record read from a device.
pub fn words(record: &[u8]) -> impl Iterator<Item = u64> + '_ {
    record
        .chunks_exact(8)
        .map(|it| u64::from_ne_bytes([it[0], it[1], it[2], it[3], it[4], it[5], it[6], it[7]]))
}
