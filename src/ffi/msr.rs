//! IBS model-specific registers and their control bits.
//!
//! See the AMD64 Architecture Programmer's Manual Vol. 2, section 13.3
//! "Instruction-Based Sampling", and the BKDG/PPR of each family.

pub const IBS_FETCH_CTL: u32 = 0xc001_1030;
pub const IBS_FETCH_LIN_AD: u32 = 0xc001_1031;
pub const IBS_FETCH_PHYS_AD: u32 = 0xc001_1032;
pub const IBS_OP_CTL: u32 = 0xc001_1033;
pub const IBS_OP_RIP: u32 = 0xc001_1034;
pub const IBS_OP_DATA: u32 = 0xc001_1035;
pub const IBS_OP_DATA2: u32 = 0xc001_1036;
pub const IBS_OP_DATA3: u32 = 0xc001_1037;
pub const IBS_DC_LIN_AD: u32 = 0xc001_1038;
pub const IBS_DC_PHYS_AD: u32 = 0xc001_1039;
pub const IBS_CONTROL: u32 = 0xc001_103a;
pub const IBS_BR_TARGET: u32 = 0xc001_103b;
pub const IBS_FETCH_CTL_EXTD: u32 = 0xc001_103c;
pub const IBS_OP_DATA4: u32 = 0xc001_103d;

// IBS_CONTROL
pub const IBS_LVT_OFFSET_VAL: u64 = 1 << 8;
pub const IBS_LVT_OFFSET: u64 = 0xf;

// IBS_FETCH_CTL
pub const IBS_FETCH_MAX_CNT: u64 = 0xffff;
pub const IBS_FETCH_CNT: u64 = 0xffff << 16;
pub const IBS_FETCH_EN: u64 = 1 << 48;
pub const IBS_FETCH_VAL: u64 = 1 << 49;

// IBS_OP_CTL
pub const IBS_OP_MAX_CNT: u64 = 0xffff;
pub const IBS_OP_EN: u64 = 1 << 17;
pub const IBS_OP_VAL: u64 = 1 << 18;
pub const IBS_OP_MAX_CNT_EXT: u64 = 0x7f << 20;
pub const IBS_OP_CUR_CNT: u64 = 0x7ff_ffff << 32;

/// Widest max-count value without `IbsOpCntExt`.
pub const MAX_CNT_LIMIT: u32 = 0xffff;
/// Widest op max-count value with `IbsOpCntExt`.
pub const OP_MAX_CNT_EXT_LIMIT: u32 = 0x7f_ffff;

// Family 15h models 00h-1Fh erratum 718: bits the processor sets but never clears.
pub const IBS_OP_DATA3_STICKY: u64 = (1 << 3) | (1 << 6) | (1 << 19);

// Family 17h model 01h: per-core bits that turn IBS on when firmware did not.
pub const FAM17H_M01H_ENABLE: [(u32, u64); 3] = [
    (0xc001_1020, 1 << 54),
    (0xc001_1029, 1 << 19),
    (0xc001_0296, (1 << 6) | (1 << 14) | (1 << 22)),
];

/// Places a max-count value into the op control register layout.
///
/// Bits 15:0 of the value land in `IbsOpMaxCnt`, bits 22:16 in `IbsOpMaxCntExt` (26:20).
pub const fn op_max_cnt_bits(cnt: u32) -> u64 {
    let cnt = cnt as u64;
    (cnt & IBS_OP_MAX_CNT) | (((cnt >> 16) << 20) & IBS_OP_MAX_CNT_EXT)
}

/// Inverse of [`op_max_cnt_bits`].
pub const fn op_max_cnt_value(ctl: u64) -> u32 {
    ((ctl & IBS_OP_MAX_CNT) | (((ctl & IBS_OP_MAX_CNT_EXT) >> 20) << 16)) as u32
}
