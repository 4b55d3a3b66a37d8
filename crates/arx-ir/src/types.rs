//! Core guest-facing types shared across the pipeline.

use std::fmt;

/// A32 general-purpose register. R15 is the program counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Reg {
    R0 = 0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    R12,
    SP,
    LR,
    PC,
}

impl Reg {
    /// Register from its 4-bit encoding.
    pub fn from_index(idx: u32) -> Reg {
        debug_assert!(idx < 16, "register index out of range: {idx}");
        // Safety equivalent: repr(u8) with contiguous discriminants 0..=15.
        match idx & 0xF {
            0 => Reg::R0,
            1 => Reg::R1,
            2 => Reg::R2,
            3 => Reg::R3,
            4 => Reg::R4,
            5 => Reg::R5,
            6 => Reg::R6,
            7 => Reg::R7,
            8 => Reg::R8,
            9 => Reg::R9,
            10 => Reg::R10,
            11 => Reg::R11,
            12 => Reg::R12,
            13 => Reg::SP,
            14 => Reg::LR,
            _ => Reg::PC,
        }
    }

    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::SP => write!(f, "sp"),
            Reg::LR => write!(f, "lr"),
            Reg::PC => write!(f, "pc"),
            other => write!(f, "r{}", *other as u8),
        }
    }
}

/// ARM condition code.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cond {
    Eq = 0b0000,
    Ne = 0b0001,
    Cs = 0b0010,
    Cc = 0b0011,
    Mi = 0b0100,
    Pl = 0b0101,
    Vs = 0b0110,
    Vc = 0b0111,
    Hi = 0b1000,
    Ls = 0b1001,
    Ge = 0b1010,
    Lt = 0b1011,
    Gt = 0b1100,
    Le = 0b1101,
    #[default]
    Al = 0b1110,
    /// The 0b1111 slot; unconditional-space encodings, never a predicate.
    Nv = 0b1111,
}

impl Cond {
    pub fn from_bits(bits: u32) -> Cond {
        match bits & 0xF {
            0b0000 => Cond::Eq,
            0b0001 => Cond::Ne,
            0b0010 => Cond::Cs,
            0b0011 => Cond::Cc,
            0b0100 => Cond::Mi,
            0b0101 => Cond::Pl,
            0b0110 => Cond::Vs,
            0b0111 => Cond::Vc,
            0b1000 => Cond::Hi,
            0b1001 => Cond::Ls,
            0b1010 => Cond::Ge,
            0b1011 => Cond::Lt,
            0b1100 => Cond::Gt,
            0b1101 => Cond::Le,
            0b1110 => Cond::Al,
            _ => Cond::Nv,
        }
    }

    /// Inverse predicate. AL/NV have no inverse.
    pub fn invert(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Cs => Cond::Cc,
            Cond::Cc => Cond::Cs,
            Cond::Mi => Cond::Pl,
            Cond::Pl => Cond::Mi,
            Cond::Vs => Cond::Vc,
            Cond::Vc => Cond::Vs,
            Cond::Hi => Cond::Ls,
            Cond::Ls => Cond::Hi,
            Cond::Ge => Cond::Lt,
            Cond::Lt => Cond::Ge,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
            Cond::Al | Cond::Nv => panic!("AL/NV have no inverse"),
        }
    }
}

/// FPSCR rounding mode (RMode field).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RoundingMode {
    /// Round to nearest, ties to even (RN).
    #[default]
    ToNearest = 0,
    /// Round towards plus infinity (RP).
    TowardsPlusInfinity = 1,
    /// Round towards minus infinity (RM).
    TowardsMinusInfinity = 2,
    /// Round towards zero (RZ).
    TowardsZero = 3,
    /// Round to nearest, ties away from zero. Not encodable in FPSCR;
    /// used by conversion instructions that request it directly.
    ToNearestTieAwayFromZero = 4,
}

impl RoundingMode {
    pub fn from_bits(bits: u32) -> RoundingMode {
        match bits & 0b11 {
            0 => RoundingMode::ToNearest,
            1 => RoundingMode::TowardsPlusInfinity,
            2 => RoundingMode::TowardsMinusInfinity,
            _ => RoundingMode::TowardsZero,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reg_roundtrip() {
        for i in 0..16 {
            assert_eq!(Reg::from_index(i).index(), i as usize);
        }
        assert_eq!(Reg::from_index(15), Reg::PC);
        assert_eq!(Reg::from_index(13), Reg::SP);
    }

    #[test]
    fn test_cond_invert() {
        assert_eq!(Cond::Eq.invert(), Cond::Ne);
        assert_eq!(Cond::Hi.invert(), Cond::Ls);
        assert_eq!(Cond::from_bits(0b1010), Cond::Ge);
    }

    #[test]
    fn test_rounding_mode_bits() {
        assert_eq!(RoundingMode::from_bits(0), RoundingMode::ToNearest);
        assert_eq!(RoundingMode::from_bits(2), RoundingMode::TowardsMinusInfinity);
    }
}
