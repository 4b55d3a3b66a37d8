//! Guest location descriptors.

use std::fmt;

/// FPSCR bits that affect code generation: RMode [23:22], FZ [24], DN [25].
pub const FPSCR_CODEGEN_MASK: u32 = 0x03C0_0000;

use crate::RoundingMode;

/// Identifies a compiled block: guest PC, ISA state, and the floating-point
/// control bits that change what code we generate.
///
/// Two descriptors that differ in any field name distinct blocks.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocationDescriptor {
    arm_pc: u32,
    tflag: bool,
    fpscr: u32,
}

impl LocationDescriptor {
    pub fn new(arm_pc: u32, tflag: bool, fpscr: u32) -> Self {
        Self {
            arm_pc,
            tflag,
            fpscr: fpscr & FPSCR_CODEGEN_MASK,
        }
    }

    pub const fn pc(self) -> u32 {
        self.arm_pc
    }

    pub const fn is_thumb(self) -> bool {
        self.tflag
    }

    pub const fn fpscr(self) -> u32 {
        self.fpscr
    }

    pub fn rounding_mode(self) -> RoundingMode {
        RoundingMode::from_bits(self.fpscr >> 22)
    }

    /// Default-NaN mode enabled.
    pub const fn fpscr_dn(self) -> bool {
        self.fpscr & (1 << 25) != 0
    }

    /// Flush-to-zero mode enabled.
    pub const fn fpscr_fz(self) -> bool {
        self.fpscr & (1 << 24) != 0
    }

    /// Same descriptor at a different PC.
    #[must_use]
    pub fn with_pc(self, arm_pc: u32) -> Self {
        Self { arm_pc, ..self }
    }

    /// Advance the PC by `n` bytes.
    #[must_use]
    pub fn advance(self, n: u32) -> Self {
        self.with_pc(self.arm_pc.wrapping_add(n))
    }

    /// Pack into a 64-bit cache key: PC in the low word, T flag and the
    /// FPSCR codegen bits in the high word.
    pub fn to_u64(self) -> u64 {
        let upper = (self.fpscr | u32::from(self.tflag)) as u64;
        (upper << 32) | self.arm_pc as u64
    }
}

impl fmt::Debug for LocationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{:08x}, {}, fpscr={:08x}}}",
            self.arm_pc,
            if self.tflag { "T" } else { "A" },
            self.fpscr
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fpscr_masked_to_codegen_bits() {
        let loc = LocationDescriptor::new(0x1000, false, 0xFFFF_FFFF);
        assert_eq!(loc.fpscr(), FPSCR_CODEGEN_MASK);
        assert!(loc.fpscr_dn());
        assert!(loc.fpscr_fz());
    }

    #[test]
    fn test_distinct_keys() {
        let a = LocationDescriptor::new(0x1000, false, 0);
        let b = LocationDescriptor::new(0x1000, true, 0);
        let c = LocationDescriptor::new(0x1000, false, 2 << 22);
        assert_ne!(a.to_u64(), b.to_u64());
        assert_ne!(a.to_u64(), c.to_u64());
        assert_ne!(b.to_u64(), c.to_u64());
    }

    #[test]
    fn test_advance() {
        let loc = LocationDescriptor::new(0x1000, true, 0);
        assert_eq!(loc.advance(2).pc(), 0x1002);
        assert!(loc.advance(2).is_thumb());
    }

    #[test]
    fn test_rounding_mode() {
        let loc = LocationDescriptor::new(0, false, 2 << 22);
        assert_eq!(loc.rounding_mode(), RoundingMode::TowardsMinusInfinity);
    }
}
