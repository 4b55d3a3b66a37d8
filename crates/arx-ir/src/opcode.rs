//! The closed opcode enumeration and its type signatures.

use crate::Type;

macro_rules! opcodes {
    ($( $name:ident : $result:ident ( $($arg:ident),* ) ),* $(,)?) => {
        /// Every micro-operation the IR can express.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $( $name, )*
        }

        impl Opcode {
            /// Result type of the operation.
            pub fn result_type(self) -> Type {
                match self {
                    $( Opcode::$name => Type::$result, )*
                }
            }

            /// Declared argument types, in order.
            pub fn arg_types(self) -> &'static [Type] {
                match self {
                    $( Opcode::$name => &[ $( Type::$arg ),* ], )*
                }
            }
        }
    };
}

opcodes! {
    // An invalidated instruction. Skipped by the emitter.
    Void: Void(),

    // Guest context.
    GetRegister: U32(U8),
    SetRegister: Void(U8, U32),
    GetVector: Vector(U8),
    SetVector: Void(U8, Vector),
    GetNFlag: U1(),
    GetZFlag: U1(),
    GetCFlag: U1(),
    GetVFlag: U1(),
    SetNFlag: Void(U1),
    SetZFlag: Void(U1),
    SetCFlag: Void(U1),
    SetVFlag: Void(U1),

    // Pseudo-operations extracting secondary results of the referenced
    // instruction. The argument must be an instruction reference.
    GetCarryFromOp: U1(U32),
    GetOverflowFromOp: U1(U32),

    // Arithmetic and logic.
    AddWithCarry: U32(U32, U32, U1),
    SubWithCarry: U32(U32, U32, U1),
    Mul: U32(U32, U32),
    And: U32(U32, U32),
    Eor: U32(U32, U32),
    Or: U32(U32, U32),
    Not: U32(U32),
    CountLeadingZeros: U32(U32),

    // Shifts. Carry out is extracted with GetCarryFromOp.
    LogicalShiftLeft: U32(U32, U8, U1),
    LogicalShiftRight: U32(U32, U8, U1),
    ArithmeticShiftRight: U32(U32, U8, U1),
    RotateRight: U32(U32, U8, U1),
    RotateRightExtended: U32(U32, U1),

    // Tests and narrowing.
    MostSignificantBit: U1(U32),
    IsZero: U1(U32),
    LeastSignificantByte: U8(U32),
    LeastSignificantHalf: U16(U32),
    SignExtendByteToWord: U32(U8),
    SignExtendHalfToWord: U32(U16),
    ZeroExtendByteToWord: U32(U8),
    ZeroExtendHalfToWord: U32(U16),
    ByteReverseWord: U32(U32),
    ByteReverseHalf: U16(U16),
    ByteReverseDual: U64(U64),

    // Memory. Reads may have side effects (MMIO) and are never pure.
    ReadMemory8: U8(U32),
    ReadMemory16: U16(U32),
    ReadMemory32: U32(U32),
    ReadMemory64: U64(U32),
    WriteMemory8: Void(U32, U8),
    WriteMemory16: Void(U32, U16),
    WriteMemory32: Void(U32, U32),
    WriteMemory64: Void(U32, U64),

    // Exceptional control.
    CallSupervisor: Void(U32),

    // Vector floating point, parameterized by element width.
    FPVectorAbs16: Vector(Vector),
    FPVectorAbs32: Vector(Vector),
    FPVectorAbs64: Vector(Vector),
    FPVectorNeg16: Vector(Vector),
    FPVectorNeg32: Vector(Vector),
    FPVectorNeg64: Vector(Vector),
    FPVectorAdd32: Vector(Vector, Vector),
    FPVectorAdd64: Vector(Vector, Vector),
    FPVectorSub32: Vector(Vector, Vector),
    FPVectorSub64: Vector(Vector, Vector),
    FPVectorMul32: Vector(Vector, Vector),
    FPVectorMul64: Vector(Vector, Vector),
    FPVectorDiv32: Vector(Vector, Vector),
    FPVectorDiv64: Vector(Vector, Vector),
    FPVectorMin32: Vector(Vector, Vector),
    FPVectorMin64: Vector(Vector, Vector),
    FPVectorMax32: Vector(Vector, Vector),
    FPVectorMax64: Vector(Vector, Vector),
    FPVectorMulAdd32: Vector(Vector, Vector, Vector),
    FPVectorMulAdd64: Vector(Vector, Vector, Vector),
    FPVectorPairedAdd32: Vector(Vector, Vector),
    FPVectorPairedAdd64: Vector(Vector, Vector),
    FPVectorPairedAddLower32: Vector(Vector, Vector),
    FPVectorPairedAddLower64: Vector(Vector, Vector),
    FPVectorEqual32: Vector(Vector, Vector),
    FPVectorEqual64: Vector(Vector, Vector),
    FPVectorGreater32: Vector(Vector, Vector),
    FPVectorGreater64: Vector(Vector, Vector),
    FPVectorGreaterEqual32: Vector(Vector, Vector),
    FPVectorGreaterEqual64: Vector(Vector, Vector),
    FPVectorRecipEstimate32: Vector(Vector),
    FPVectorRecipEstimate64: Vector(Vector),
    FPVectorRecipStepFused32: Vector(Vector, Vector),
    FPVectorRecipStepFused64: Vector(Vector, Vector),
    FPVectorRSqrtEstimate32: Vector(Vector),
    FPVectorRSqrtEstimate64: Vector(Vector),
    FPVectorRSqrtStepFused32: Vector(Vector, Vector),
    FPVectorRSqrtStepFused64: Vector(Vector, Vector),
    // args: operand, fbits, rounding mode.
    FPVectorToSignedFixed32: Vector(Vector, U8, U8),
    FPVectorToSignedFixed64: Vector(Vector, U8, U8),
    FPVectorToUnsignedFixed32: Vector(Vector, U8, U8),
    FPVectorToUnsignedFixed64: Vector(Vector, U8, U8),
    FPVectorS32ToSingle: Vector(Vector),
    FPVectorU32ToSingle: Vector(Vector),
    FPVectorS64ToDouble: Vector(Vector),
    FPVectorU64ToDouble: Vector(Vector),
}

impl Opcode {
    /// Whether the operation has observable effects beyond its result.
    /// Such instructions are never removed by dead-code elimination.
    /// Memory reads count: an MMIO read is an effect.
    pub fn has_side_effects(self) -> bool {
        matches!(
            self,
            Opcode::SetRegister
                | Opcode::SetVector
                | Opcode::SetNFlag
                | Opcode::SetZFlag
                | Opcode::SetCFlag
                | Opcode::SetVFlag
                | Opcode::ReadMemory8
                | Opcode::ReadMemory16
                | Opcode::ReadMemory32
                | Opcode::ReadMemory64
                | Opcode::WriteMemory8
                | Opcode::WriteMemory16
                | Opcode::WriteMemory32
                | Opcode::WriteMemory64
                | Opcode::CallSupervisor
        )
    }

    /// Memory-read width in bytes, if this is a memory read.
    pub fn memory_read_width(self) -> Option<u32> {
        match self {
            Opcode::ReadMemory8 => Some(1),
            Opcode::ReadMemory16 => Some(2),
            Opcode::ReadMemory32 => Some(4),
            Opcode::ReadMemory64 => Some(8),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signatures() {
        assert_eq!(Opcode::AddWithCarry.result_type(), Type::U32);
        assert_eq!(
            Opcode::AddWithCarry.arg_types(),
            &[Type::U32, Type::U32, Type::U1]
        );
        assert_eq!(Opcode::SetCFlag.result_type(), Type::Void);
        assert_eq!(Opcode::FPVectorMulAdd32.arg_types().len(), 3);
    }

    #[test]
    fn test_side_effects() {
        assert!(Opcode::SetRegister.has_side_effects());
        assert!(Opcode::ReadMemory32.has_side_effects());
        assert!(!Opcode::AddWithCarry.has_side_effects());
        assert!(!Opcode::GetCarryFromOp.has_side_effects());
    }
}
