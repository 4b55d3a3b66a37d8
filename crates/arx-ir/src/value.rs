//! IR values: immediates and references to earlier instructions.

use std::fmt;

/// Index of an instruction within its block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InstRef(pub u32);

impl InstRef {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Width class of a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    U1,
    U8,
    U16,
    U32,
    U64,
    /// 128-bit vector.
    Vector,
    /// No value produced.
    Void,
}

/// An IR value: an immediate literal or a reference to the result of an
/// earlier instruction in the same block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Value {
    U1(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Vector(u128),
    Inst(InstRef),
}

impl Value {
    pub const fn is_immediate(self) -> bool {
        !matches!(self, Value::Inst(_))
    }

    pub fn inst_ref(self) -> Option<InstRef> {
        match self {
            Value::Inst(r) => Some(r),
            _ => None,
        }
    }

    /// Type of an immediate. `None` for instruction references, whose type
    /// comes from the defining opcode.
    pub fn immediate_type(self) -> Option<Type> {
        match self {
            Value::U1(_) => Some(Type::U1),
            Value::U8(_) => Some(Type::U8),
            Value::U16(_) => Some(Type::U16),
            Value::U32(_) => Some(Type::U32),
            Value::U64(_) => Some(Type::U64),
            Value::Vector(_) => Some(Type::Vector),
            Value::Inst(_) => None,
        }
    }

    pub fn as_u1(self) -> bool {
        match self {
            Value::U1(v) => v,
            _ => panic!("not a U1 immediate: {self:?}"),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Value::U8(v) => v,
            _ => panic!("not a U8 immediate: {self:?}"),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Value::U32(v) => v,
            _ => panic!("not a U32 immediate: {self:?}"),
        }
    }

    pub fn as_u64(self) -> u64 {
        match self {
            Value::U64(v) => v,
            _ => panic!("not a U64 immediate: {self:?}"),
        }
    }

    pub fn as_vector(self) -> u128 {
        match self {
            Value::Vector(v) => v,
            _ => panic!("not a vector immediate: {self:?}"),
        }
    }

    /// Immediate zero-extended to 64 bits. Panics on references and vectors.
    pub fn zext_to_u64(self) -> u64 {
        match self {
            Value::U1(v) => u64::from(v),
            Value::U8(v) => u64::from(v),
            Value::U16(v) => u64::from(v),
            Value::U32(v) => u64::from(v),
            Value::U64(v) => v,
            _ => panic!("not a scalar immediate: {self:?}"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::U1(v) => write!(f, "#{}", u8::from(*v)),
            Value::U8(v) => write!(f, "#{v:#x}"),
            Value::U16(v) => write!(f, "#{v:#x}"),
            Value::U32(v) => write!(f, "#{v:#x}"),
            Value::U64(v) => write!(f, "#{v:#x}"),
            Value::Vector(v) => write!(f, "#{v:#034x}"),
            Value::Inst(r) => write!(f, "%{}", r.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_types() {
        assert_eq!(Value::U1(true).immediate_type(), Some(Type::U1));
        assert_eq!(Value::U32(5).immediate_type(), Some(Type::U32));
        assert_eq!(Value::Inst(InstRef(0)).immediate_type(), None);
    }

    #[test]
    fn test_zext() {
        assert_eq!(Value::U8(0xFF).zext_to_u64(), 0xFF);
        assert_eq!(Value::U32(0xFFFF_FFFF).zext_to_u64(), 0xFFFF_FFFF);
    }
}
