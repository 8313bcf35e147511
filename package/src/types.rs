//! The value type universe: unit, bool, int64.

use memory::{AllocationError, Handle};

/// Discriminants match the serialized type encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeKind {
    Unit = 1,
    Bool = 2,
    Int64 = 3,
}

impl TypeKind {
    pub fn from_u8(byte: u8) -> Option<TypeKind> {
        match byte {
            1 => Some(TypeKind::Unit),
            2 => Some(TypeKind::Bool),
            3 => Some(TypeKind::Int64),
            _ => None,
        }
    }

    /// Size of a value of this type in serialized form.
    pub const fn byte_size(self) -> usize {
        match self {
            TypeKind::Unit => 0,
            TypeKind::Bool => 1,
            TypeKind::Int64 => 8,
        }
    }

    /// Words one operand-stack entry of this type occupies.
    ///
    /// Every entry takes exactly one word — a `unit` entry is a zeroed
    /// word — so local and argument indices are word offsets and frame
    /// accounting needs no per-type arithmetic.
    pub const fn slot_size(self) -> usize {
        1
    }

    pub const fn name(self) -> &'static str {
        match self {
            TypeKind::Unit => "unit",
            TypeKind::Bool => "bool",
            TypeKind::Int64 => "int64",
        }
    }
}

impl std::fmt::Display for TypeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A type object on the managed heap. Type identity is kind equality.
#[repr(C)]
pub struct Type {
    kind: u8,
}

impl Type {
    pub fn create(kind: TypeKind) -> Result<Handle<Type>, AllocationError> {
        // SAFETY: the block is initialized before the handle escapes.
        unsafe {
            let handle = Handle::<Type>::alloc(std::mem::size_of::<Type>())?;
            (*(handle.address() as *mut Type)).kind = kind as u8;
            Ok(handle)
        }
    }

    #[inline(always)]
    pub fn kind(&self) -> TypeKind {
        TypeKind::from_u8(self.kind).expect("type object holds a valid kind")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_round_trip_through_bytes() {
        for kind in [TypeKind::Unit, TypeKind::Bool, TypeKind::Int64] {
            assert_eq!(TypeKind::from_u8(kind as u8), Some(kind));
        }
        assert_eq!(TypeKind::from_u8(0), None);
        assert_eq!(TypeKind::from_u8(4), None);
    }

    #[test]
    fn type_objects_expose_their_kind() {
        let t = Type::create(TypeKind::Int64).expect("allocate type");
        assert_eq!(t.kind(), TypeKind::Int64);
        assert_eq!(t.kind().byte_size(), 8);
        assert_eq!(t.kind().slot_size(), 1);
    }
}
