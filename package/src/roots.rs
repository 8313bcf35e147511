//! Globally reachable objects, interned once per process.

use memory::{heap, Handle};
use once_cell::sync::Lazy;

use crate::types::{Type, TypeKind};

/// The canonical type objects. Packages intern their type lists against
/// these instead of allocating per-package copies.
pub struct Roots {
    pub unit_type: Handle<Type>,
    pub bool_type: Handle<Type>,
    pub int64_type: Handle<Type>,
}

impl Roots {
    pub fn canonical(&self, kind: TypeKind) -> &Handle<Type> {
        match kind {
            TypeKind::Unit => &self.unit_type,
            TypeKind::Bool => &self.bool_type,
            TypeKind::Int64 => &self.int64_type,
        }
    }
}

static ROOTS: Lazy<Roots> = Lazy::new(|| {
    // Collection stays off while the roots are being wired up; a collection
    // in this window would see a partially constructed root set.
    heap().set_gc_lock(true);
    let roots = Roots {
        unit_type: Type::create(TypeKind::Unit).expect("bootstrap unit type"),
        bool_type: Type::create(TypeKind::Bool).expect("bootstrap bool type"),
        int64_type: Type::create(TypeKind::Int64)
            .expect("bootstrap int64 type"),
    };
    heap().set_gc_lock(false);
    roots
});

/// The process-wide roots, built on first use with the GC lock held.
pub fn roots() -> &'static Roots {
    &ROOTS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_types_are_interned() {
        let r = roots();
        assert_eq!(r.canonical(TypeKind::Unit).kind(), TypeKind::Unit);
        assert_eq!(r.canonical(TypeKind::Bool).kind(), TypeKind::Bool);
        assert_eq!(r.canonical(TypeKind::Int64).kind(), TypeKind::Int64);
        assert_eq!(
            r.canonical(TypeKind::Int64).address(),
            roots().canonical(TypeKind::Int64).address()
        );
    }

    #[test]
    fn canonical_types_survive_collection() {
        let addr = roots().canonical(TypeKind::Bool).address();
        heap().collect_garbage();
        assert!(heap().is_live_block(addr));
        assert_eq!(roots().canonical(TypeKind::Bool).kind(), TypeKind::Bool);
    }
}
