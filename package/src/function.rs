//! Function objects.

use memory::{Address, AllocationError, Handle, Ptr};

use crate::safepoints::Safepoints;
use crate::string::VmString;
use crate::types::{Type, TypeKind};
use crate::verify;
use crate::{Package, ValidateError};

/// A pointer-plus-length view of a sized heap block, stored inline in a
/// containing object. The data word is barrier-recorded so the collector
/// traces the payload block.
#[repr(C)]
pub struct BoundArray<T> {
    data: Ptr<T>,
    len: usize,
}

impl<T> BoundArray<T> {
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    pub fn data_address(&self) -> Address {
        self.data.address()
    }

    /// # Safety
    ///
    /// The array must have been initialized with `len` valid elements.
    unsafe fn slice(&self) -> &[T] {
        std::slice::from_raw_parts(self.data.address() as *const T, self.len)
    }

    unsafe fn init(&mut self, data: Address, len: usize) {
        self.data.set(data);
        self.len = len;
    }
}

/// A verified or to-be-verified function on the managed heap.
#[repr(C)]
pub struct Function {
    name: Ptr<VmString>,
    param_types: BoundArray<Ptr<Type>>,
    return_types: BoundArray<Ptr<Type>>,
    insts: BoundArray<u8>,
    safepoints: Ptr<Safepoints>,
    /// Maximum operand-stack size in words, as recorded by the verifier or
    /// the package file.
    frame_size: usize,
}

impl Function {
    /// Assemble a function object from rooted parts. `safepoints` may be
    /// absent for functions that have not been verified yet.
    pub fn create(
        name: &Handle<VmString>,
        param_types: &[Handle<Type>],
        return_types: &[Handle<Type>],
        insts: &[u8],
        safepoints: Option<&Handle<Safepoints>>,
        frame_size: u16,
    ) -> Result<Handle<Function>, AllocationError> {
        let params = Self::type_array(param_types)?;
        let returns = Self::type_array(return_types)?;

        // SAFETY: raw byte block, filled right below.
        let inst_block = unsafe { Handle::<u8>::alloc(insts.len())? };
        if !insts.is_empty() {
            // SAFETY: the block holds at least insts.len() bytes.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    insts.as_ptr(),
                    inst_block.address() as *mut u8,
                    insts.len(),
                );
            }
        }

        // SAFETY: every field is initialized before the handle escapes.
        unsafe {
            let handle =
                Handle::<Function>::alloc(std::mem::size_of::<Function>())?;
            let f = &mut *(handle.address() as *mut Function);
            f.name.set(name.address());
            f.param_types.init(params.address(), param_types.len());
            f.return_types.init(returns.address(), return_types.len());
            f.insts.init(inst_block.address(), insts.len());
            if let Some(sp) = safepoints {
                f.safepoints.set(sp.address());
            }
            f.frame_size = frame_size as usize;
            Ok(handle)
        }
    }

    /// Allocate a block of barrier-recorded type pointer words.
    fn type_array(
        types: &[Handle<Type>],
    ) -> Result<Handle<u8>, AllocationError> {
        // SAFETY: each word is initialized through Ptr::set below.
        unsafe {
            let block = Handle::<u8>::alloc(
                types.len() * std::mem::size_of::<Ptr<Type>>(),
            )?;
            for (i, t) in types.iter().enumerate() {
                let slot = &mut *((block.address()
                    + i * std::mem::size_of::<Ptr<Type>>())
                    as *mut Ptr<Type>);
                slot.set(t.address());
            }
            Ok(block)
        }
    }

    pub fn name(&self) -> &VmString {
        // SAFETY: set to a live VmString at creation.
        unsafe { self.name.as_ref() }
    }

    pub fn param_types(&self) -> &[Ptr<Type>] {
        // SAFETY: initialized with len valid type pointers at creation.
        unsafe { self.param_types.slice() }
    }

    pub fn return_types(&self) -> &[Ptr<Type>] {
        // SAFETY: initialized with len valid type pointers at creation.
        unsafe { self.return_types.slice() }
    }

    pub fn param_kind(&self, index: usize) -> TypeKind {
        // SAFETY: param type words always hold live Type blocks.
        unsafe { self.param_types()[index].as_ref().kind() }
    }

    pub fn return_kind(&self, index: usize) -> TypeKind {
        // SAFETY: return type words always hold live Type blocks.
        unsafe { self.return_types()[index].as_ref().kind() }
    }

    pub fn insts(&self) -> &[u8] {
        // SAFETY: initialized with len instruction bytes at creation.
        unsafe { self.insts.slice() }
    }

    pub fn safepoints(&self) -> Option<&Safepoints> {
        if self.safepoints.is_null() {
            None
        } else {
            // SAFETY: set to a live Safepoints table when present.
            Some(unsafe { self.safepoints.as_ref() })
        }
    }

    /// Install a safepoint table built by the verifier.
    pub fn set_safepoints(&mut self, safepoints: &Handle<Safepoints>) {
        self.safepoints.set(safepoints.address());
    }

    /// Maximum frame size in words.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn set_frame_size(&mut self, frame_size: u16) {
        self.frame_size = frame_size as usize;
    }

    /// Total words the return values occupy on the stack.
    pub fn return_slot_size(&self) -> usize {
        (0..self.return_types().len())
            .map(|i| self.return_kind(i).slot_size())
            .sum()
    }

    /// Total words the parameters occupy on the stack.
    pub fn param_slot_size(&self) -> usize {
        (0..self.param_types().len())
            .map(|i| self.param_kind(i).slot_size())
            .sum()
    }

    /// Run the verifier and check the stored safepoint table against an
    /// independently built one.
    pub fn validate(&self, package: &Package) -> Result<(), ValidateError> {
        let name = self.name().as_str().to_string();
        let built = verify::build_safepoints(self, package)?;
        match self.safepoints() {
            Some(stored) if *stored == *built => Ok(()),
            Some(_) => Err(ValidateError::new(
                name,
                "stored safepoint table does not match bytecode",
            )),
            None => {
                Err(ValidateError::new(name, "function has no safepoint table"))
            }
        }
    }
}
