//! Immutable heap strings.

use memory::{Address, AllocationError, Handle, Ptr, ZERO_ALLOC_ADDRESS};

/// An immutable UTF-8 byte sequence: a pointer to a byte block plus a
/// length. Empty strings point at the zero-allocation sentinel.
#[repr(C)]
pub struct VmString {
    data: Ptr<u8>,
    len: usize,
}

impl VmString {
    pub fn create(s: &str) -> Result<Handle<VmString>, AllocationError> {
        // SAFETY: raw byte block, initialized right below.
        let data = unsafe { Handle::<u8>::alloc(s.len())? };
        if !s.is_empty() {
            // SAFETY: the block holds at least s.len() bytes.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    s.as_ptr(),
                    data.address() as *mut u8,
                    s.len(),
                );
            }
        }

        // SAFETY: fields are initialized before the handle escapes.
        unsafe {
            let handle =
                Handle::<VmString>::alloc(std::mem::size_of::<VmString>())?;
            let obj = &mut *(handle.address() as *mut VmString);
            obj.data.set(data.address());
            obj.len = s.len();
            Ok(handle)
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_str(&self) -> &str {
        if self.len == 0 {
            return "";
        }
        debug_assert_ne!(self.data.address(), 0);
        debug_assert_ne!(self.data.address(), ZERO_ALLOC_ADDRESS);
        // SAFETY: constructed from a &str of this length; the data block is
        // kept alive by the pointer bit on `data`.
        unsafe {
            std::str::from_utf8_unchecked(std::slice::from_raw_parts(
                self.data.address() as *const u8,
                self.len,
            ))
        }
    }

    pub fn data_address(&self) -> Address {
        self.data.address()
    }
}

impl PartialEq for VmString {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for VmString {}

impl std::fmt::Display for VmString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory::heap;

    #[test]
    fn round_trips_content() {
        let s = VmString::create("main").expect("allocate string");
        assert_eq!(s.as_str(), "main");
        assert_eq!(s.len(), 4);
        assert!(!s.is_empty());
    }

    #[test]
    fn empty_string_uses_the_sentinel() {
        let s = VmString::create("").expect("allocate string");
        assert_eq!(s.as_str(), "");
        assert!(s.is_empty());
        assert_eq!(s.data_address(), ZERO_ALLOC_ADDRESS);
    }

    #[test]
    fn survives_collection_through_a_handle() {
        let s = VmString::create("persistent").expect("allocate string");
        heap().collect_garbage();
        assert_eq!(s.as_str(), "persistent");
    }
}
