//! The virtual machine: process bootstrap and the bytecode interpreter.

pub mod interpreter;

use std::sync::Once;

use memory::{handle_table, heap, set_safepoint_visitor, stack_pool, Address};
use package::{roots, Function};

pub use interpreter::{interpret, Interpreted, RuntimeError};

static INIT: Once = Once::new();

/// Bring up the process-wide VM state in dependency order: heap, handle
/// table, stack pool, then the interned roots (whose construction holds
/// the GC lock). Safe to call repeatedly; [`interpret`] calls it itself.
pub fn init() {
    INIT.call_once(|| {
        heap();
        handle_table();
        stack_pool();
        roots();
        set_safepoint_visitor(visit_frame_slots);
    });
}

/// Visit the pointer slots of one suspended frame, as flagged by the
/// function's safepoint bitmap at the frame's resumption PC.
///
/// # Safety
///
/// `fn_addr` must be a live function block stored in a frame by the
/// interpreter; `fp` must be that frame's base.
unsafe fn visit_frame_slots(
    fn_addr: Address,
    ip: Address,
    fp: Address,
    visit: &mut dyn FnMut(Address),
) {
    let function = &*(fn_addr as *const Function);
    let Some(safepoints) = function.safepoints() else {
        return;
    };
    let Some(bits) = safepoints.bits_at(ip as u32) else {
        return;
    };
    for slot in 0..safepoints.frame_size() as usize {
        if bits[slot / 8] & (1 << (slot % 8)) != 0 {
            // Slot i lives i+1 words below the frame base, like the
            // interpreter's locals.
            visit(*((fp - (slot + 1) * memory::WORD_SIZE) as *const usize));
        }
    }
}
