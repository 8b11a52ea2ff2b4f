//! The frame pointer convention, for frames we have no CFI for: the frame
//! pointer points at the caller's saved frame pointer, with the return
//! address one word above it.
//!
//! ```text
//! fp + 2 * word   caller's stack pointer after return
//! fp + word       return address
//! fp              caller's frame pointer
//! ```

use crate::Address;

pub(super) fn saved_frame_pointer_slot(fp: Address) -> Address {
    fp
}

pub(super) fn return_address_slot(fp: Address, word: u8) -> Option<Address> {
    fp.offset(i64::from(word))
}

pub(super) fn caller_stack_pointer(fp: Address, word: u8) -> Option<Address> {
    fp.offset(2 * i64::from(word))
}
