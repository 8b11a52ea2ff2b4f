//! # divination
//!
//! the practice of seeking knowledge of the future or the unknown by
//! supernatural means.
//!
//! we ask supernatural means (the dynamic linker) for knowledge of the future
//! (where we will find the dwarves)
//!
//! for an address in the current process, the GNU extension
//! [`_dl_find_object`](https://www.gnu.org/software/libc/manual/html_node/Dynamic-Linker-Introspection.html)
//! tells us which object is mapped there and where its `PT_GNU_EH_FRAME`
//! segment (the `.eh_frame_hdr` section) is. That header in turn points at
//! `.eh_frame`.

#![allow(non_camel_case_types)]

use core::{ffi, ops::Range};

use super::hdr::EhFrameHdr;
use crate::target::Section;

#[repr(C)]
struct dl_find_object {
    dlfo_flags: ffi::c_ulonglong,
    dlfo_map_start: *const ffi::c_void,
    dlfo_map_end: *const ffi::c_void,
    dlf_link_map: *const ffi::c_void,
    /// A pointer to the `PT_GNU_EH_FRAME` segment (the `.eh_frame_hdr`
    /// section).
    dlfo_eh_frame: *const ffi::c_void,
    __dlfo_reserved: [ffi::c_ulonglong; 7],
}

extern "C" {
    fn _dl_find_object(address: *const ffi::c_void, result: *mut dl_find_object) -> ffi::c_int;
}

/// Call frame sections of an object loaded into this process.
#[derive(Debug, Clone)]
pub(crate) struct LoadedObject {
    pub(crate) map: Range<usize>,
    pub(crate) eh_frame_hdr: Section<'static>,
    pub(crate) eh_frame: Section<'static>,
}

/// Ask the dynamic linker about the object containing `addr`.
#[instrument(level = "debug", skip_all, fields(addr = %crate::Address(addr as u64)))]
pub(crate) fn loaded_object(addr: usize) -> Option<LoadedObject> {
    let out = unsafe {
        let mut out: dl_find_object = core::mem::zeroed();
        let ret = _dl_find_object(addr as *const ffi::c_void, &mut out);
        trace!("_dl_find_object returned {ret}");
        if ret != 0 {
            return None;
        }
        out
    };

    if out.dlfo_eh_frame.is_null() {
        trace!("dlfo_eh_frame is null");
        return None;
    }

    let map_start = out.dlfo_map_start as usize;
    let map_end = out.dlfo_map_end as usize;
    let hdr_start = out.dlfo_eh_frame as usize;
    trace!(
        "dwarf info; map: ({map_start:#x}, {:#x}), eh_frame_hdr: {hdr_start:#x}",
        map_end - map_start
    );

    if !(map_start..map_end).contains(&addr) || !(map_start..map_end).contains(&hdr_start) {
        trace!("dl_find_object returned object out of range for addr: {addr:#x}");
        return None;
    }

    // SAFETY: the header lies inside the object's mapping, which stays
    // mapped for as long as the object is loaded. The slice extends to the
    // end of the mapping; only the bytes the header and the tables it
    // references describe are ever read.
    let eh_frame_hdr = Section::new(hdr_start as u64, unsafe {
        core::slice::from_raw_parts(hdr_start as *const u8, map_end - hdr_start)
    });

    let hdr = EhFrameHdr::parse(&eh_frame_hdr, core::mem::size_of::<usize>() as u8)
        .inspect_err(|err| debug!(%err, "unusable eh_frame_hdr"))
        .ok()?;

    let eh_frame_start = usize::try_from(hdr.eh_frame_ptr).ok()?;
    if !(map_start..map_end).contains(&eh_frame_start) {
        trace!("eh_frame at {eh_frame_start:#x} is outside of the mapping");
        return None;
    }
    trace!("eh_frame: {eh_frame_start:#x}");

    // SAFETY: as above.
    let eh_frame = Section::new(eh_frame_start as u64, unsafe {
        core::slice::from_raw_parts(eh_frame_start as *const u8, map_end - eh_frame_start)
    });

    Some(LoadedObject {
        map: map_start..map_end,
        eh_frame_hdr,
        eh_frame,
    })
}
