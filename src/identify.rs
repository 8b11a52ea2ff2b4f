use alloc::string::String;
use core::ffi::CStr;

/// What `dladdr` knows about an address in this process.
#[derive(Debug, Default)]
pub(crate) struct Identity {
    pub(crate) object: Option<String>,
    pub(crate) symbol: Option<String>,
}

pub(crate) fn identify(addr: usize) -> Identity {
    unsafe {
        let mut info: libc::Dl_info = core::mem::zeroed();

        if libc::dladdr(addr as *const libc::c_void, &mut info) == 0 {
            return Identity::default();
        }

        let to_string = |ptr: *const libc::c_char| {
            (!ptr.is_null()).then(|| CStr::from_ptr(ptr).to_string_lossy().into_owned())
        };

        Identity {
            object: to_string(info.dli_fname),
            symbol: to_string(info.dli_sname),
        }
    }
}
