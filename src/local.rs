//! Unwinding the current process, with the dynamic linker as the source of
//! call frame information.


use alloc::string::String;

use crate::{
    arch::{capture_context, Amd64},
    dwarf::divination::{loaded_object, LoadedObject},
    identify::identify,
    target::{Library, MemoryError, Section, Target},
    walk::{Config, Frame, Unwinder},
    Address,
};

/// The process we are running in.
#[derive(Debug, Default)]
pub struct LocalProcess {
    _private: (),
}

impl LocalProcess {
    pub fn new() -> Self {
        Self::default()
    }
}

/// An object loaded into this process.
#[derive(Debug)]
pub struct LocalLibrary {
    name: String,
    object: LoadedObject,
}

impl LocalLibrary {
    /// Where the object is mapped.
    pub fn map(&self) -> core::ops::Range<usize> {
        self.object.map.clone()
    }
}

impl Library for LocalLibrary {
    fn name(&self) -> &str {
        &self.name
    }

    fn eh_frame(&self) -> Option<Section<'_>> {
        Some(self.object.eh_frame)
    }

    fn eh_frame_hdr(&self) -> Option<Section<'_>> {
        Some(self.object.eh_frame_hdr)
    }
}

impl Target for LocalProcess {
    type Library<'a> = LocalLibrary;

    fn find_library(&self, pc: Address) -> Option<Self::Library<'_>> {
        let addr = usize::try_from(pc.value()).ok()?;
        let object = loaded_object(addr)?;
        let name = identify(addr).object.unwrap_or_else(|| "<unknown>".into());
        Some(LocalLibrary { name, object })
    }

    fn read_memory(&self, address: Address, buf: &mut [u8]) -> Result<(), MemoryError> {
        let remote_base =
            usize::try_from(address.value()).map_err(|_| MemoryError::Unmapped(address))?;

        let local = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        let remote = libc::iovec {
            iov_base: remote_base as *mut libc::c_void,
            iov_len: buf.len(),
        };

        // A bad address fails the syscall instead of faulting.
        let read = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
        if read < 0 || read as usize != buf.len() {
            trace!(%address, read, "process_vm_readv failed");
            return Err(MemoryError::Unmapped(address));
        }
        Ok(())
    }

    fn symbol(&self, pc: Address) -> Option<String> {
        identify(usize::try_from(pc.value()).ok()?).symbol
    }
}

/// Walk the stack of the calling thread, handing every frame to `f` until it
/// returns `false` or the walk ends. The first frame is the function that
/// called `trace`.
#[inline(never)]
pub fn trace<F>(config: Config, mut f: F)
where
    F: FnMut(&Unwinder<'_, LocalProcess, Amd64>, &Frame) -> bool,
{
    let context = capture_context();
    let process = LocalProcess::new();
    let unwinder = Unwinder::with_config(&process, Amd64, config);

    // Skip our own frame.
    for frame in unwinder.unwind(&context).skip(1) {
        if !f(&unwinder, &frame) {
            break;
        }
    }
}
