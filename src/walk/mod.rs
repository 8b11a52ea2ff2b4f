//! Walking the stack, one sender frame at a time.
//!
//! Every step reads the return address of the current frame, finds the CFI
//! for it and computes the caller's CFA. Anything that goes wrong on the way
//! (unreadable memory, unusable CFI, a CFA that does not move up the stack)
//! ends the walk instead of surfacing as an error, so callers always get the
//! frames that could be recovered.

mod fp;

#[cfg(test)]
mod tests;

use alloc::string::String;

use crate::{
    arch::RegisterConvention,
    dwarf::{CfaRegister, CfiInfo, CfiParser},
    target::{Library, MemoryError, Target, ThreadContext},
    Address,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Stop unwinding after this many frames. A corrupted stack can send the
    /// walk through a lot of garbage before the CFA checks catch it.
    pub max_frames: usize,
}

impl Config {
    pub const DEFAULT_MAX_FRAMES: usize = 1024;
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frames: Self::DEFAULT_MAX_FRAMES,
        }
    }
}

/// One frame of the walked stack.
///
/// Frames do not point at each other; the caller of a frame is computed on
/// demand by [`Unwinder::sender`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pc: Address,
    cfa: Address,
    base_pointer: Option<Address>,
    cfi: Option<CfiInfo>,
    is_final: bool,
    fallback: bool,
}

impl Frame {
    fn final_frame(pc: Address, cfa: Address) -> Self {
        Self {
            pc,
            cfa,
            base_pointer: None,
            cfi: None,
            is_final: true,
            fallback: false,
        }
    }

    pub fn pc(&self) -> Address {
        self.pc
    }

    /// The Canonical Frame Address. For frame pointer frames this is the
    /// frame pointer, for final frames a lower bound of the real CFA.
    pub fn cfa(&self) -> Address {
        self.cfa
    }

    pub fn local_variable_base(&self) -> Address {
        self.cfa
    }

    /// The value of the base pointer register in this frame, if known.
    pub fn base_pointer(&self) -> Option<Address> {
        self.base_pointer
    }

    /// `None` for frames that are not native or whose CFI could not be used.
    pub fn cfi(&self) -> Option<&CfiInfo> {
        self.cfi.as_ref()
    }

    /// Whether the walk ends here. Final frames are where native unwinding
    /// gives up, e.g. because the code is managed or has unusable CFI.
    pub fn is_final(&self) -> bool {
        self.is_final
    }

    /// Whether the CFI was found at `pc - 1`, because `pc` is a return
    /// address just past the end of its function.
    pub fn return_address_fallback_used(&self) -> bool {
        self.fallback
    }

    /// The address to use for symbol lookups.
    pub fn lookup_pc(&self) -> Address {
        if self.fallback {
            self.pc.offset(-1).unwrap_or(self.pc)
        } else {
            self.pc
        }
    }

    pub fn sender<T, C>(
        &self,
        unwinder: &Unwinder<'_, T, C>,
        context: &dyn ThreadContext,
    ) -> Option<Frame>
    where
        T: Target + ?Sized,
        C: RegisterConvention,
    {
        unwinder.sender(self, context)
    }

    /// The stack pointer of the caller once this frame has returned.
    fn caller_stack_pointer(&self, word: u8) -> Option<Address> {
        match self.cfi {
            Some(_) => Some(self.cfa),
            None => fp::caller_stack_pointer(self.cfa, word),
        }
    }

    /// The CFA given to a final frame for the caller. Its real CFA is
    /// unknown, but lies at least one word above its stack pointer, past the
    /// return address it was called with.
    fn handoff_cfa(&self, word: u8) -> Option<Address> {
        self.caller_stack_pointer(word)?.offset(i64::from(word))
    }
}

/// Walks the stacks of one target.
pub struct Unwinder<'t, T: ?Sized, C> {
    target: &'t T,
    convention: C,
    config: Config,
}

impl<'t, T, C> Unwinder<'t, T, C>
where
    T: Target + ?Sized,
    C: RegisterConvention,
{
    pub fn new(target: &'t T, convention: C) -> Self {
        Self::with_config(target, convention, Config::default())
    }

    pub fn with_config(target: &'t T, convention: C, config: Config) -> Self {
        Self {
            target,
            convention,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn convention(&self) -> &C {
        &self.convention
    }

    /// The innermost frame, straight from the registers.
    #[instrument(level = "debug", skip_all)]
    pub fn top_frame(&self, context: &dyn ThreadContext) -> Option<Frame> {
        let Some(pc) = context.register_as_address(self.convention.program_counter()) else {
            debug!("context has no program counter");
            return None;
        };
        let bp = context.register_as_address(self.convention.base_pointer());

        let frame_pointer_frame = |is_final| {
            let cfa = bp.filter(|bp| !bp.is_null())?;
            Some(Frame {
                pc,
                cfa,
                base_pointer: bp,
                cfi: None,
                is_final,
                fallback: false,
            })
        };

        let Some(library) = self.target.find_library(pc) else {
            debug!(%pc, "top frame is not native, following the frame pointer");
            return frame_pointer_frame(false);
        };

        let cfi = CfiParser::new(&library, &self.convention).and_then(|p| p.process(pc.value()));
        let cfi = match cfi {
            Ok(cfi) => cfi,
            Err(err) => {
                debug!(%pc, %err, "no usable CFI for the top frame");
                return frame_pointer_frame(true);
            }
        };

        let base = match cfi.cfa_register() {
            CfaRegister::BasePointer => bp,
            CfaRegister::StackPointer => {
                context.register_as_address(self.convention.stack_pointer())
            }
            CfaRegister::Other(register) => context.register_as_address(register),
        };
        let cfa = base
            .and_then(|base| base.offset(cfi.cfa_offset()))
            .filter(|cfa| !cfa.is_null());
        let Some(cfa) = cfa else {
            debug!(?cfi, "cannot compute the CFA of the top frame");
            return None;
        };

        Some(Frame {
            pc,
            cfa,
            base_pointer: bp,
            cfi: Some(cfi),
            is_final: false,
            fallback: false,
        })
    }

    /// The caller of `frame`, or `None` if the walk cannot go on.
    ///
    /// `context` is the register context the walk started from. Only its
    /// stack pointer is used, to check the result. Base pointers come from
    /// the chain of frames.
    #[instrument(level = "debug", skip_all, fields(pc = %frame.pc, cfa = %frame.cfa))]
    pub fn sender(&self, frame: &Frame, context: &dyn ThreadContext) -> Option<Frame> {
        if frame.is_final {
            return None;
        }
        let word = self.convention.address_size();

        let return_address_slot = match &frame.cfi {
            Some(cfi) => frame.cfa.offset(cfi.return_address_offset_from_cfa()),
            None => fp::return_address_slot(frame.cfa, word),
        }?;
        let next_pc = self
            .read_address(return_address_slot)
            .inspect_err(|err| debug!(%err, "cannot read the return address"))
            .ok()?;
        if next_pc.is_null() {
            debug!("null return address, reached the end of the stack");
            return None;
        }

        let Some(library) = self.target.find_library(next_pc) else {
            debug!(%next_pc, "caller is not native");
            return Some(Frame::final_frame(next_pc, frame.handoff_cfa(word)?));
        };
        let Some((cfi, fallback)) = self.resolve_cfi(&library, next_pc) else {
            return Some(Frame::final_frame(next_pc, frame.handoff_cfa(word)?));
        };

        let caller_sp = frame.caller_stack_pointer(word)?;
        let caller_bp = self.caller_base_pointer(frame);
        let base = match cfi.cfa_register() {
            CfaRegister::BasePointer => caller_bp,
            CfaRegister::StackPointer => Some(caller_sp),
            CfaRegister::Other(register) => {
                debug!(register, "the caller's CFA register cannot be recovered");
                return None;
            }
        };
        let next_cfa = base?.offset(cfi.cfa_offset())?;

        if !self.is_valid_sender(frame, next_cfa, context) {
            return None;
        }

        Some(Frame {
            pc: next_pc,
            cfa: next_cfa,
            base_pointer: caller_bp,
            cfi: Some(cfi),
            is_final: false,
            fallback,
        })
    }

    /// CFI for a return address, retrying one byte earlier for calls that
    /// are the last instruction of their function.
    fn resolve_cfi<L: Library>(&self, library: &L, pc: Address) -> Option<(CfiInfo, bool)> {
        let parser = CfiParser::new(library, &self.convention)
            .inspect_err(|err| debug!(library = library.name(), %err))
            .ok()?;

        match parser.process(pc.value()) {
            Ok(cfi) => return Some((cfi, false)),
            Err(err) => debug!(%pc, %err, "retrying one byte before the return address"),
        }

        match parser.process(pc.offset(-1)?.value()) {
            Ok(cfi) => Some((cfi, true)),
            Err(err) => {
                debug!(library = library.name(), %pc, %err, "giving up on native unwinding");
                None
            }
        }
    }

    /// The base pointer as the caller left it.
    fn caller_base_pointer(&self, frame: &Frame) -> Option<Address> {
        let slot = match &frame.cfi {
            Some(cfi) => match cfi.base_pointer_offset_from_cfa() {
                Some(offset) => frame.cfa.offset(offset)?,
                // Not saved, so the callee has not touched it.
                None => return frame.base_pointer,
            },
            None => fp::saved_frame_pointer_slot(frame.cfa),
        };
        self.read_address(slot)
            .inspect_err(|err| debug!(%err, "cannot read the saved base pointer"))
            .ok()
    }

    fn is_valid_sender(&self, callee: &Frame, cfa: Address, context: &dyn ThreadContext) -> bool {
        if cfa.is_null() {
            debug!("null CFA");
            return false;
        }
        if let Some(sp) = context.register_as_address(self.convention.stack_pointer()) {
            if cfa < sp {
                debug!(%cfa, %sp, "CFA is below the stack pointer");
                return false;
            }
        }
        if cfa <= callee.cfa {
            debug!(%cfa, callee = %callee.cfa, "CFA does not move up the stack");
            return false;
        }
        true
    }

    fn read_address(&self, address: Address) -> Result<Address, MemoryError> {
        let size = usize::from(self.convention.address_size());
        if !(1..=8).contains(&size) || address.value() % size as u64 != 0 {
            return Err(MemoryError::Unaligned(address));
        }
        let mut buf = [0; 8];
        self.target.read_memory(address, &mut buf[..size])?;
        Ok(Address(u64::from_le_bytes(buf)))
    }

    /// Walk the stack described by `context`, starting at the top frame.
    pub fn unwind<'a>(&'a self, context: &'a dyn ThreadContext) -> Frames<'a, T, C> {
        Frames {
            unwinder: self,
            context,
            state: State::Top,
            yielded: 0,
        }
    }

    /// Continue a walk from a frame it produced earlier, with the context it
    /// started from. `frame` is yielded first.
    pub fn unwind_from<'a>(
        &'a self,
        frame: Frame,
        context: &'a dyn ThreadContext,
    ) -> Frames<'a, T, C> {
        Frames {
            unwinder: self,
            context,
            state: State::Resume(frame),
            yielded: 0,
        }
    }

    /// The symbol for a frame, for display.
    pub fn symbol(&self, frame: &Frame) -> Option<String> {
        self.target.symbol(frame.lookup_pc())
    }
}

enum State {
    Top,
    Resume(Frame),
    After(Frame),
    Done,
}

/// The frames of one stack, innermost first. Each frame is only computed
/// when asked for.
pub struct Frames<'a, T: ?Sized, C> {
    unwinder: &'a Unwinder<'a, T, C>,
    context: &'a dyn ThreadContext,
    state: State,
    yielded: usize,
}

impl<T, C> Iterator for Frames<'_, T, C>
where
    T: Target + ?Sized,
    C: RegisterConvention,
{
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        let max_frames = self.unwinder.config.max_frames;
        if self.yielded >= max_frames {
            if let State::After(frame) = &self.state {
                if !frame.is_final {
                    warn!(max_frames, "frame limit reached, stopping");
                }
            }
            self.state = State::Done;
            return None;
        }

        let frame = match core::mem::replace(&mut self.state, State::Done) {
            State::Top => self.unwinder.top_frame(self.context),
            State::Resume(frame) => Some(frame),
            State::After(callee) => self.unwinder.sender(&callee, self.context),
            State::Done => None,
        }?;

        self.state = State::After(frame);
        self.yielded += 1;
        Some(frame)
    }
}
