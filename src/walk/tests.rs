use core::ops::Range;

use crate::{
    arch::{Amd64, Registers},
    dwarf::{CfaRegister, CfiInfo},
    testing::{EhFrameBuilder, SyntheticLibrary, SyntheticTarget, PROLOGUE_INSTRUCTIONS},
    walk::{Config, Frame, Unwinder},
    Address,
};

const MAIN: Range<u64> = 0x1000..0x1100;
const HELPER: Range<u64> = 0x2000..0x2100;
const LEAF: Range<u64> = 0x3000..0x3100;
const EH_FRAME: u64 = 0x10000;

/// Somewhere no library is loaded, like JIT-compiled code.
const MANAGED_PC: u64 = 0x9000_0000;

fn program(cie_instructions: &[u8], fde_instructions: &[u8]) -> SyntheticLibrary {
    let mut builder = EhFrameBuilder::new(EH_FRAME);
    let cie = builder.cie_with(b"zR", &[0x1b], cie_instructions);
    for function in [MAIN, HELPER, LEAF] {
        builder.fde(cie, function.start, (function.end - function.start) as u32, fde_instructions);
    }
    SyntheticLibrary::new("program", 0x1000..0x4000).with_eh_frame(EH_FRAME, builder.finish())
}

/// `main -> helper -> leaf`, all with `push rbp; mov rbp, rsp` prologues.
///
/// ```text
/// 0x8088  0        main's return address
/// 0x8080  0        main's caller's rbp
/// 0x8048  0x1050   helper's return address
/// 0x8040  0x8080   main's rbp
/// 0x8018  0x2050   leaf's return address
/// 0x8010  0x8040   helper's rbp   <- rbp
/// 0x8000                          <- rsp
/// ```
fn target() -> SyntheticTarget {
    SyntheticTarget::new()
        .library(program(&[0x0c, 7, 8, 0x90, 1], PROLOGUE_INSTRUCTIONS))
        .word(0x8010, 0x8040)
        .word(0x8018, 0x2050)
        .word(0x8040, 0x8080)
        .word(0x8048, 0x1050)
        .word(0x8080, 0)
        .word(0x8088, 0)
        .with_symbol(MAIN, "main")
        .with_symbol(HELPER, "helper")
        .with_symbol(LEAF, "leaf")
}

fn context() -> Registers {
    Registers::new()
        .with(Amd64::RSP, 0x8000)
        .with(Amd64::RBP, 0x8010)
        .with(Amd64::RA, 0x3050)
}

fn walk(target: &SyntheticTarget, context: &Registers) -> Vec<Frame> {
    Unwinder::new(target, Amd64).unwind(context).collect()
}

fn pcs(frames: &[Frame]) -> Vec<u64> {
    frames.iter().map(|frame| frame.pc().value()).collect()
}

fn cfas(frames: &[Frame]) -> Vec<u64> {
    frames.iter().map(|frame| frame.cfa().value()).collect()
}

#[test]
fn three_frames() {
    let target = target();
    let context = context();
    let unwinder = Unwinder::new(&target, Amd64);

    let frames: Vec<Frame> = unwinder.unwind(&context).collect();

    assert_eq!(pcs(&frames), [0x3050, 0x2050, 0x1050]);
    assert_eq!(cfas(&frames), [0x8020, 0x8050, 0x8090]);
    for frame in &frames {
        assert_eq!(
            frame.cfi(),
            Some(&CfiInfo::new(CfaRegister::BasePointer, 16, Some(-16), -8))
        );
        assert!(!frame.is_final());
        assert!(!frame.return_address_fallback_used());
        assert_eq!(frame.local_variable_base(), frame.cfa());
    }
    assert_eq!(frames[1].base_pointer(), Some(Address(0x8040)));
    assert_eq!(frames[2].base_pointer(), Some(Address(0x8080)));

    assert_eq!(frames[0].sender(&unwinder, &context), Some(frames[1]));
    assert_eq!(unwinder.sender(&frames[2], &context), None);

    let symbols: Vec<_> = frames.iter().map(|frame| unwinder.symbol(frame)).collect();
    assert_eq!(
        symbols,
        [
            Some(String::from("leaf")),
            Some(String::from("helper")),
            Some(String::from("main"))
        ]
    );
}

/// Every frame keeps the caller's rbp at CFA+0 and the return address at
/// CFA+8, with CFA = rbp + 16.
#[test]
fn three_frames_with_rbp_based_cfa() {
    #[rustfmt::skip]
    let cie_instructions = [
        0x0c, 0x06, 0x10,   // DW_CFA_def_cfa: RBP +16
        0x11, 0x10, 0x7f,   // DW_CFA_offset_extended_sf: RIP +8
        0x86, 0x00,         // DW_CFA_offset: RBP +0
    ];
    let target = SyntheticTarget::new()
        .library(program(&cie_instructions, &[]))
        .word(0x8010, 0x8040)
        .word(0x8018, 0x2050)
        .word(0x8050, 0x8080)
        .word(0x8058, 0x1050)
        .word(0x8090, 0)
        .word(0x8098, 0);
    let context = Registers::new()
        .with(Amd64::RSP, 0x7ff0)
        .with(Amd64::RBP, 0x8000)
        .with(Amd64::RA, 0x3050);
    let unwinder = Unwinder::new(&target, Amd64);

    let frames: Vec<Frame> = unwinder.unwind(&context).collect();

    assert_eq!(pcs(&frames), [0x3050, 0x2050, 0x1050]);
    assert_eq!(cfas(&frames), [0x8010, 0x8050, 0x8090]);
    let cfi = CfiInfo::new(CfaRegister::BasePointer, 16, Some(0), 8);
    assert!(frames.iter().all(|frame| frame.cfi() == Some(&cfi)));
    assert_eq!(unwinder.sender(&frames[2], &context), None);
}

#[test]
fn cfa_grows_monotonically() {
    let frames = walk(&target(), &context());
    assert!(frames.len() > 1);
    for pair in frames.windows(2) {
        assert!(pair[0].cfa() < pair[1].cfa(), "{pair:?}");
    }
}

#[test]
fn deterministic() {
    let target = target();
    let context = context();
    assert_eq!(walk(&target, &context), walk(&target, &context));
}

#[test]
fn leaf_before_prologue() {
    let target = target().word(0x8038, 0x2050);
    // Just called: rsp points at the return address, rbp is still helper's.
    let context = Registers::new()
        .with(Amd64::RSP, 0x8038)
        .with(Amd64::RBP, 0x8040)
        .with(Amd64::RA, LEAF.start);

    let frames = walk(&target, &context);

    assert_eq!(pcs(&frames), [0x3000, 0x2050, 0x1050]);
    assert_eq!(cfas(&frames), [0x8040, 0x8050, 0x8090]);
    assert_eq!(
        frames[0].cfi(),
        Some(&CfiInfo::new(CfaRegister::StackPointer, 8, None, -8))
    );
    assert_eq!(frames[1].base_pointer(), Some(Address(0x8040)));
}

#[test]
fn return_address_past_the_end_of_function() {
    // helper ends with the call to leaf
    let target = target().word(0x8018, HELPER.end);
    let context = context();
    let unwinder = Unwinder::new(&target, Amd64);

    let frames: Vec<Frame> = unwinder.unwind(&context).collect();

    assert_eq!(pcs(&frames), [0x3050, HELPER.end, 0x1050]);
    let helper = frames[1];
    assert!(helper.return_address_fallback_used());
    assert!(!helper.is_final());
    assert_eq!(helper.pc(), Address(HELPER.end));
    assert_eq!(helper.lookup_pc(), Address(HELPER.end - 1));
    assert_eq!(unwinder.symbol(&helper), Some("helper".into()));

    assert!(!frames[0].return_address_fallback_used());
    assert_eq!(frames[0].lookup_pc(), frames[0].pc());
}

fn truncated_library() -> SyntheticLibrary {
    let mut builder = EhFrameBuilder::new(0x20000);
    let cie = builder.cie();
    builder.fde(cie, 0x5000, 0x100, PROLOGUE_INSTRUCTIONS);
    let mut data = builder.finish();
    data.truncate(24 + 10);
    SyntheticLibrary::new("broken", 0x5000..0x6000).with_eh_frame(0x20000, data)
}

#[test]
fn truncated_cfi_ends_the_walk() {
    let target = target().library(truncated_library()).word(0x8018, 0x5050);
    let context = context();
    let unwinder = Unwinder::new(&target, Amd64);

    let top = unwinder.top_frame(&context).unwrap();
    let broken = unwinder.sender(&top, &context).unwrap();
    assert_eq!(broken.pc(), Address(0x5050));
    assert_eq!(broken.cfa(), Address(0x8028));
    assert!(broken.cfi().is_none());
    assert!(broken.is_final());
    assert_eq!(unwinder.sender(&broken, &context), None);

    assert_eq!(pcs(&walk(&target, &context)), [0x3050, 0x5050]);
}

#[test]
fn transition_to_managed_code() {
    let target = target().word(0x8018, MANAGED_PC);
    let context = context();
    let unwinder = Unwinder::new(&target, Amd64);

    let top = unwinder.top_frame(&context).unwrap();
    let reads = target.reads();
    let managed = unwinder.sender(&top, &context).unwrap();

    assert_eq!(target.reads() - reads, 1);
    assert_eq!(managed.pc(), Address(MANAGED_PC));
    assert_eq!(managed.cfa(), Address(0x8028));
    assert!(managed.cfi().is_none());
    assert!(managed.is_final());

    assert_eq!(unwinder.sender(&managed, &context), None);
    assert_eq!(target.reads() - reads, 1);
}

#[test]
fn final_frames_keep_cfa_growing() {
    let managed = target().word(0x8018, MANAGED_PC);
    let broken = target().library(truncated_library()).word(0x8018, 0x5050);

    for target in [managed, broken] {
        let frames = walk(&target, &context());
        assert_eq!(frames.len(), 2);
        assert!(frames[1].is_final());
        for pair in frames.windows(2) {
            assert!(pair[0].cfa() < pair[1].cfa(), "{pair:?}");
        }
    }
}

#[test]
fn final_frame_after_frame_pointer_frame() {
    // leaf has no CFI at all and returns into managed code
    let target = SyntheticTarget::new()
        .word(0x8010, 0x8040)
        .word(0x8018, MANAGED_PC);
    let context = context().with(Amd64::RA, 0x7000);

    let frames = walk(&target, &context);

    assert_eq!(pcs(&frames), [0x7000, MANAGED_PC]);
    assert_eq!(cfas(&frames), [0x8010, 0x8028]);
    assert!(frames[1].is_final());
}

#[test]
fn top_frame_in_managed_code() {
    let target = target();
    let context = context().with(Amd64::RA, MANAGED_PC);

    let frames = walk(&target, &context);

    assert_eq!(pcs(&frames), [MANAGED_PC, 0x2050, 0x1050]);
    assert_eq!(cfas(&frames), [0x8010, 0x8050, 0x8090]);
    assert!(frames[0].cfi().is_none());
    assert!(!frames[0].is_final());
}

#[test]
fn top_frame_with_broken_cfi() {
    let target = target().library(truncated_library());
    let context = context().with(Amd64::RA, 0x5050);

    let frames = walk(&target, &context);

    assert_eq!(frames.len(), 1);
    assert!(frames[0].is_final());
    assert_eq!(frames[0].cfa(), Address(0x8010));
}

/// The base pointer of a caller deeper than the top frame comes from the
/// frames in between, never from the registers the walk started with.
#[test]
fn lost_base_pointer_ends_the_walk() {
    // leaf just pushed rbp, into a slot that cannot be read back
    let target = SyntheticTarget::new()
        .library(program(&[0x0c, 7, 8, 0x90, 1], PROLOGUE_INSTRUCTIONS))
        .word(0x8008, HELPER.start)
        .word(0x8010, 0x1050)
        .word(0x9000, 0x9100)
        .word(0x9008, 0);
    let context = Registers::new()
        .with(Amd64::RSP, 0x8000)
        .with(Amd64::RBP, 0x9000)
        .with(Amd64::RA, LEAF.start + 1);
    let unwinder = Unwinder::new(&target, Amd64);

    let frames: Vec<Frame> = unwinder.unwind(&context).collect();

    assert_eq!(pcs(&frames), [LEAF.start + 1, HELPER.start]);
    assert_eq!(cfas(&frames), [0x8010, 0x8018]);
    assert_eq!(frames[0].base_pointer(), Some(Address(0x9000)));
    assert_eq!(frames[1].base_pointer(), None);
    // main's CFA is rbp based
    assert_eq!(unwinder.sender(&frames[1], &context), None);
}

#[test]
fn cyclic_frame_pointers() {
    // main's saved rbp points back down into leaf's frame
    let target = target().word(0x8040, 0x8010);
    assert_eq!(pcs(&walk(&target, &context())), [0x3050, 0x2050]);
}

#[test]
fn cfa_below_stack_pointer() {
    let context = context().with(Amd64::RSP, 0x8060);
    assert_eq!(pcs(&walk(&target(), &context)), [0x3050]);
}

#[test]
fn unaligned_frame_pointer() {
    let target = target().word(0x8010, 0x8041);
    let frames = walk(&target, &context());
    assert_eq!(pcs(&frames), [0x3050, 0x2050]);
    assert_eq!(frames[1].cfa(), Address(0x8051));
}

#[test]
fn unmapped_return_address() {
    let mut target = target();
    target.memory.remove(&0x8048);
    assert_eq!(pcs(&walk(&target, &context())), [0x3050, 0x2050]);
}

#[test]
fn missing_program_counter() {
    let target = target();
    let context = Registers::new().with(Amd64::RSP, 0x8000);
    assert!(walk(&target, &context).is_empty());
}

#[test]
fn frame_limit() {
    let target = target();
    let context = context();
    let unwinder = Unwinder::with_config(&target, Amd64, Config { max_frames: 2 });

    let mut frames = unwinder.unwind(&context);
    assert_eq!(frames.next().map(|frame| frame.pc()), Some(Address(0x3050)));
    assert_eq!(frames.next().map(|frame| frame.pc()), Some(Address(0x2050)));
    assert_eq!(frames.next(), None);
    assert_eq!(frames.next(), None);
}

#[test]
fn resume_walk() {
    let target = target();
    let context = context();
    let unwinder = Unwinder::new(&target, Amd64);
    let frames: Vec<Frame> = unwinder.unwind(&context).collect();

    let resumed: Vec<Frame> = unwinder.unwind_from(frames[1], &context).collect();
    assert_eq!(resumed, frames[1..]);
}

#[test]
fn default_config() {
    assert_eq!(Config::default().max_frames, Config::DEFAULT_MAX_FRAMES);
}
