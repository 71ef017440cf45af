//! Block translation: block boundaries, exits and page bookkeeping.
//! Nothing here runs the generated code.

use dynx86_backend::NativeEmitter;
use dynx86_core::{CpuMode, FlatMemory};
use dynx86_decode::DecodeError;
use dynx86_frontend::{translate_block, BlockLimits, BlockSource, HelperTable, TranslateError};

/// Helper addresses are only embedded, never called.
const HELPERS: HelperTable = HelperTable {
    read: [0x1000, 0x1010, 0x1020],
    write: [0x2000, 0x2010, 0x2020],
    interpret: 0x3000,
    fpu_escape: 0x4000,
    fpu_arith: [0x5000; 8],
};

fn translate(
    code: &[u8],
    cs_base: u32,
    eip: u32,
    limits: BlockLimits,
) -> Result<dynx86_frontend::TranslatedBlock, TranslateError> {
    let mut mem = FlatMemory::new(0x2_0000);
    mem.load(cs_base + eip, code);
    let mut e = NativeEmitter::new();
    let source = BlockSource {
        cs_base,
        eip,
        mode: CpuMode::REAL,
    };
    translate_block(&mut e, &mem, source, &HELPERS, limits)
}

#[test]
fn test_block_ends_at_jump() {
    // mov ax,1; add ax,ax; jmp $-7; nop
    let b = translate(&[0xB8, 0x01, 0x00, 0x01, 0xC0, 0xEB, 0xF9, 0x90], 0x1_0000, 0x100, BlockLimits::default())
        .unwrap();
    assert_eq!(b.start, 0x1_0100);
    assert_eq!(b.end, 0x1_0107);
    assert_eq!(b.insn_count, 3);
    assert_eq!(b.code.insn_count, 3);
    assert_eq!(b.pages, vec![0x10]);
    assert!(b.code.link_sites[0].is_some());
    assert!(b.code.link_sites[1].is_none());
}

#[test]
fn test_conditional_branch_has_two_links() {
    // cmp ax,bx; jz +0
    let b = translate(&[0x39, 0xD8, 0x74, 0x00], 0, 0x100, BlockLimits::default()).unwrap();
    assert_eq!(b.insn_count, 2);
    assert!(b.code.link_sites.iter().all(Option::is_some));
}

#[test]
fn test_indirect_jump_is_not_linkable() {
    // jmp ax
    let b = translate(&[0xFF, 0xE0], 0, 0x100, BlockLimits::default()).unwrap();
    assert!(b.code.link_sites.iter().all(Option::is_none));
}

#[test]
fn test_instruction_limit() {
    let limits = BlockLimits {
        max_insns: 4,
        ..BlockLimits::default()
    };
    let b = translate(&[0x90; 16], 0, 0x100, limits).unwrap();
    assert_eq!(b.insn_count, 4);
    assert_eq!(b.end, 0x104);
    // Falls through to the next block.
    assert!(b.code.link_sites[0].is_some());
}

#[test]
fn test_host_byte_limit() {
    let limits = BlockLimits {
        max_insns: 1000,
        max_bytes: 64,
    };
    // add ax,bx repeated
    let code: Vec<u8> = [0x01, 0xD8].repeat(100);
    let b = translate(&code, 0, 0x100, limits).unwrap();
    assert!(b.insn_count < 100);
    assert!(b.insn_count >= 1);
}

#[test]
fn test_stops_at_page_boundary() {
    let b = translate(&[0x90; 8], 0, 0xFFE, BlockLimits::default()).unwrap();
    assert_eq!(b.insn_count, 2);
    assert_eq!(b.end, 0x1000);
    assert_eq!(b.pages, vec![0]);
}

#[test]
fn test_page_crossing_instruction_records_both_pages() {
    // mov ax,1 straddling the boundary
    let b = translate(&[0xB8, 0x01, 0x00], 0, 0xFFE, BlockLimits::default()).unwrap();
    assert_eq!(b.insn_count, 1);
    assert_eq!(b.end, 0x1001);
    assert_eq!(b.pages, vec![0, 1]);
}

#[test]
fn test_undecodable_first_instruction_fails() {
    let err = translate(&[0x0F, 0x0B], 0, 0x100, BlockLimits::default()).unwrap_err();
    assert_eq!(err, TranslateError::Decode(DecodeError::Illegal { opcode: 0x10B }));
}

#[test]
fn test_undecodable_later_instruction_ends_block() {
    // nop; ud
    let b = translate(&[0x90, 0x0F, 0x0B], 0, 0x100, BlockLimits::default()).unwrap();
    assert_eq!(b.insn_count, 1);
    assert_eq!(b.end, 0x101);
}

#[test]
fn test_callout_instructions_translate() {
    // mul bx; in al,dx; hlt; nop
    let b = translate(&[0xF7, 0xE3, 0xEC, 0xF4, 0x90], 0, 0x100, BlockLimits::default()).unwrap();
    assert_eq!(b.insn_count, 3);
    assert_eq!(b.end, 0x104);
}

#[test]
fn test_hlt_ends_block() {
    // cld; hlt; followed by zero bytes
    let b = translate(&[0xFC, 0xF4], 0, 0x100, BlockLimits::default()).unwrap();
    assert_eq!(b.insn_count, 2);
    assert_eq!(b.end, 0x102);
}
