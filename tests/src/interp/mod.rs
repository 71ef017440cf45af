//! Reference interpreter: multi-instruction programs.

use dynx86_core::cpu::{EAX, ECX, EDI, ESI, ESP};
use dynx86_core::{CpuState, Eflags, FlatMemory, GuestMemory, SegReg};
use dynx86_interp::{Interpreter, RunExit, StepOutcome};

/// Real-mode CPU at 1000:0000 with the stack at 0000:FFFE and DS
/// at 2000.
fn boot(code: &[u8]) -> Interpreter<FlatMemory> {
    let mut mem = FlatMemory::new(0x4_0000);
    mem.load(0x1_0000, code);
    let mut cpu = CpuState::new();
    cpu.load_seg_real(SegReg::Cs, 0x1000);
    cpu.load_seg_real(SegReg::Ds, 0x2000);
    cpu.load_seg_real(SegReg::Es, 0x3000);
    cpu.load_seg_real(SegReg::Ss, 0x0000);
    cpu.eip = 0;
    cpu.regs[ESP] = 0xFFFE;
    Interpreter::with_state(cpu, mem)
}

#[test]
fn test_rep_movsb() {
    // rep movsb; hlt
    let mut it = boot(&[0xF3, 0xA4, 0xF4]);
    it.mem.load(0x2_0000, b"abcd");
    it.cpu.regs[ECX] = 4;
    assert_eq!(it.run(100), RunExit::Halted);
    assert_eq!(&it.mem.as_slice()[0x3_0000..0x3_0004], b"abcd");
    assert_eq!(it.cpu.regs[ECX], 0);
    assert_eq!(it.cpu.regs[ESI], 4);
    assert_eq!(it.cpu.regs[EDI], 4);
}

#[test]
fn test_call_ret() {
    // call +2; hlt; nop; mov ax,7; ret
    let mut it = boot(&[0xE8, 0x02, 0x00, 0xF4, 0x90, 0xB8, 0x07, 0x00, 0xC3]);
    assert_eq!(it.run(100), RunExit::Halted);
    assert_eq!(it.cpu.reg16(EAX), 7);
    assert_eq!(it.cpu.eip, 4);
    assert_eq!(it.cpu.regs[ESP], 0xFFFE);
}

#[test]
fn test_int_iret() {
    // int 21h; hlt
    let mut it = boot(&[0xCD, 0x21, 0xF4]);
    it.mem.load(0x21 * 4, &[0x00, 0x00, 0x00, 0x04]);
    // 0400:0000: mov ax,99h; iret
    it.mem.load(0x4000, &[0xB8, 0x99, 0x00, 0xCF]);
    it.cpu.eflags |= Eflags::DF.bits();
    assert_eq!(it.run(100), RunExit::Halted);
    assert_eq!(it.cpu.reg16(EAX), 0x99);
    assert_eq!(it.cpu.selector(SegReg::Cs), 0x1000);
    assert_eq!(it.cpu.eip, 3);
    assert!(it.cpu.flag(Eflags::DF));
    assert_eq!(it.cpu.regs[ESP], 0xFFFE);
}

#[test]
fn test_port_io() {
    // mov al,5ah; out 80h,al; mov al,0; in al,80h; hlt
    let mut it = boot(&[0xB0, 0x5A, 0xE6, 0x80, 0xB0, 0x00, 0xE4, 0x80, 0xF4]);
    assert_eq!(it.run(100), RunExit::Halted);
    assert_eq!(it.mem.port(0x80), Some(0x5A));
    assert_eq!(it.cpu.reg8(0), 0x5A);
}

#[test]
fn test_fpu_add_and_store() {
    // fld1; fld1; faddp; fistp word [100h]; hlt
    let mut it = boot(&[0xD9, 0xE8, 0xD9, 0xE8, 0xDE, 0xC1, 0xDF, 0x1E, 0x00, 0x01, 0xF4]);
    assert_eq!(it.run(100), RunExit::Halted);
    assert_eq!(it.mem.read_u16(0x2_0100), 2);
    assert_eq!(it.cpu.fpu.top, 0);
}

#[test]
fn test_cycle_budget() {
    // jmp $
    let mut it = boot(&[0xEB, 0xFE]);
    assert_eq!(it.run(10), RunExit::CyclesExhausted);
    assert_eq!(it.cpu.eip, 0);
}

#[test]
fn test_undefined_opcode_delivers_ud() {
    let mut it = boot(&[0x0F, 0x0B]);
    it.mem.load(6 * 4, &[0x00, 0x05, 0x00, 0x00]);
    assert_eq!(
        it.step(),
        StepOutcome::Exception(dynx86_core::Exception::InvalidOpcode)
    );
    assert_eq!(it.cpu.eip, 0x500);
    assert_eq!(it.cpu.selector(SegReg::Cs), 0);
}

#[test]
fn test_enter_protected_mode() {
    let mut mem = FlatMemory::new(0x1_0000);
    // Null, flat 32-bit code, flat data.
    mem.load(
        0x800,
        &[
            0, 0, 0, 0, 0, 0, 0, 0, //
            0xFF, 0xFF, 0, 0, 0, 0x9A, 0xCF, 0, //
            0xFF, 0xFF, 0, 0, 0, 0x92, 0xCF, 0,
        ],
    );
    mem.load(0x900, &[0x17, 0x00, 0x00, 0x08, 0x00, 0x00]);
    mem.load(0x7C00, &pmode_entry());
    let mut cpu = CpuState::new();
    cpu.load_seg_real(SegReg::Cs, 0);
    cpu.load_seg_real(SegReg::Ds, 0);
    cpu.eip = 0x7C00;
    let mut it = Interpreter::with_state(cpu, mem);

    assert_eq!(it.run(100), RunExit::Halted);
    assert!(it.cpu.mode().protected);
    assert!(it.cpu.mode().code32);
    assert_eq!(it.cpu.selector(SegReg::Cs), 0x08);
    assert_eq!(it.cpu.regs[EAX], 0x1234_5678);
}

/// LGDT, set CR0.PE, far jump into a 32-bit segment, load EAX, HLT.
pub(crate) fn pmode_entry() -> Vec<u8> {
    vec![
        0x0F, 0x01, 0x16, 0x00, 0x09, // lgdt [0900h]
        0x0F, 0x20, 0xC0, // mov eax,cr0
        0x66, 0x83, 0xC8, 0x01, // or eax,1
        0x0F, 0x22, 0xC0, // mov cr0,eax
        0x66, 0xEA, 0x17, 0x7C, 0x00, 0x00, 0x08, 0x00, // jmp dword 08:7C17
        0xB8, 0x78, 0x56, 0x34, 0x12, // mov eax,12345678h
        0xF4, // hlt
    ]
}

#[test]
fn test_open_bus() {
    let mut mem = FlatMemory::new(16);
    assert_eq!(mem.read_u8(100), 0xFF);
    assert_eq!(mem.read_u16(15), 0xFF00);
    mem.write_u8(100, 1);
    assert_eq!(mem.peek_u8(100), 0xFF);
}
