//! Run hand-emitted blocks through the trampoline against a bare
//! `CpuState`.

use dynx86_backend::{
    jump_disp, ExecArena, HelperArg, HostEmitter, Protection, UnaryOp, X86_64Emitter,
};
use dynx86_core::block::decode_exit;
use dynx86_core::cpu::{reg8_offset, reg_offset, EAX, EBX, ECX, EFLAGS_OFFSET};
use dynx86_core::{AluOp, Cond, CpuState, Eflags, ExitKind, ShiftOp, Width};

/// Place the trampoline and one block in a fresh arena, enter the
/// block with `cpu` as environment and return the raw exit value.
fn run_block(cpu: &mut CpuState, build: impl FnOnce(&mut X86_64Emitter)) -> u32 {
    let mut e = X86_64Emitter::new();
    let tramp = e.emit_trampoline();
    e.begin_block();
    build(&mut e);
    let code = e.finish(1).unwrap();

    let mut arena = ExecArena::new(64 * 1024, Protection::WriteXorExecute).unwrap();
    arena.write(0, &tramp.code).unwrap();
    let offset = (tramp.code.len() + 15) & !15;
    let mut bytes = code.bytes.clone();
    for &rel in &code.epilogue_relocs {
        let disp = jump_disp(offset + rel - 1, tramp.epilogue);
        bytes[rel..rel + 4].copy_from_slice(&disp.to_le_bytes());
    }
    arena.write(offset, &bytes).unwrap();

    let entry: unsafe extern "C" fn(*mut u8, *const u8) -> u32 =
        unsafe { std::mem::transmute(arena.ptr_at(tramp.entry)) };
    unsafe { entry(cpu as *mut CpuState as *mut u8, arena.ptr_at(offset)) }
}

#[test]
fn test_add_registers() {
    let mut cpu = CpuState::new();
    cpu.regs[ECX] = 2;
    let raw = run_block(&mut cpu, |e| {
        let a = e.claim().unwrap();
        let b = e.claim().unwrap();
        e.mov_imm(a, 40);
        e.load_slot(b, Width::B32, reg_offset(ECX));
        e.alu(AluOp::Add, Width::B32, a, b, Eflags::ARITH.bits());
        e.store_slot(a, Width::B32, reg_offset(EAX));
        e.release(b);
        e.release(a);
        e.exit(ExitKind::Normal);
    });
    assert_eq!(decode_exit(raw).1, ExitKind::Normal);
    assert_eq!(cpu.regs[EAX], 42);
    assert!(!cpu.flag(Eflags::ZF));
    assert!(!cpu.flag(Eflags::CF));
}

#[test]
fn test_flags_merge_only_masked_bits() {
    let mut cpu = CpuState::new();
    cpu.regs[EAX] = 5;
    cpu.set_flag(Eflags::CF, true);
    cpu.set_flag(Eflags::DF, true);
    run_block(&mut cpu, |e| {
        let a = e.claim().unwrap();
        e.load_slot(a, Width::B16, reg_offset(EAX));
        // CF is not in the mask and keeps its old value.
        e.alu_imm(AluOp::Sub, Width::B16, a, 5, Eflags::SZP | Eflags::OF.bits());
        e.store_slot(a, Width::B16, reg_offset(EAX));
        e.release(a);
        e.exit(ExitKind::Normal);
    });
    assert_eq!(cpu.regs[EAX], 0);
    assert!(cpu.flag(Eflags::ZF));
    assert!(cpu.flag(Eflags::CF));
    assert!(cpu.flag(Eflags::DF));
}

#[test]
fn test_high_byte_register_slot() {
    let mut cpu = CpuState::new();
    cpu.regs[EBX] = 0x1234;
    run_block(&mut cpu, |e| {
        let a = e.claim().unwrap();
        // BH
        e.load_slot(a, Width::B8, reg8_offset(7));
        e.unary(UnaryOp::Inc, Width::B8, a, Eflags::INCDEC_DEFINED);
        e.store_slot(a, Width::B8, reg8_offset(7));
        e.release(a);
        e.exit(ExitKind::Normal);
    });
    assert_eq!(cpu.regs[EBX], 0x1334);
}

#[test]
fn test_shift_and_extend() {
    let mut cpu = CpuState::new();
    cpu.regs[EAX] = 0x80;
    run_block(&mut cpu, |e| {
        let a = e.claim().unwrap();
        let b = e.claim().unwrap();
        e.load_slot(a, Width::B8, reg_offset(EAX));
        e.extend(b, a, Width::B8, true);
        e.store_slot(b, Width::B32, reg_offset(ECX));
        e.shift_imm(ShiftOp::Shl, Width::B32, a, 4, Eflags::CF.bits());
        e.store_slot(a, Width::B32, reg_offset(EAX));
        e.release(b);
        e.release(a);
        e.exit(ExitKind::Normal);
    });
    assert_eq!(cpu.regs[ECX], 0xFFFF_FF80);
    assert_eq!(cpu.regs[EAX], 0x800);
    assert!(!cpu.flag(Eflags::CF));
}

#[test]
fn test_conditional_jump_reads_guest_flags() {
    for zf in [false, true] {
        let mut cpu = CpuState::new();
        cpu.set_flag(Eflags::ZF, zf);
        run_block(&mut cpu, |e| {
            let taken = e.new_label();
            e.jump_if(Cond::E, taken);
            e.store_slot_imm(Width::B32, reg_offset(EAX), 2);
            e.exit(ExitKind::Normal);
            e.bind(taken);
            e.store_slot_imm(Width::B32, reg_offset(EAX), 1);
            e.exit(ExitKind::Normal);
        });
        assert_eq!(cpu.regs[EAX], if zf { 1 } else { 2 });
    }
}

#[test]
fn test_set_cond() {
    let mut cpu = CpuState::new();
    cpu.set_flag(Eflags::CF, true);
    run_block(&mut cpu, |e| {
        let a = e.claim().unwrap();
        e.set_cond(Cond::B, a);
        e.store_slot(a, Width::B32, reg_offset(EAX));
        e.set_cond(Cond::A, a);
        e.store_slot(a, Width::B32, reg_offset(ECX));
        e.release(a);
        e.exit(ExitKind::Normal);
    });
    assert_eq!(cpu.regs[EAX], 1);
    assert_eq!(cpu.regs[ECX], 0);
}

extern "C" fn mul_helper(env: *mut CpuState, a: u32, b: u32) -> u32 {
    // SAFETY: entered through the trampoline with a live CpuState.
    let cpu = unsafe { &mut *env };
    cpu.regs[EBX] = 0x55;
    a * b
}

#[test]
fn test_helper_call_preserves_scratch() {
    let mut cpu = CpuState::new();
    run_block(&mut cpu, |e| {
        let keep = e.claim().unwrap();
        let ret = e.claim().unwrap();
        e.mov_imm(keep, 0x77);
        e.call_helper(mul_helper as usize, HelperArg::Imm(6), HelperArg::Imm(7), Some(ret));
        e.store_slot(ret, Width::B32, reg_offset(EAX));
        e.store_slot(keep, Width::B32, reg_offset(ECX));
        e.release(ret);
        e.release(keep);
        e.exit(ExitKind::Normal);
    });
    assert_eq!(cpu.regs[EAX], 42);
    assert_eq!(cpu.regs[ECX], 0x77);
    assert_eq!(cpu.regs[EBX], 0x55);
}

#[test]
fn test_cycle_check_at_entry() {
    let mut cpu = CpuState::new();
    cpu.cycles = 0;
    let build = |e: &mut X86_64Emitter| {
        e.check_cycles();
        e.store_slot_imm(Width::B32, reg_offset(EAX), 9);
        e.exit(ExitKind::Normal);
    };
    let raw = run_block(&mut cpu, build);
    assert_eq!(decode_exit(raw).1, ExitKind::Cycles);
    assert_eq!(cpu.regs[EAX], 0);

    cpu.cycles = 5;
    let raw = run_block(&mut cpu, build);
    assert_eq!(decode_exit(raw).1, ExitKind::Normal);
    assert_eq!(cpu.regs[EAX], 9);
    // `finish(1)` charged one instruction.
    assert_eq!(cpu.cycles, 4);
}

#[test]
fn test_link_site_layout() {
    let mut e = X86_64Emitter::new();
    e.begin_block();
    e.store_slot_imm(Width::B32, EFLAGS_OFFSET, 2);
    e.exit_link(0).unwrap();
    e.exit_link(1).unwrap();
    assert_eq!(e.exit_link(1), Err(dynx86_backend::EmitError::TooManyLinks));
    let code = e.finish(1).unwrap();
    for site in code.link_sites.iter().flatten() {
        assert_eq!(code.bytes[site.jmp_offset], 0xE9);
        assert_eq!((site.jmp_offset + 1) % 4, 0);
        assert_eq!(site.reset_offset, site.jmp_offset + 5);
    }
    assert_eq!(code.exit_sites.len(), 2);
}

#[test]
fn test_unlinked_exit_returns_link_kind() {
    let mut cpu = CpuState::new();
    let raw = run_block(&mut cpu, |e| {
        e.exit_link(1).unwrap();
    });
    assert_eq!(decode_exit(raw).1, ExitKind::Link1);
}
