//! Code buffer, labels, scratch registers and the executable arena.

#[cfg(target_arch = "x86_64")]
mod emitter;

use dynx86_backend::code_buffer::CodeBuffer;
use dynx86_backend::label::Labels;
use dynx86_backend::{jump_disp, ArenaError, EmitError, ExecArena, Protection, ScratchRegs};

#[test]
fn test_emit_and_read() {
    let mut buf = CodeBuffer::new();
    buf.emit_u8(0x90); // NOP
    buf.emit_u32(0xDEADBEEF);
    assert_eq!(buf.offset(), 5);
    assert_eq!(buf.as_slice()[0], 0x90);
    assert_eq!(buf.read_u32(1), 0xDEADBEEF);
}

#[test]
fn test_patch() {
    let mut buf = CodeBuffer::new();
    buf.emit_u32(0);
    buf.patch_u32(0, 0x12345678);
    assert_eq!(buf.read_u32(0), 0x12345678);
    buf.patch_u8(3, 0xAA);
    assert_eq!(buf.read_u32(0), 0xAA345678);
}

#[test]
fn test_take_empties_buffer() {
    let mut buf = CodeBuffer::new();
    buf.emit_bytes(&[1, 2, 3]);
    assert_eq!(buf.take(), vec![1, 2, 3]);
    assert_eq!(buf.offset(), 0);
}

#[test]
fn test_forward_label_patched_on_bind() {
    let mut buf = CodeBuffer::new();
    let mut labels = Labels::new();
    let l = labels.create();
    buf.emit_u8(0xE9);
    let field = buf.offset();
    buf.emit_u32(0);
    labels.add_use(&mut buf, l, field);
    assert_eq!(labels.check_resolved(), Err(EmitError::UnboundLabel(0)));

    buf.emit_bytes(&[0x90; 3]);
    let target = buf.offset();
    labels.bind(&mut buf, l, target);
    assert_eq!(labels.check_resolved(), Ok(()));
    // rel32 counts from the end of the field.
    assert_eq!(buf.read_u32(field), 3);
}

#[test]
fn test_backward_label_patched_on_use() {
    let mut buf = CodeBuffer::new();
    let mut labels = Labels::new();
    let l = labels.create();
    labels.bind(&mut buf, l, 0);
    buf.emit_u8(0xE9);
    let field = buf.offset();
    buf.emit_u32(0);
    labels.add_use(&mut buf, l, field);
    assert_eq!(buf.read_u32(field) as i32, -5);
}

#[test]
fn test_scratch_pool_exhaustion() {
    let mut regs = ScratchRegs::new(3);
    let a = regs.claim().unwrap();
    let b = regs.claim().unwrap();
    let c = regs.claim().unwrap();
    assert_ne!(a, b);
    assert_ne!(b, c);
    assert_eq!(regs.claim(), Err(EmitError::OutOfRegisters));
    regs.release(b);
    assert_eq!(regs.available(), 1);
    assert_eq!(regs.claim().unwrap(), b);
    regs.reset();
    assert_eq!(regs.available(), regs.capacity());
}

#[test]
fn test_jump_disp() {
    assert_eq!(jump_disp(0, 5), 0);
    assert_eq!(jump_disp(0x100, 0x200), 0xFB);
    assert_eq!(jump_disp(0x200, 0x100) as i32, -0x105);
}

#[test]
fn test_arena_rounds_to_pages() {
    let arena = ExecArena::new(100, Protection::WriteXorExecute).unwrap();
    assert!(arena.size() >= 100);
    assert_eq!(arena.size() % 4096, 0);
    assert!(!arena.is_poisoned());
}

#[test]
fn test_arena_write_and_patch() {
    for prot in [Protection::WriteXorExecute, Protection::ReadWriteExecute] {
        let mut arena = ExecArena::new(8192, prot).unwrap();
        arena.write(4094, &[1, 2, 3, 4]).unwrap();
        assert_eq!(arena.as_slice(4094, 4), &[1, 2, 3, 4]);
        arena.patch_u32(16, 0xCAFEBABE).unwrap();
        assert_eq!(arena.read_u32(16), 0xCAFEBABE);
        assert_eq!(arena.protection(), prot);
    }
}

#[test]
fn test_arena_rejects_out_of_bounds() {
    let mut arena = ExecArena::new(4096, Protection::WriteXorExecute).unwrap();
    let size = arena.size();
    let err = arena.write(size - 2, &[0; 4]).unwrap_err();
    assert!(matches!(err, ArenaError::OutOfBounds { len: 4, .. }));
    // A rejected write leaves the arena usable.
    assert!(!arena.is_poisoned());
    arena.write(0, &[0xC3]).unwrap();
}

#[test]
fn test_write_guard_scoped_writes() {
    let mut arena = ExecArena::new(4096, Protection::WriteXorExecute).unwrap();
    {
        let mut guard = arena.unlock(32, 8).unwrap();
        guard.write(32, &[0xAA; 4]);
        guard.write(36, &[0xBB; 4]);
        guard.close().unwrap();
    }
    assert_eq!(arena.as_slice(32, 8), &[0xAA, 0xAA, 0xAA, 0xAA, 0xBB, 0xBB, 0xBB, 0xBB]);
}
