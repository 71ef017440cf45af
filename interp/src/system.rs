//! Segmentation, privilege checks, interrupt delivery and the
//! system-level instructions.
//!
//! Protected mode is modelled to the extent DOS extenders use it:
//! GDT-based segments, same-privilege far transfers, 16/32-bit
//! interrupt and trap gates, and returns to an outer ring through
//! RETF/IRET. Task switches, call gates, the LDT and paging are not
//! modelled; reaching one raises #GP.

use dynx86_core::cpu::EDX;
use dynx86_core::{CpuState, Eflags, Exception, GuestMemory, SegReg, Width};
use tracing::{debug, trace, warn};

use crate::ctx::{peek_stack, push, release_stack, Exec, Fault};

// -- Descriptors ---------------------------------------------------

/// A raw 8-byte GDT/IDT entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub u64);

impl Descriptor {
    /// Segment descriptor from its parts. `access` is byte 5
    /// (P, DPL, S, type); `flags` is the high nibble of byte 6 (G, D/B).
    pub const fn segment(base: u32, limit: u32, access: u8, flags: u8) -> Self {
        let raw = (limit as u64 & 0xFFFF)
            | (base as u64 & 0xFF_FFFF) << 16
            | (access as u64) << 40
            | ((limit as u64 >> 16) & 0xF) << 48
            | ((flags as u64) & 0xF) << 52
            | ((base as u64 >> 24) & 0xFF) << 56;
        Self(raw)
    }

    /// Interrupt or trap gate to `selector:offset`.
    pub const fn gate(selector: u16, offset: u32, access: u8) -> Self {
        let raw = (offset as u64 & 0xFFFF)
            | (selector as u64) << 16
            | (access as u64) << 40
            | ((offset as u64 >> 16) & 0xFFFF) << 48;
        Self(raw)
    }

    pub const fn base(self) -> u32 {
        ((self.0 >> 16) & 0xFF_FFFF) as u32 | (((self.0 >> 56) & 0xFF) as u32) << 24
    }

    /// Limit in bytes, scaled by the granularity bit.
    pub const fn limit(self) -> u32 {
        let raw = (self.0 & 0xFFFF) as u32 | (((self.0 >> 48) & 0xF) as u32) << 16;
        if (self.0 >> 55) & 1 != 0 {
            raw << 12 | 0xFFF
        } else {
            raw
        }
    }

    /// D/B bit.
    pub const fn big(self) -> bool {
        (self.0 >> 54) & 1 != 0
    }

    pub const fn present(self) -> bool {
        (self.0 >> 47) & 1 != 0
    }

    pub const fn dpl(self) -> u8 {
        ((self.0 >> 45) & 3) as u8
    }

    /// S bit: code or data rather than a system descriptor.
    pub const fn is_segment(self) -> bool {
        (self.0 >> 44) & 1 != 0
    }

    /// Four-bit type field.
    pub const fn kind(self) -> u8 {
        ((self.0 >> 40) & 0xF) as u8
    }

    pub const fn is_code(self) -> bool {
        self.is_segment() && self.kind() & 8 != 0
    }

    pub const fn conforming(self) -> bool {
        self.is_code() && self.kind() & 4 != 0
    }

    pub const fn readable(self) -> bool {
        self.is_segment() && (self.kind() & 8 == 0 || self.kind() & 2 != 0)
    }

    pub const fn writable(self) -> bool {
        self.is_segment() && self.kind() & 8 == 0 && self.kind() & 2 != 0
    }

    pub const fn gate_selector(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub const fn gate_offset(self) -> u32 {
        (self.0 & 0xFFFF) as u32 | ((self.0 >> 48) as u32) << 16
    }
}

#[inline]
fn gp(sel: u16) -> Exception {
    Exception::GeneralProtection(sel & 0xFFFC)
}

/// Fetch the GDT entry for `sel`. LDT selectors are not supported.
pub fn read_descriptor<M: GuestMemory + ?Sized>(
    cpu: &CpuState,
    mem: &mut M,
    sel: u16,
) -> Fault<Descriptor> {
    let index = (sel & 0xFFF8) as u32;
    if sel & 4 != 0 || index + 7 > cpu.gdtr.limit {
        return Err(gp(sel));
    }
    let addr = cpu.gdtr.base.wrapping_add(index);
    let lo = mem.read_u32(addr) as u64;
    let hi = mem.read_u32(addr.wrapping_add(4)) as u64;
    Ok(Descriptor(lo | hi << 32))
}

/// Load the hidden part of a segment register.
fn set_cache(cpu: &mut CpuState, seg: SegReg, sel: u16, d: Descriptor) {
    let i = seg as usize;
    cpu.selectors[i] = sel;
    cpu.seg_base[i] = d.base();
    cpu.seg_limit[i] = d.limit();
    cpu.seg_big[i] = d.big() as u8;
}

/// Validate `sel` as a stack segment for privilege level `cpl`.
fn stack_descriptor<M: GuestMemory + ?Sized>(
    cpu: &CpuState,
    mem: &mut M,
    sel: u16,
    cpl: u8,
) -> Fault<Descriptor> {
    if sel & !3 == 0 {
        return Err(Exception::GeneralProtection(0));
    }
    let d = read_descriptor(cpu, mem, sel)?;
    if (sel & 3) as u8 != cpl || !d.writable() || d.dpl() != cpl {
        return Err(gp(sel));
    }
    if !d.present() {
        return Err(Exception::StackFault(sel & 0xFFFC));
    }
    Ok(d)
}

/// Load a data or stack segment register (not CS).
pub fn load_segment<M: GuestMemory + ?Sized>(
    cpu: &mut CpuState,
    mem: &mut M,
    seg: SegReg,
    sel: u16,
) -> Fault {
    if !cpu.is_protected() || cpu.is_v86() {
        cpu.load_seg_real(seg, sel);
        return Ok(());
    }
    let cpl = cpu.cpl();
    if seg == SegReg::Ss {
        let d = stack_descriptor(cpu, mem, sel, cpl)?;
        set_cache(cpu, seg, sel, d);
        return Ok(());
    }
    if sel & !3 == 0 {
        // A null selector may be loaded; it is only faulted on use,
        // which is not modelled.
        set_cache(cpu, seg, sel, Descriptor(0));
        return Ok(());
    }
    let d = read_descriptor(cpu, mem, sel)?;
    let rpl = (sel & 3) as u8;
    if !d.readable() || (!d.conforming() && d.dpl() < cpl.max(rpl)) {
        return Err(gp(sel));
    }
    if !d.present() {
        return Err(Exception::SegmentNotPresent(sel & 0xFFFC));
    }
    set_cache(cpu, seg, sel, d);
    Ok(())
}

/// Validate a far JMP/CALL target code segment at the current CPL.
fn code_target<M: GuestMemory + ?Sized>(cpu: &CpuState, mem: &mut M, sel: u16) -> Fault<Descriptor> {
    if sel & !3 == 0 {
        return Err(Exception::GeneralProtection(0));
    }
    let d = read_descriptor(cpu, mem, sel)?;
    let cpl = cpu.cpl();
    // Call gates and task switches are not modelled.
    if !d.is_code() {
        return Err(gp(sel));
    }
    let ok = if d.conforming() {
        d.dpl() <= cpl
    } else {
        (sel & 3) as u8 <= cpl && d.dpl() == cpl
    };
    if !ok {
        return Err(gp(sel));
    }
    if !d.present() {
        return Err(Exception::SegmentNotPresent(sel & 0xFFFC));
    }
    Ok(d)
}

/// Validate the code segment a RETF/IRET returns to.
fn return_target<M: GuestMemory + ?Sized>(cpu: &CpuState, mem: &mut M, sel: u16) -> Fault<Descriptor> {
    let rpl = (sel & 3) as u8;
    if sel & !3 == 0 {
        return Err(Exception::GeneralProtection(0));
    }
    if rpl < cpu.cpl() {
        return Err(gp(sel));
    }
    let d = read_descriptor(cpu, mem, sel)?;
    let ok = d.is_code() && if d.conforming() { d.dpl() <= rpl } else { d.dpl() == rpl };
    if !ok {
        return Err(gp(sel));
    }
    if !d.present() {
        return Err(Exception::SegmentNotPresent(sel & 0xFFFC));
    }
    Ok(d)
}

// -- Flags and privilege --------------------------------------------

/// #GP(0) unless the current privilege may touch IF and the I/O ports.
pub fn check_iopl(cpu: &CpuState) -> Fault {
    if cpu.is_protected() && cpu.cpl() > Eflags::iopl(cpu.eflags) {
        return Err(Exception::GeneralProtection(0));
    }
    Ok(())
}

/// POPF/IRET flag image update with the privilege rules applied.
pub fn write_flags(cpu: &mut CpuState, val: u32, op32: bool) {
    let mut mask = Eflags::WRITABLE;
    if cpu.is_protected() {
        let cpl = cpu.cpl();
        if cpl > 0 {
            mask &= !Eflags::IOPL.bits();
        }
        if cpl > Eflags::iopl(cpu.eflags) {
            mask &= !Eflags::IF.bits();
        }
    }
    if !op32 {
        mask &= 0xFFFF;
    }
    cpu.eflags = (cpu.eflags & !mask) | (val & mask) | Eflags::FIXED1.bits();
}

// -- Far transfers ---------------------------------------------------

pub(crate) fn far_jump<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>, sel: u16, off: u32) -> Fault {
    if !x.cpu.is_protected() || x.cpu.is_v86() {
        x.cpu.load_seg_real(SegReg::Cs, sel);
    } else {
        let d = code_target(x.cpu, x.mem, sel)?;
        let cpl = x.cpu.cpl() as u16;
        set_cache(x.cpu, SegReg::Cs, (sel & !3) | cpl, d);
    }
    x.jump_near(off);
    Ok(())
}

pub(crate) fn far_call<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>, sel: u16, off: u32) -> Fault {
    let w = x.insn.full_width();
    let cs = x.cpu.selector(SegReg::Cs) as u32;
    if !x.cpu.is_protected() || x.cpu.is_v86() {
        x.push(w, cs);
        x.push(w, x.next);
        x.cpu.load_seg_real(SegReg::Cs, sel);
    } else {
        let d = code_target(x.cpu, x.mem, sel)?;
        x.push(w, cs);
        x.push(w, x.next);
        let cpl = x.cpu.cpl() as u16;
        set_cache(x.cpu, SegReg::Cs, (sel & !3) | cpl, d);
    }
    x.jump_near(off);
    Ok(())
}

/// RETF, releasing `release` bytes of parameters.
pub(crate) fn far_return<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>, release: u32) -> Fault {
    let w = x.insn.full_width();
    let b = w.bytes();
    if !x.cpu.is_protected() || x.cpu.is_v86() {
        let off = x.pop(w);
        let sel = x.pop(w) as u16;
        release_stack(x.cpu, release);
        x.cpu.load_seg_real(SegReg::Cs, sel);
        x.jump_near(off);
        return Ok(());
    }

    let off = peek_stack(x.cpu, x.mem, w, 0);
    let sel = peek_stack(x.cpu, x.mem, w, b) as u16;
    let d = return_target(x.cpu, x.mem, sel)?;
    let rpl = (sel & 3) as u8;
    if rpl == x.cpu.cpl() {
        release_stack(x.cpu, 2 * b + release);
        set_cache(x.cpu, SegReg::Cs, sel, d);
    } else {
        let new_sp = peek_stack(x.cpu, x.mem, w, 2 * b + release);
        let ss = peek_stack(x.cpu, x.mem, w, 3 * b + release) as u16;
        let ss_desc = stack_descriptor(x.cpu, x.mem, ss, rpl)?;
        set_cache(x.cpu, SegReg::Cs, sel, d);
        set_cache(x.cpu, SegReg::Ss, ss, ss_desc);
        x.cpu.set_sp(new_sp.wrapping_add(release));
        debug!(cpl = rpl, "far return to outer privilege level");
    }
    x.jump_near(off);
    Ok(())
}

pub(crate) fn iret<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let w = x.insn.full_width();
    let b = w.bytes();
    let op32 = x.insn.op32;
    if !x.cpu.is_protected() || x.cpu.is_v86() {
        let off = x.pop(w);
        let sel = x.pop(w) as u16;
        let flags = x.pop(w);
        x.cpu.load_seg_real(SegReg::Cs, sel);
        write_flags(x.cpu, flags, op32);
        x.jump_near(off);
        return Ok(());
    }
    if x.cpu.flag(Eflags::NT) {
        // Task return.
        return Err(Exception::GeneralProtection(0));
    }

    let off = peek_stack(x.cpu, x.mem, w, 0);
    let sel = peek_stack(x.cpu, x.mem, w, b) as u16;
    let flags = peek_stack(x.cpu, x.mem, w, 2 * b);
    let d = return_target(x.cpu, x.mem, sel)?;
    let rpl = (sel & 3) as u8;
    if rpl == x.cpu.cpl() {
        release_stack(x.cpu, 3 * b);
        write_flags(x.cpu, flags, op32);
        set_cache(x.cpu, SegReg::Cs, sel, d);
    } else {
        let new_sp = peek_stack(x.cpu, x.mem, w, 3 * b);
        let ss = peek_stack(x.cpu, x.mem, w, 4 * b) as u16;
        let ss_desc = stack_descriptor(x.cpu, x.mem, ss, rpl)?;
        write_flags(x.cpu, flags, op32);
        set_cache(x.cpu, SegReg::Cs, sel, d);
        set_cache(x.cpu, SegReg::Ss, ss, ss_desc);
        x.cpu.set_sp(new_sp);
        debug!(cpl = rpl, "iret to outer privilege level");
    }
    x.jump_near(off);
    Ok(())
}

// -- Interrupt delivery ----------------------------------------------

/// Deliver interrupt `vector` with the current EIP as return
/// address. `soft` marks INT n/INT3/INTO, whose gate DPL is checked
/// against CPL. `error` is pushed by protected-mode gates only.
pub fn interrupt<M: GuestMemory + ?Sized>(
    cpu: &mut CpuState,
    mem: &mut M,
    vector: u8,
    error: Option<u16>,
    soft: bool,
) -> Fault {
    cpu.halted = false;
    if !cpu.is_protected() {
        return interrupt_real(cpu, mem, vector);
    }
    if cpu.is_v86() {
        // Leaving v86 requires a privilege switch.
        return Err(Exception::GeneralProtection(0));
    }

    let idt_err = Exception::GeneralProtection(vector as u16 * 8 + 2);
    let entry = vector as u32 * 8;
    if entry + 7 > cpu.idtr.limit {
        return Err(idt_err);
    }
    let addr = cpu.idtr.base.wrapping_add(entry);
    let lo = mem.read_u32(addr) as u64;
    let hi = mem.read_u32(addr.wrapping_add(4)) as u64;
    let gate = Descriptor(lo | hi << 32);

    // 16/32-bit interrupt and trap gates; task gates are not modelled.
    if gate.is_segment() || !matches!(gate.kind(), 0x6 | 0x7 | 0xE | 0xF) {
        return Err(idt_err);
    }
    let cpl = cpu.cpl();
    if soft && gate.dpl() < cpl {
        return Err(idt_err);
    }
    if !gate.present() {
        return Err(Exception::SegmentNotPresent(vector as u16 * 8 + 2));
    }

    let sel = gate.gate_selector();
    if sel & !3 == 0 {
        return Err(Exception::GeneralProtection(0));
    }
    let cs = read_descriptor(cpu, mem, sel)?;
    if !cs.is_code() || cs.dpl() > cpl {
        return Err(gp(sel));
    }
    if !cs.present() {
        return Err(Exception::SegmentNotPresent(sel & 0xFFFC));
    }
    if !cs.conforming() && cs.dpl() < cpl {
        // Inner-ring stack switch through the TSS.
        return Err(gp(sel));
    }

    let gate32 = gate.kind() & 8 != 0;
    let w = Width::full(gate32);
    let image = cpu.eflags & !Eflags::RF.bits();
    let old_cs = cpu.selector(SegReg::Cs) as u32;
    let old_eip = cpu.eip;
    push(cpu, mem, w, image);
    push(cpu, mem, w, old_cs);
    push(cpu, mem, w, old_eip);
    if let Some(code) = error {
        push(cpu, mem, w, code as u32);
    }

    let mut clear = Eflags::TF | Eflags::NT | Eflags::RF | Eflags::VM;
    if gate.kind() & 1 == 0 {
        clear |= Eflags::IF;
    }
    cpu.eflags &= !clear.bits();
    set_cache(cpu, SegReg::Cs, (sel & !3) | cpl as u16, cs);
    cpu.eip = if gate32 {
        gate.gate_offset()
    } else {
        gate.gate_offset() & 0xFFFF
    };
    trace!(vector, cs = sel, eip = cpu.eip, "protected-mode interrupt");
    Ok(())
}

fn interrupt_real<M: GuestMemory + ?Sized>(cpu: &mut CpuState, mem: &mut M, vector: u8) -> Fault {
    let entry = vector as u32 * 4;
    if entry + 3 > cpu.idtr.limit {
        return Err(Exception::GeneralProtection(vector as u16 * 8 + 2));
    }
    let addr = cpu.idtr.base.wrapping_add(entry);
    let off = mem.read_u16(addr);
    let seg = mem.read_u16(addr.wrapping_add(2));

    let flags = cpu.eflags;
    let cs = cpu.selector(SegReg::Cs) as u32;
    let ip = cpu.eip;
    push(cpu, mem, Width::B16, flags);
    push(cpu, mem, Width::B16, cs);
    push(cpu, mem, Width::B16, ip);
    cpu.eflags &= !(Eflags::IF | Eflags::TF).bits();
    cpu.load_seg_real(SegReg::Cs, seg);
    cpu.eip = off as u32;
    trace!(vector, cs = seg, ip = off, "real-mode interrupt");
    Ok(())
}

/// The CPU stopped after a fault during double-fault delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shutdown;

/// Deliver a processor exception, escalating a contributory fault
/// raised during delivery to #DF, and a fault during #DF to shutdown.
pub fn deliver_exception<M: GuestMemory + ?Sized>(
    cpu: &mut CpuState,
    mem: &mut M,
    exc: Exception,
) -> Result<(), Shutdown> {
    let mut current = exc;
    loop {
        let code = if cpu.is_protected() {
            current.error_code()
        } else {
            None
        };
        match interrupt(cpu, mem, current.vector(), code, false) {
            Ok(()) => return Ok(()),
            Err(next) => {
                if current == Exception::DoubleFault {
                    warn!(%exc, "fault while delivering #DF, shutting down");
                    return Err(Shutdown);
                }
                current = if current.is_contributory() && next.is_contributory() {
                    Exception::DoubleFault
                } else {
                    next
                };
                debug!(first = %exc, next = %current, "fault during exception delivery");
            }
        }
    }
}

// -- Instructions ----------------------------------------------------

/// Segment-register moves, POP Sreg and the far-pointer loads.
pub(crate) fn mov_seg<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let insn = x.insn;
    let w = insn.full_width();
    match insn.opcode {
        0x8C => {
            let seg = SegReg::from_index(insn.reg_field()).ok_or(Exception::InvalidOpcode)?;
            let sel = x.cpu.selector(seg) as u32;
            let width = if insn.rm_reg().is_some() { w } else { Width::B16 };
            x.write_rm(width, sel);
        }
        0x8E => {
            let seg = SegReg::from_index(insn.reg_field()).ok_or(Exception::InvalidOpcode)?;
            let sel = x.read_rm(Width::B16) as u16;
            load_segment(x.cpu, x.mem, seg, sel)?;
            if seg == SegReg::Ss {
                x.cpu.irq_shadow = true;
            }
        }
        0x07 | 0x17 | 0x1F | 0x1A1 | 0x1A9 => {
            let seg = match insn.opcode {
                0x07 => SegReg::Es,
                0x17 => SegReg::Ss,
                0x1F => SegReg::Ds,
                0x1A1 => SegReg::Fs,
                _ => SegReg::Gs,
            };
            let sel = peek_stack(x.cpu, x.mem, w, 0) as u16;
            load_segment(x.cpu, x.mem, seg, sel)?;
            release_stack(x.cpu, w.bytes());
            if seg == SegReg::Ss {
                x.cpu.irq_shadow = true;
            }
        }
        _ => {
            let seg = match insn.opcode {
                0xC4 => SegReg::Es,
                0xC5 => SegReg::Ds,
                0x1B2 => SegReg::Ss,
                0x1B4 => SegReg::Fs,
                _ => SegReg::Gs,
            };
            let (lo, hi) = (x.ea(), x.ea_plus(w.bytes()));
            let off = x.mem.read(lo, w);
            let sel = x.mem.read_u16(hi);
            load_segment(x.cpu, x.mem, seg, sel)?;
            x.set_reg(w, off);
        }
    }
    Ok(())
}

/// BOUND, INT3, INT n, INTO, IRET.
pub(crate) fn interrupt_insn<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let vector = match x.insn.opcode {
        0x62 => return bound(x),
        0xCF => return iret(x),
        0xCC => 3,
        0xCD => x.insn.imm as u8,
        _ => {
            if !x.cpu.flag(Eflags::OF) {
                return Ok(());
            }
            4
        }
    };
    if x.cpu.is_v86() && x.insn.opcode == 0xCD && Eflags::iopl(x.cpu.eflags) < 3 {
        return Err(Exception::GeneralProtection(0));
    }
    interrupt(x.cpu, x.mem, vector, None, true)?;
    x.delivered = true;
    Ok(())
}

fn bound<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let w = x.insn.full_width();
    let (lo_addr, hi_addr) = (x.ea(), x.ea_plus(w.bytes()));
    let lo = w.sign_extend(x.mem.read(lo_addr, w)) as i32;
    let hi = w.sign_extend(x.mem.read(hi_addr, w)) as i32;
    let idx = w.sign_extend(x.reg(w)) as i32;
    if idx < lo || idx > hi {
        return Err(Exception::BoundRange);
    }
    Ok(())
}

/// HLT, CLTS, MOV to/from CRn and the 0F 01 group.
pub(crate) fn system_insn<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let insn = x.insn;
    match insn.opcode {
        0xF4 => x.cpu.halted = true,
        0x106 => x.cpu.cr0 &= !(1 << 3),
        0x120 => {
            let v = match insn.reg_field() {
                0 => x.cpu.cr0,
                2 => x.cpu.cr2,
                _ => x.cpu.cr3,
            };
            x.write_rm(Width::B32, v);
        }
        0x122 => {
            let v = x.read_rm(Width::B32);
            match insn.reg_field() {
                0 => set_cr0(x.cpu, v),
                2 => x.cpu.cr2 = v,
                _ => x.cpu.cr3 = v,
            }
        }
        _ => group7(x)?,
    }
    Ok(())
}

fn set_cr0(cpu: &mut CpuState, v: u32) {
    if (cpu.cr0 ^ v) & 1 != 0 {
        debug!(protected = v & 1 != 0, "CR0.PE changed");
    }
    cpu.cr0 = v;
}

/// SGDT, SIDT, LGDT, LIDT, SMSW, LMSW.
fn group7<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    let op32 = x.insn.op32;
    match x.insn.reg_field() {
        r @ (0 | 1) => {
            let table = if r == 0 { x.cpu.gdtr } else { x.cpu.idtr };
            let base = if op32 { table.base } else { table.base & 0xFF_FFFF };
            let (lo, hi) = (x.ea(), x.ea_plus(2));
            x.mem.write_u16(lo, table.limit as u16);
            x.mem.write_u32(hi, base);
        }
        r @ (2 | 3) => {
            let (lo, hi) = (x.ea(), x.ea_plus(2));
            let limit = x.mem.read_u16(lo) as u32;
            let mut base = x.mem.read_u32(hi);
            if !op32 {
                base &= 0xFF_FFFF;
            }
            let table = if r == 2 { &mut x.cpu.gdtr } else { &mut x.cpu.idtr };
            table.base = base;
            table.limit = limit;
        }
        4 => {
            let w = if x.insn.rm_reg().is_some() {
                x.insn.full_width()
            } else {
                Width::B16
            };
            let v = x.cpu.cr0;
            x.write_rm(w, v);
        }
        _ => {
            // LMSW cannot clear PE.
            let v = x.read_rm(Width::B16);
            let cr0 = x.cpu.cr0;
            set_cr0(x.cpu, (cr0 & !0xF) | (v & 0xF) | (cr0 & 1));
        }
    }
    Ok(())
}

/// IN and OUT with immediate or DX port.
pub(crate) fn io<M: GuestMemory + ?Sized>(x: &mut Exec<'_, M>) -> Fault {
    check_iopl(x.cpu)?;
    let insn = x.insn;
    let w = insn.width_by_bit0();
    let port = if insn.op_byte() < 0xEC {
        insn.imm as u16
    } else {
        x.cpu.reg16(EDX)
    };
    if insn.op_byte() & 2 == 0 {
        let v = x.mem.io_read(port, w);
        x.cpu.set_reg(w, 0, v);
    } else {
        let v = x.cpu.reg(w, 0);
        x.mem.io_write(port, w, v);
    }
    Ok(())
}
