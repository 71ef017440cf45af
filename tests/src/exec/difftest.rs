//! Translated code against the interpreter on random programs, in
//! real mode and in a flat 32-bit protected-mode segment.

use dynx86_core::cpu::{EBX, ECX, EDX, ESP};
use dynx86_core::fpu::TAG_EMPTY;
use dynx86_core::{CpuState, Eflags, FlatMemory, SegReg};
use dynx86_exec::{DynCore, DynrecConfig, RunExit};
use dynx86_interp::Interpreter;
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

const MEM_SIZE: usize = 0x3_0000;
/// Linear base of the data window both modes address.
const DATA: u32 = 0x1000;
const DATA_LEN: usize = 0x300;
const REAL_ORIGIN: u32 = 0x100;
const PM_ORIGIN: u32 = 0x7C26;

/// General registers other than SP.
fn gpr() -> impl Strategy<Value = u8> {
    (0u8..7).prop_map(|r| if r >= 4 { r + 1 } else { r })
}

fn modrm_rr(reg: u8, rm: u8) -> u8 {
    0xC0 | reg << 3 | rm
}

/// Base of a `[reg+disp8]` operand.
#[derive(Debug, Clone, Copy)]
enum Base {
    Bx,
    Si,
    Di,
    /// `[ebx+esi*scale]`; only with 32-bit addressing.
    Sib { scale: u8, index: u8 },
}

/// One program fragment. Immediates and addresses are rendered for
/// the code segment's default size.
#[derive(Debug, Clone)]
enum Snip {
    /// Bytes that mean the same in either mode.
    Raw(Vec<u8>),
    MovImm { r: u8, imm: u32 },
    AluImm { op: u8, r: u8, imm: u32 },
    JccOver { cc: u8, imm: u32 },
    Jcxz { imm: u32 },
    Loop { op: u8, count: u8, r: u8 },
    CallRet,
    CallReg { r: u8 },
    JmpReg { r: u8 },
    MemDirect { op: u8, r: u8, disp: u16 },
    MemBased {
        op: u8,
        r: u8,
        opsize: bool,
        addrsize: bool,
        base: Base,
        off: u16,
        disp: i8,
    },
}

struct Asm {
    code32: bool,
    origin: u32,
    bytes: Vec<u8>,
}

impl Asm {
    fn ip(&self) -> u32 {
        self.origin + self.bytes.len() as u32
    }

    fn imm_len(&self) -> u32 {
        if self.code32 {
            4
        } else {
            2
        }
    }

    fn put(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    fn imm(&mut self, v: u32) {
        if self.code32 {
            self.put(&v.to_le_bytes());
        } else {
            self.put(&(v as u16).to_le_bytes());
        }
    }

    /// `mov r,imm` at the default operand size.
    fn mov(&mut self, r: u8, v: u32) {
        self.put(&[0xB8 + r]);
        self.imm(v);
    }

    /// `mov r,imm` at an explicit operand size.
    fn mov_sized(&mut self, r: u8, v: u32, wide: bool) {
        if wide != self.code32 {
            self.put(&[0x66]);
        }
        self.put(&[0xB8 + r]);
        if wide {
            self.put(&v.to_le_bytes());
        } else {
            self.put(&(v as u16).to_le_bytes());
        }
    }

    /// DS offset of data window byte `off`.
    fn data(&self, off: u32) -> u32 {
        if self.code32 {
            DATA + off
        } else {
            off
        }
    }

    fn direct(&mut self, op: u8, reg: u8, disp: u16) {
        let addr = self.data(disp as u32);
        if self.code32 {
            self.put(&[op, 0x05 | reg << 3]);
            self.put(&addr.to_le_bytes());
        } else {
            self.put(&[op, 0x06 | reg << 3]);
            self.put(&(addr as u16).to_le_bytes());
        }
    }

    fn snip(&mut self, s: &Snip) {
        let sz = self.imm_len();
        match *s {
            Snip::Raw(ref bytes) => self.put(bytes),
            Snip::MovImm { r, imm } => self.mov(r, imm),
            Snip::AluImm { op, r, imm } => {
                self.put(&[0x81, modrm_rr(op, r)]);
                self.imm(imm);
            }
            Snip::JccOver { cc, imm } => {
                self.put(&[0x70 | cc, 1 + sz as u8]);
                self.mov(0, imm);
            }
            Snip::Jcxz { imm } => {
                self.put(&[0xE3, 1 + sz as u8]);
                self.mov(0, imm);
            }
            Snip::Loop { op, count, r } => {
                self.mov(ECX as u8, count as u32);
                self.put(&[0x40 + r, op, 0xFD]);
            }
            Snip::CallRet => {
                self.put(&[0xE8]);
                self.imm(2);
                self.put(&[0xEB, 0x01, 0xC3]);
            }
            Snip::CallReg { r } => {
                let ret = self.ip() + 1 + sz + 4;
                self.mov(r, ret);
                self.put(&[0xFF, 0xD0 | r, 0xEB, 0x01, 0xC3]);
            }
            Snip::JmpReg { r } => {
                let target = self.ip() + 1 + sz + 3;
                self.mov(r, target);
                self.put(&[0xFF, 0xE0 | r, 0xCC]);
            }
            Snip::MemDirect { op, r, disp } => self.direct(op, r, disp),
            Snip::MemBased {
                op,
                r,
                opsize,
                addrsize,
                base,
                off,
                disp,
            } => {
                let wide_addr = self.code32 != addrsize;
                let addr = self.data(off as u32);
                let mut tail = Vec::with_capacity(3);
                match (base, wide_addr) {
                    (Base::Sib { scale, index }, true) => {
                        self.mov_sized(EBX as u8, addr, true);
                        self.mov_sized(6, index as u32, true);
                        tail.extend_from_slice(&[0x44 | r << 3, scale << 6 | 6 << 3 | 3]);
                    }
                    (base, wide) => {
                        // [bx], [si], [di] or [ebx], [esi], [edi]
                        let (reg, rm16) = match base {
                            Base::Si => (6, 4),
                            Base::Di => (7, 5),
                            _ => (EBX as u8, 7),
                        };
                        self.mov_sized(reg, addr, wide);
                        tail.push(0x40 | r << 3 | if wide { reg } else { rm16 });
                    }
                }
                tail.push(disp as u8);
                if opsize {
                    self.put(&[0x66]);
                }
                if addrsize {
                    self.put(&[0x67]);
                }
                self.put(&[op]);
                self.put(&tail);
            }
        }
    }
}

fn render(snips: &[Snip], code32: bool, origin: u32) -> Vec<u8> {
    let mut a = Asm {
        code32,
        origin,
        bytes: Vec::new(),
    };
    for s in snips {
        a.snip(s);
    }
    a.put(&[0xF4]);
    a.bytes
}

fn alu_snippets() -> BoxedStrategy<Snip> {
    prop_oneof![
        // op r/m16, r16
        (0u8..8, gpr(), gpr()).prop_map(|(op, src, dst)| Snip::Raw(vec![op << 3 | 1, modrm_rr(src, dst)])),
        // op r/m8, r8
        (0u8..8, 0u8..8, 0u8..8).prop_map(|(op, src, dst)| Snip::Raw(vec![op << 3, modrm_rr(src, dst)])),
        // the other operand size
        (0u8..8, gpr(), gpr()).prop_map(|(op, src, dst)| Snip::Raw(vec![0x66, op << 3 | 1, modrm_rr(src, dst)])),
        (0u8..8, gpr(), any::<u32>()).prop_map(|(op, r, imm)| Snip::AluImm { op, r, imm }),
        (0u8..8, gpr(), any::<u8>()).prop_map(|(op, dst, imm)| Snip::Raw(vec![0x83, modrm_rr(op, dst), imm])),
        (gpr(), any::<bool>()).prop_map(|(r, dec)| Snip::Raw(vec![if dec { 0x48 } else { 0x40 } + r])),
        // not, neg, mul, imul
        (2u8..6, gpr()).prop_map(|(op, r)| Snip::Raw(vec![0xF7, modrm_rr(op, r)])),
        (prop_oneof![0u8..6, Just(7u8)], gpr(), 1u8..32)
            .prop_map(|(op, r, count)| Snip::Raw(vec![0xC1, modrm_rr(op, r), count])),
        (prop_oneof![0u8..6, Just(7u8)], gpr(), any::<bool>())
            .prop_map(|(op, r, cl)| Snip::Raw(vec![if cl { 0xD3 } else { 0xD1 }, modrm_rr(op, r)])),
    ]
    .boxed()
}

fn misc_snippets() -> BoxedStrategy<Snip> {
    prop_oneof![
        (gpr(), any::<u32>()).prop_map(|(r, imm)| Snip::MovImm { r, imm }),
        (0u8..8, any::<u8>()).prop_map(|(r, imm)| Snip::Raw(vec![0xB0 + r, imm])),
        (0u8..16, 0u8..8).prop_map(|(cc, r)| Snip::Raw(vec![0x0F, 0x90 | cc, 0xC0 | r])),
        prop_oneof![
            Just(0xF5u8),
            Just(0xF8),
            Just(0xF9),
            Just(0xFC),
            Just(0xFD),
            Just(0x9E),
            Just(0x9F),
            Just(0x98),
            Just(0x99),
        ]
        .prop_map(|op| Snip::Raw(vec![op])),
        gpr().prop_map(|r| Snip::Raw(vec![0x90 + r])),
        (any::<bool>(), gpr(), 0u8..8).prop_map(|(signed, dst, src)| {
            Snip::Raw(vec![0x0F, if signed { 0xBE } else { 0xB6 }, modrm_rr(dst, src)])
        }),
        (gpr(), gpr()).prop_map(|(a, b)| Snip::Raw(vec![0x50 + a, 0x58 + b])),
    ]
    .boxed()
}

fn control_snippets() -> BoxedStrategy<Snip> {
    let not_cx = gpr().prop_filter("loop counter", |&r| r != ECX as u8);
    prop_oneof![
        (0u8..16, any::<u32>()).prop_map(|(cc, imm)| Snip::JccOver { cc, imm }),
        any::<u32>().prop_map(|imm| Snip::Jcxz { imm }),
        (0xE0u8..0xE3, 1u8..6, not_cx).prop_map(|(op, count, r)| Snip::Loop { op, count, r }),
        Just(Snip::CallRet),
        gpr().prop_map(|r| Snip::CallReg { r }),
        gpr().prop_map(|r| Snip::JmpReg { r }),
    ]
    .boxed()
}

/// Register operand ops with an r/m memory form.
fn mem_op() -> impl Strategy<Value = u8> {
    prop::sample::select(vec![
        0x00u8, 0x01, 0x03, 0x09, 0x21, 0x29, 0x2B, 0x31, 0x39, 0x85, 0x88, 0x89, 0x8A, 0x8B,
    ])
}

fn memory_snippets() -> BoxedStrategy<Snip> {
    let base = prop_oneof![
        Just(Base::Bx),
        Just(Base::Si),
        Just(Base::Di),
        (0u8..4, 0u8..16).prop_map(|(scale, index)| Base::Sib { scale, index }),
    ];
    prop_oneof![
        (mem_op(), gpr(), 0u16..0x200).prop_map(|(op, r, disp)| Snip::MemDirect { op, r, disp }),
        (
            mem_op(),
            gpr(),
            any::<bool>(),
            any::<bool>(),
            base,
            0x80u16..0x180,
            any::<i8>(),
        )
            .prop_map(|(op, r, opsize, addrsize, base, off, disp)| Snip::MemBased {
                op,
                r,
                opsize,
                addrsize,
                base,
                off,
                disp,
            }),
    ]
    .boxed()
}

fn fpu_snippets() -> BoxedStrategy<Snip> {
    prop_oneof![
        // fld1, fldz, fchs, fabs
        prop::sample::select(vec![0xE8u8, 0xEE, 0xE0, 0xE1]).prop_map(|m| Snip::Raw(vec![0xD9, m])),
        // fld st(i), fxch st(i)
        (prop::sample::select(vec![0xC0u8, 0xC8]), 0u8..8).prop_map(|(m, i)| Snip::Raw(vec![0xD9, m + i])),
        // fadd, fmul, fsub, fdiv st(0),st(i)
        (prop::sample::select(vec![0xC0u8, 0xC8, 0xE0, 0xF0]), 0u8..8)
            .prop_map(|(m, i)| Snip::Raw(vec![0xD8, m + i])),
        // faddp st(1); fstp st(i)
        Just(Snip::Raw(vec![0xDE, 0xC1])),
        (0u8..8).prop_map(|i| Snip::Raw(vec![0xDD, 0xD8 + i])),
        // fild/fistp m16, fld/fstp m32, fld/fstp m64, fild/fistp m32
        (
            prop::sample::select(vec![0xDFu8, 0xD9, 0xDD, 0xDB]),
            prop::sample::select(vec![0u8, 3]),
            (0u16..0x100).prop_map(|d| d & !7),
        )
            .prop_map(|(op, r, disp)| Snip::MemDirect { op, r, disp }),
    ]
    .boxed()
}

fn program() -> impl Strategy<Value = Vec<Snip>> {
    prop::collection::vec(
        prop_oneof![
            3 => alu_snippets(),
            2 => misc_snippets(),
            2 => control_snippets(),
            2 => memory_snippets(),
            1 => fpu_snippets(),
        ],
        1..40,
    )
}

fn initial_flags() -> impl Strategy<Value = u32> {
    let mask = (Eflags::CF | Eflags::PF | Eflags::AF | Eflags::ZF | Eflags::SF | Eflags::DF | Eflags::OF).bits();
    any::<u32>().prop_map(move |f| f & mask | Eflags::FIXED1.bits())
}

/// Real mode at 1000:0100, DS over the data window, stack at
/// 0000:FFFE.
fn real_machine(code: &[u8], data: &[u8]) -> (CpuState, FlatMemory) {
    let mut mem = FlatMemory::new(MEM_SIZE);
    mem.load(0x1_0000 + REAL_ORIGIN, code);
    mem.load(DATA, data);
    let mut cpu = CpuState::new();
    cpu.load_seg_real(SegReg::Cs, 0x1000);
    cpu.load_seg_real(SegReg::Ds, (DATA >> 4) as u16);
    cpu.load_seg_real(SegReg::Ss, 0);
    cpu.regs[ESP] = 0xFFFE;
    cpu.eip = REAL_ORIGIN;
    (cpu, mem)
}

/// Flat 32-bit segments from a GDT at 0800h, entered by the
/// interpreter. The program follows the entry code at PM_ORIGIN.
fn protected_machine(code: &[u8], data: &[u8]) -> (CpuState, FlatMemory) {
    let mut mem = FlatMemory::new(MEM_SIZE);
    mem.load(
        0x800,
        &[
            0, 0, 0, 0, 0, 0, 0, 0, //
            0xFF, 0xFF, 0, 0, 0, 0x9A, 0xCF, 0, //
            0xFF, 0xFF, 0, 0, 0, 0x92, 0xCF, 0,
        ],
    );
    mem.load(0x900, &[0x17, 0x00, 0x00, 0x08, 0x00, 0x00]);
    let mut entry = crate::interp::pmode_entry();
    // Keep the far jump; replace the tail with segment and stack setup.
    entry.truncate(0x17);
    entry.extend_from_slice(&[
        0x66, 0xB8, 0x10, 0x00, // mov ax,10h
        0x8E, 0xD8, // mov ds,ax
        0x8E, 0xC0, // mov es,ax
        0x8E, 0xD0, // mov ss,ax
        0xBC, 0x00, 0x90, 0x00, 0x00, // mov esp,9000h
    ]);
    mem.load(0x7C00, &entry);
    mem.load(PM_ORIGIN, code);
    mem.load(DATA, data);
    let mut cpu = CpuState::new();
    cpu.load_seg_real(SegReg::Cs, 0);
    cpu.load_seg_real(SegReg::Ds, 0);
    cpu.eip = 0x7C00;

    let mut it = Interpreter::with_state(cpu, mem);
    assert_eq!(it.run(10), RunExit::CyclesExhausted);
    assert_eq!(it.cpu.eip, PM_ORIGIN);
    assert!(it.cpu.mode().code32);
    (it.cpu, it.mem)
}

fn config(max_block_insns: u32, link_blocks: bool) -> DynrecConfig {
    DynrecConfig {
        cache_size: 64 * 1024,
        max_block_bytes: 4096,
        max_block_insns,
        link_blocks,
        ..DynrecConfig::default()
    }
}

fn same_state(a: &CpuState, b: &CpuState) -> Result<(), TestCaseError> {
    prop_assert_eq!(a.regs, b.regs);
    prop_assert_eq!(a.eip, b.eip);
    prop_assert_eq!(a.eflags, b.eflags, "eflags {:#x} != {:#x}", a.eflags, b.eflags);
    prop_assert_eq!(a.fpu.top, b.fpu.top);
    prop_assert_eq!(a.fpu.tags, b.fpu.tags);
    for slot in 0..8 {
        if b.fpu.tags[slot] != TAG_EMPTY {
            prop_assert_eq!(
                a.fpu.regs[slot].to_bits(),
                b.fpu.regs[slot].to_bits(),
                "fpu slot {}: {} != {}",
                slot,
                a.fpu.regs[slot],
                b.fpu.regs[slot]
            );
        }
    }
    Ok(())
}

fn run_both(
    mut cpu: CpuState,
    mem: FlatMemory,
    regs: [u32; 8],
    eflags: u32,
    config: DynrecConfig,
) -> Result<(), TestCaseError> {
    let esp = cpu.regs[ESP];
    cpu.regs = regs;
    cpu.regs[ESP] = esp;
    cpu.eflags = eflags;

    let mut it = Interpreter::with_state(cpu.clone(), mem.clone());
    prop_assert_eq!(it.run(100_000), RunExit::Halted);
    let mut core = DynCore::new(cpu, mem, config).unwrap();
    prop_assert_eq!(core.run(100_000), RunExit::Halted);

    same_state(&core.cpu, &it.cpu)?;
    prop_assert!(core.mem().as_slice() == it.mem.as_slice(), "guest memory differs");
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 512,
        ..ProptestConfig::default()
    })]

    #[test]
    fn real_mode_matches_interpreter(
        snips in program(),
        data in prop::collection::vec(any::<u8>(), DATA_LEN),
        regs in any::<[u32; 8]>(),
        eflags in initial_flags(),
        max_block_insns in 1u32..8,
        link_blocks in any::<bool>(),
    ) {
        let code = render(&snips, false, REAL_ORIGIN);
        let (cpu, mem) = real_machine(&code, &data);
        run_both(cpu, mem, regs, eflags, config(max_block_insns, link_blocks))?;
    }

    #[test]
    fn protected_mode_matches_interpreter(
        snips in program(),
        data in prop::collection::vec(any::<u8>(), DATA_LEN),
        regs in any::<[u32; 8]>(),
        eflags in initial_flags(),
        max_block_insns in 1u32..8,
        link_blocks in any::<bool>(),
    ) {
        let code = render(&snips, true, PM_ORIGIN);
        let (cpu, mem) = protected_machine(&code, &data);
        run_both(cpu, mem, regs, eflags, config(max_block_insns, link_blocks))?;
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        ..ProptestConfig::default()
    })]

    #[test]
    fn interrupts_match_interpreter(
        after in 1u32..40,
        max_block_insns in 1u32..8,
        link_blocks in any::<bool>(),
    ) {
        let (cpu, mem) = super::irq_machine(after);
        let mut it = Interpreter::with_state(cpu.clone(), mem.clone());
        let mut core = DynCore::new(cpu, mem, config(max_block_insns, link_blocks)).unwrap();
        for _ in 0..100 {
            if it.run(10_000) == RunExit::Halted && it.mem.fired {
                break;
            }
        }
        for _ in 0..100 {
            if core.run(10_000) == RunExit::Halted && core.mem().fired {
                break;
            }
        }
        prop_assert!(it.mem.fired && core.mem().fired);

        same_state(&core.cpu, &it.cpu)?;
        prop_assert_eq!(
            (core.cpu.reg16(EBX), core.cpu.reg16(ECX), core.cpu.reg16(EDX)),
            (5, 0, 1)
        );
        prop_assert_eq!(core.cpu.eip, 0x10D);
        prop_assert!(core.mem().mem.as_slice() == it.mem.mem.as_slice(), "guest memory differs");
    }
}
