//! Code cache and dispatch loop.

mod difftest;

use dynx86_backend::{CompiledCode, LinkSite, NativeEmitter};
use dynx86_core::block::BlockId;
use dynx86_core::cpu::{EAX, EBX, ECX, EDX, ESP};
use dynx86_core::memory::page_of;
use dynx86_core::{CpuMode, CpuState, Eflags, FlatMemory, GuestMemory, SegReg};
use dynx86_exec::{
    CodeCache, ConfigError, CpuCore, DispatchState, DynCore, DynrecConfig, DynrecError, RunExit,
};
use dynx86_frontend::TranslatedBlock;
use dynx86_interp::Interpreter;

use crate::init_tracing;

fn small_config() -> DynrecConfig {
    DynrecConfig {
        cache_size: 64 * 1024,
        max_block_bytes: 4096,
        ..DynrecConfig::default()
    }
}

fn new_cache(config: &DynrecConfig) -> CodeCache {
    CodeCache::new(config, &mut NativeEmitter::new()).unwrap()
}

/// A block image that is committed but never run.
fn fake_block(start: u32, guest_len: u32, host_len: usize) -> TranslatedBlock {
    let end = start + guest_len;
    let mut pages = vec![page_of(start)];
    if page_of(end - 1) != pages[0] {
        pages.push(page_of(end - 1));
    }
    TranslatedBlock {
        start,
        end,
        cs_base: 0,
        mode: CpuMode::REAL,
        pages,
        insn_count: 1,
        code: CompiledCode {
            bytes: vec![0xCC; host_len],
            epilogue_relocs: Vec::new(),
            exit_sites: Vec::new(),
            link_sites: [None; 2],
            insn_count: 1,
        },
    }
}

/// A fake block whose first five bytes are a patchable exit.
fn linkable_block(start: u32, cs_base: u32) -> TranslatedBlock {
    let mut b = fake_block(start, 4, 32);
    b.cs_base = cs_base;
    b.code.bytes[3..8].copy_from_slice(&[0xE9, 0, 0, 0, 0]);
    b.code.link_sites[0] = Some(LinkSite {
        jmp_offset: 3,
        reset_offset: 8,
    });
    b
}

// -- Code cache --------------------------------------------------------

#[test]
fn test_lookup_exact_start_only() {
    let mut cache = new_cache(&small_config());
    let id = cache.commit(fake_block(0x1000, 0x10, 64)).unwrap();
    assert_eq!(cache.lookup(0x1000), Some(id));
    for addr in 0x1001..0x1010 {
        assert_eq!(cache.lookup(addr), None, "hit inside block at {addr:#x}");
    }
    // Repeated lookups agree.
    assert_eq!(cache.lookup(0x1000), cache.lookup(0x1000));
    let b = cache.block(id).unwrap();
    assert_eq!((b.start, b.end, b.len), (0x1000, 0x1010, 64));
    assert_eq!(b.offset % 16, 0);
    assert_eq!(cache.blocks_on_page(1), &[id]);
    assert!(cache.is_code_page(1));
}

#[test]
fn test_full_cache_resets_and_keeps_newest() {
    init_tracing();
    let mut cache = new_cache(&small_config());
    let a = cache.commit(fake_block(0x1000, 4, 1000)).unwrap();
    let first_offset = cache.block(a).unwrap().offset;
    let mut start = 0x1010;
    while cache.free() >= 1000 {
        cache.commit(fake_block(start, 4, 1000)).unwrap();
        start += 0x10;
    }
    assert_eq!(cache.stats().resets, 0);

    let newest = cache.commit(fake_block(0x8000, 4, 1000)).unwrap();
    assert_eq!(cache.stats().resets, 1);
    assert_eq!(cache.block_count(), 1);
    assert_eq!(cache.lookup(0x8000), Some(newest));
    assert_eq!(cache.lookup(0x1000), None);
    assert!(!cache.is_code_page(1));
    assert_eq!(cache.block(newest).unwrap().offset, first_offset);
}

#[test]
fn test_one_byte_short_resets() {
    let mut cache = new_cache(&small_config());
    cache.commit(fake_block(0x1000, 4, 300)).unwrap();
    let free = cache.free();
    cache.commit(fake_block(0x2000, 4, free + 1)).unwrap();
    assert_eq!(cache.stats().resets, 1);
    assert_eq!(cache.block_count(), 1);
}

#[test]
fn test_exact_fit_does_not_reset() {
    let mut cache = new_cache(&small_config());
    cache.commit(fake_block(0x1000, 4, 300)).unwrap();
    let free = cache.free();
    cache.commit(fake_block(0x2000, 4, free)).unwrap();
    assert_eq!(cache.stats().resets, 0);
    assert_eq!(cache.block_count(), 2);
    assert_eq!(cache.free(), 0);
}

#[test]
fn test_block_larger_than_cache() {
    let mut cache = new_cache(&small_config());
    cache.commit(fake_block(0x1000, 4, 16)).unwrap();
    let err = cache.commit(fake_block(0x2000, 4, cache.capacity())).unwrap_err();
    assert!(matches!(err, DynrecError::BlockTooLarge { .. }));
    assert_eq!(cache.block_count(), 1);
    assert_eq!(cache.stats().resets, 0);
}

#[test]
fn test_write_invalidates_overlapping_blocks_only() {
    let mut cache = new_cache(&small_config());
    let a = cache.commit(fake_block(0x1000, 0x10, 32)).unwrap();
    let b = cache.commit(fake_block(0x1010, 0x10, 32)).unwrap();

    assert!(!cache.on_guest_write(0x3000, 4));
    assert!(!cache.on_guest_write(0x1020, 4));
    assert!(cache.on_guest_write(0x1012, 2));
    assert!(cache.block(a).is_some());
    assert!(cache.block(b).is_none());
    assert_eq!(cache.lookup(0x1010), None);
    assert_eq!(cache.stats().invalidated, 1);
    assert!(cache.is_code_page(1));

    // Straddles both blocks; only A is left to hit.
    assert!(cache.on_guest_write(0x100F, 2));
    assert_eq!(cache.block_count(), 0);
    assert!(!cache.is_code_page(1));
}

#[test]
fn test_page_crossing_write() {
    let mut cache = new_cache(&small_config());
    cache.commit(fake_block(0x2000, 8, 32)).unwrap();
    assert!(cache.on_guest_write(0x1FFF, 2));
    assert_eq!(cache.block_count(), 0);
}

#[test]
fn test_page_crossing_block() {
    let mut cache = new_cache(&small_config());
    let id = cache.commit(fake_block(0x1FFC, 8, 32)).unwrap();
    assert_eq!(cache.blocks_on_page(1), &[id]);
    assert_eq!(cache.blocks_on_page(2), &[id]);
    assert_eq!(cache.invalidate_page(2), 1);
    assert!(!cache.is_code_page(1));
    assert_eq!(cache.invalidate_page(2), 0);
}

#[test]
fn test_page_turns_hot() {
    let config = DynrecConfig {
        smc_threshold: 1,
        ..small_config()
    };
    let mut cache = new_cache(&config);
    for _ in 0..2 {
        assert!(!cache.is_hot(1));
        cache.commit(fake_block(0x1000, 4, 32)).unwrap();
        assert!(cache.on_guest_write(0x1000, 1));
    }
    assert!(cache.is_hot(1));
    cache.reset("test");
    assert!(!cache.is_hot(1));
}

#[test]
fn test_link_and_unlink() {
    let mut cache = new_cache(&small_config());
    let a = cache.commit(linkable_block(0x1000, 0)).unwrap();
    let b = cache.commit(linkable_block(0x1100, 0)).unwrap();
    let other = cache.commit(linkable_block(0x1200, 0x10)).unwrap();

    assert!(cache.link(a, 0, b).unwrap());
    assert_eq!(cache.block(a).unwrap().linked_to(0), Some(b));
    assert_eq!(cache.stats().links, 1);
    // Already linked.
    assert!(!cache.link(a, 0, b).unwrap());
    // No patchable exit in slot 1.
    assert!(!cache.link(a, 1, b).unwrap());
    // Different CS base.
    assert!(!cache.link(a, 0, other).unwrap());

    cache.invalidate_block(b);
    assert_eq!(cache.block(a).unwrap().linked_to(0), None);
    assert!(!cache.link(a, 0, b).unwrap());
}

#[test]
fn test_same_start_replaces_block() {
    let mut cache = new_cache(&small_config());
    let old = cache.commit(linkable_block(0x1000, 0)).unwrap();
    let new = cache.commit(linkable_block(0x1000, 0x100)).unwrap();
    assert_ne!(old, new);
    assert_eq!(cache.lookup(0x1000), Some(new));
    assert!(cache.block(old).is_none());
    assert_eq!(cache.block_count(), 1);
}

// -- Dispatch ----------------------------------------------------------

const CODE: u32 = 0x1_0100;

/// Real-mode CPU at 1000:0100 with DS = CS and the stack at
/// 0000:FFFE.
fn real_mode(code: &[u8]) -> (CpuState, FlatMemory) {
    let mut mem = FlatMemory::new(0x3_0000);
    mem.load(CODE, code);
    let mut cpu = CpuState::new();
    cpu.load_seg_real(SegReg::Cs, 0x1000);
    cpu.load_seg_real(SegReg::Ds, 0x1000);
    cpu.load_seg_real(SegReg::Ss, 0);
    cpu.regs[ESP] = 0xFFFE;
    cpu.eip = 0x100;
    (cpu, mem)
}

fn dyn_core(code: &[u8], config: DynrecConfig) -> DynCore<FlatMemory> {
    init_tracing();
    let (cpu, mem) = real_mode(code);
    DynCore::new(cpu, mem, config).unwrap()
}

// mov ax,1; add ax,ax; jmp 0100h
const ADD_LOOP: &[u8] = &[0xB8, 0x01, 0x00, 0x01, 0xC0, 0xEB, 0xF9];

#[test]
fn test_scenario_second_pass_from_cache() {
    let mut core = dyn_core(ADD_LOOP, small_config());
    assert_eq!(core.run(3), RunExit::CyclesExhausted);
    assert_eq!(core.cpu.reg16(EAX), 2);
    assert_eq!(core.cpu.eip, 0x100);
    assert_eq!(core.stats().translations, 1);

    // MOV AX,1 reloads AX on every pass.
    assert_eq!(core.run(3), RunExit::CyclesExhausted);
    assert_eq!(core.cpu.reg16(EAX), 2);
    assert_eq!(core.cpu.eip, 0x100);
    assert_eq!(core.stats().translations, 1);
    assert_eq!(core.stats().blocks_executed, 2);
}

// mov ax,1; l: add ax,ax; jmp l
const DOUBLING: &[u8] = &[0xB8, 0x01, 0x00, 0x01, 0xC0, 0xEB, 0xFC];

#[test]
fn test_doubling_loop_reuses_blocks() {
    let mut core = dyn_core(DOUBLING, small_config());
    assert_eq!(core.run(3), RunExit::CyclesExhausted);
    assert_eq!(core.cpu.reg16(EAX), 2);
    assert_eq!(core.cpu.eip, 0x103);
    // The branch target lies inside the first block and gets its own.
    assert_eq!(core.run(2), RunExit::CyclesExhausted);
    assert_eq!(core.cpu.reg16(EAX), 4);
    assert_eq!(core.stats().translations, 2);

    assert_eq!(core.run(2), RunExit::CyclesExhausted);
    assert_eq!(core.cpu.reg16(EAX), 8);
    assert_eq!(core.stats().translations, 2);
    assert_eq!(core.cpu.eip, 0x103);
}

#[test]
fn test_chained_blocks_run_without_dispatcher() {
    let mut core = dyn_core(DOUBLING, small_config());
    core.run(3);
    assert_eq!(core.run(4), RunExit::CyclesExhausted);
    assert_eq!(core.cpu.reg16(EAX), 8);
    assert_eq!(core.cache_stats().links, 1);
    let entered = core.stats().blocks_executed;

    // Three passes through the self-linked loop, one entry.
    assert_eq!(core.run(6), RunExit::CyclesExhausted);
    assert_eq!(core.cpu.reg16(EAX), 64);
    assert_eq!(core.stats().blocks_executed, entered + 1);
    assert_eq!(core.cpu.eip, 0x103);
}

#[test]
fn test_linking_disabled() {
    let config = DynrecConfig {
        link_blocks: false,
        ..small_config()
    };
    let mut core = dyn_core(DOUBLING, config);
    core.run(3);
    let entered = core.stats().blocks_executed;
    core.run(6);
    assert_eq!(core.cpu.reg16(EAX), 16);
    assert_eq!(core.stats().blocks_executed, entered + 3);
    assert_eq!(core.cache_stats().links, 0);
}

#[test]
fn test_external_write_invalidates_code() {
    // mov ax,1; jmp 0100h
    let mut core = dyn_core(&[0xB8, 0x01, 0x00, 0xEB, 0xFB], small_config());
    core.run(2);
    assert_eq!(core.cpu.reg16(EAX), 1);
    assert_eq!(core.cache_stats().invalidated, 0);

    core.mem_mut().write_u16(CODE + 1, 5);
    assert_eq!(core.cache_stats().invalidated, 1);
    assert_eq!(core.cache().block_count(), 0);

    core.run(2);
    assert_eq!(core.cpu.reg16(EAX), 5);
    assert_eq!(core.stats().translations, 2);
}

#[test]
fn test_external_write_elsewhere_keeps_code() {
    let mut core = dyn_core(&[0xB8, 0x01, 0x00, 0xEB, 0xFB], small_config());
    core.run(2);
    core.mem_mut().write_u16(CODE + 0x2000, 5);
    core.mem_mut().write_u16(CODE + 5, 5);
    assert_eq!(core.cache_stats().invalidated, 0);
    assert_eq!(core.cache().block_count(), 1);
}

// mov word [0107h],9; mov ax,1; hlt
const PATCH_AHEAD: &[u8] = &[0xC7, 0x06, 0x07, 0x01, 0x09, 0x00, 0xB8, 0x01, 0x00, 0xF4];

#[test]
fn test_guest_write_into_running_block() {
    let mut core = dyn_core(PATCH_AHEAD, small_config());
    assert_eq!(core.run(100), RunExit::Halted);
    assert_eq!(core.cpu.reg16(EAX), 9);
    assert!(core.cache_stats().invalidated >= 1);

    let (cpu, mem) = real_mode(PATCH_AHEAD);
    let mut it = Interpreter::with_state(cpu, mem);
    assert_eq!(it.run(100), RunExit::Halted);
    assert_eq!(it.cpu.regs, core.cpu.regs);
    assert_eq!(it.cpu.eip, core.cpu.eip);
}

#[test]
fn test_hot_page_is_interpreted() {
    let config = DynrecConfig {
        smc_threshold: 1,
        ..small_config()
    };
    let mut core = dyn_core(&[0xB8, 0x01, 0x00, 0xEB, 0xFB], config);
    core.run(2);
    core.mem_mut().write_u16(CODE + 1, 5);
    core.run(2);
    core.mem_mut().write_u16(CODE + 1, 7);
    assert!(core.cache().is_hot(page_of(CODE)));

    let interpreted = core.stats().interpreted;
    core.run(2);
    assert_eq!(core.cpu.reg16(EAX), 7);
    assert_eq!(core.stats().translations, 2);
    assert_eq!(core.stats().interpreted, interpreted + 2);
}

#[test]
fn test_cs_base_mismatch_retranslates() {
    // mov ax,5; hlt
    let mut core = dyn_core(&[0xB8, 0x05, 0x00, 0xF4], small_config());
    assert_eq!(core.run(10), RunExit::Halted);
    assert_eq!(core.cpu.eip, 0x104);

    // Same linear address through another CS:IP pair.
    core.cpu.halted = false;
    core.cpu.load_seg_real(SegReg::Cs, 0x1010);
    core.cpu.eip = 0;
    assert_eq!(core.run(10), RunExit::Halted);
    assert_eq!(core.cpu.eip, 4);
    assert_eq!(core.stats().translations, 2);
}

#[test]
fn test_mode_switch_resets_cache() {
    init_tracing();
    let mut mem = FlatMemory::new(0x1_0000);
    mem.load(
        0x800,
        &[
            0, 0, 0, 0, 0, 0, 0, 0, //
            0xFF, 0xFF, 0, 0, 0, 0x9A, 0xCF, 0, //
            0xFF, 0xFF, 0, 0, 0, 0x92, 0xCF, 0,
        ],
    );
    mem.load(0x900, &[0x17, 0x00, 0x00, 0x08, 0x00, 0x00]);
    mem.load(0x7C00, &crate::interp::pmode_entry());
    let mut cpu = CpuState::new();
    cpu.load_seg_real(SegReg::Cs, 0);
    cpu.load_seg_real(SegReg::Ds, 0);
    cpu.eip = 0x7C00;
    let mut core = DynCore::new(cpu, mem, small_config()).unwrap();

    assert_eq!(core.run(100), RunExit::Halted);
    assert!(core.cpu.mode().code32);
    assert_eq!(core.cpu.regs[EAX], 0x1234_5678);
    assert!(core.cache_stats().resets >= 1);
}

#[test]
fn test_interrupt_after_sti_shadow() {
    // sti; jmp $
    let mut core = dyn_core(&[0xFB, 0xEB, 0xFE], small_config());
    core.mem_mut().write_u32(0x20 * 4, 0x0400_0000);
    // 0400:0000: mov ax,1234h; hlt
    for (i, b) in [0xB8, 0x34, 0x12, 0xF4].into_iter().enumerate() {
        core.mem_mut().write_u8(0x4000 + i as u32, b);
    }
    core.raise_interrupt(0x20);
    assert_eq!(core.run(1000), RunExit::Halted);
    assert_eq!(core.cpu.reg16(EAX), 0x1234);
    assert_eq!(core.cpu.selector(SegReg::Cs), 0x0400);
}

#[test]
fn test_interrupt_held_while_disabled() {
    // jmp $
    let mut core = dyn_core(&[0xEB, 0xFE], small_config());
    core.raise_interrupt(0x20);
    assert_eq!(core.run(50), RunExit::CyclesExhausted);
    assert_eq!(core.cpu.eip, 0x100);
}

#[test]
fn test_single_step_traps_after_one_instruction() {
    // mov ax,1; mov bx,2
    let mut core = dyn_core(&[0xB8, 0x01, 0x00, 0xBB, 0x02, 0x00], small_config());
    core.mem_mut().write_u32(4, 0x0400_0000);
    core.mem_mut().write_u8(0x4000, 0xF4);
    core.cpu.eflags |= Eflags::TF.bits();

    assert_eq!(core.run(100), RunExit::Halted);
    assert_eq!(core.cpu.reg16(EAX), 1);
    assert_eq!(core.cpu.reg16(EBX), 0);
    assert!(core.stats().interpreted >= 1);
    assert!(!core.cpu.flag(Eflags::TF));
}

#[test]
fn test_fault_in_callout() {
    // xor cx,cx; div cl; hlt
    let mut core = dyn_core(&[0x31, 0xC9, 0xF6, 0xF1, 0xF4], small_config());
    core.mem_mut().write_u32(0, 0x0400_0000);
    // Budget runs out inside the first block.
    assert_eq!(core.run(2), RunExit::CyclesExhausted);
    assert_eq!(core.state(), DispatchState::Faulted);
    assert_eq!(core.stats().exceptions, 1);
    assert_eq!(core.cpu.selector(SegReg::Cs), 0x0400);
    assert_eq!(core.cpu.eip, 0);
    assert_eq!(core.cpu.reg16(ECX), 0);
}

#[test]
fn test_untranslatable_instruction_falls_back() {
    // ud; with #UD at 0400:0000 -> hlt
    let mut core = dyn_core(&[0x0F, 0x0B], small_config());
    core.mem_mut().write_u32(6 * 4, 0x0400_0000);
    core.mem_mut().write_u8(0x4000, 0xF4);
    assert_eq!(core.run(100), RunExit::Halted);
    assert_eq!(core.stats().fallbacks, 1);
    assert_eq!(core.stats().exceptions, 1);
    assert!(!core.is_degraded());
}

#[test]
fn test_flush_drops_translations() {
    let mut core = dyn_core(ADD_LOOP, small_config());
    core.run(3);
    assert_eq!(core.cache().block_count(), 1);
    core.flush();
    assert_eq!(core.cache().block_count(), 0);
    assert_eq!(core.cache_stats().resets, 1);
    core.run(3);
    assert_eq!(core.stats().translations, 2);
}

#[test]
fn test_bad_config_rejected() {
    let (cpu, mem) = real_mode(&[0xF4]);
    let config = DynrecConfig {
        block_align: 12,
        ..small_config()
    };
    assert!(matches!(
        DynCore::new(cpu, mem, config),
        Err(DynrecError::Config(ConfigError::BadAlignment(12)))
    ));
}

#[test]
fn test_cpu_core_selection() {
    let (cpu, mem) = real_mode(&[0xB8, 0x05, 0x00, 0xF4]);
    let mut core = CpuCore::new(cpu.clone(), mem.clone(), DynrecConfig::default()).unwrap();
    assert!(core.is_dynamic());
    assert_eq!(core.run(10), RunExit::Halted);
    assert_eq!(core.cpu().reg16(EAX), 5);

    let mut it = CpuCore::interpreted(cpu.clone(), mem.clone());
    assert!(!it.is_dynamic());
    assert_eq!(it.run(10), RunExit::Halted);
    assert_eq!(it.cpu().regs, core.cpu().regs);
    assert_eq!(it.mem().as_slice(), core.mem().as_slice());

    let tiny = DynrecConfig {
        cache_size: 4096,
        ..DynrecConfig::default()
    };
    assert!(matches!(
        CpuCore::new(cpu, mem, tiny),
        Err(ConfigError::CacheTooSmall { .. })
    ));
}

#[test]
fn test_block_ids_are_sequential() {
    let mut cache = new_cache(&small_config());
    let a = cache.commit(fake_block(0x1000, 4, 16)).unwrap();
    let b = cache.commit(fake_block(0x1010, 4, 16)).unwrap();
    assert_eq!((a, b), (BlockId(0), BlockId(1)));
    cache.reset("test");
    assert_eq!(cache.commit(fake_block(0x1020, 4, 16)).unwrap(), BlockId(0));
}

#[test]
fn test_unmappable_cache_uses_interpreter() {
    init_tracing();
    let huge = DynrecConfig {
        cache_size: 1 << 62,
        ..DynrecConfig::default()
    };
    let (cpu, mem) = real_mode(ADD_LOOP);
    assert!(matches!(
        DynCore::new(cpu.clone(), mem.clone(), huge.clone()),
        Err(DynrecError::Arena(_))
    ));

    let mut core = CpuCore::new(cpu.clone(), mem.clone(), huge).unwrap();
    assert!(!core.is_dynamic());
    assert!(!core.is_degraded());
    assert_eq!(core.run(3), RunExit::CyclesExhausted);
    assert_eq!(core.cpu().reg16(EAX), 2);
    assert_eq!(core.cpu().eip, 0x100);

    let mut it = Interpreter::with_state(cpu, mem);
    it.run(3);
    assert_eq!(it.cpu.regs, core.cpu().regs);
}

#[test]
fn test_mapping_change_drops_page_blocks() {
    let mut core = dyn_core(ADD_LOOP, small_config());
    core.run(3);
    assert_eq!(core.cache_stats().blocks, 1);

    assert_eq!(core.on_mapping_change(page_of(CODE) + 1), 0);
    assert_eq!(core.cache_stats().blocks, 1);
    assert_eq!(core.on_mapping_change(page_of(CODE)), 1);
    assert_eq!(core.cache_stats().blocks, 0);

    core.run(3);
    assert_eq!(core.stats().translations, 2);
    assert_eq!(core.cpu.reg16(EAX), 2);
}

#[test]
fn test_cpu_core_external_access() {
    let (cpu, mem) = real_mode(ADD_LOOP);
    let mut core = CpuCore::new(cpu.clone(), mem.clone(), small_config()).unwrap();
    assert!(core.is_dynamic());
    core.run(3);
    assert_eq!(core.on_mapping_change(page_of(CODE)), 1);
    core.run(3);

    // mov ax,1 becomes mov ax,3.
    core.mem_mut().write_u8(CODE + 1, 0x03);
    assert_eq!(core.run(3), RunExit::CyclesExhausted);
    assert_eq!(core.cpu().reg16(EAX), 6);

    let mut it = CpuCore::interpreted(cpu, mem);
    it.mem_mut().write_u8(CODE + 1, 0x03);
    assert_eq!(it.on_mapping_change(page_of(CODE)), 0);
    assert_eq!(it.run(3), RunExit::CyclesExhausted);
    assert_eq!(it.cpu().reg16(EAX), 6);
    assert_eq!(it.mem().peek_u8(CODE + 1), 0x03);
}

/// Flat memory whose interrupt line fires vector 20h once, on the
/// `after`-th poll.
#[derive(Clone)]
struct CountdownIrq {
    mem: FlatMemory,
    after: u32,
    polls: u32,
    fired: bool,
}

impl GuestMemory for CountdownIrq {
    fn peek_u8(&self, addr: u32) -> u8 {
        self.mem.peek_u8(addr)
    }

    fn read_u8(&mut self, addr: u32) -> u8 {
        self.mem.read_u8(addr)
    }

    fn write_u8(&mut self, addr: u32, val: u8) {
        self.mem.write_u8(addr, val)
    }

    fn poll_interrupt(&mut self) -> Option<u8> {
        self.polls += 1;
        if self.fired || self.polls < self.after {
            return None;
        }
        self.fired = true;
        Some(0x20)
    }
}

// mov ax,1; jmp l; nop; nop; nop; l: inc bx; dec cx; jnz 0100h; hlt; jmp 010Ch
const IRQ_LOOP: &[u8] = &[
    0xB8, 0x01, 0x00, 0xEB, 0x03, 0x90, 0x90, 0x90, 0x43, 0x49, 0x75, 0xF4, 0xF4, 0xEB, 0xFD,
];

/// IRQ_LOOP with CX = 5 and interrupts enabled. The handler at
/// 1000:0200 is `inc dx; iret`.
fn irq_machine(after: u32) -> (CpuState, CountdownIrq) {
    let (mut cpu, mut mem) = real_mode(IRQ_LOOP);
    cpu.regs[ECX] = 5;
    cpu.eflags |= Eflags::IF.bits();
    mem.write_u32(0x20 * 4, 0x1000_0200);
    mem.load(0x1_0200, &[0x42, 0xCF]);
    let mem = CountdownIrq {
        mem,
        after,
        polls: 0,
        fired: false,
    };
    (cpu, mem)
}

#[test]
fn test_interrupt_between_linked_blocks() {
    init_tracing();
    for after in 1..10 {
        let (cpu, mem) = irq_machine(after);
        let mut core = DynCore::new(cpu, mem, small_config()).unwrap();
        for _ in 0..100 {
            if core.run(1000) == RunExit::Halted && core.mem().fired {
                break;
            }
        }
        assert!(core.mem().fired, "interrupt on poll {after} never fired");
        assert_eq!(core.cpu.eip, 0x10D, "interrupt on poll {after}");
        assert_eq!(core.cpu.reg16(EBX), 5, "interrupt on poll {after}");
        assert_eq!(core.cpu.reg16(ECX), 0, "interrupt on poll {after}");
        assert_eq!(core.cpu.reg16(EDX), 1, "interrupt on poll {after}");
        assert_eq!(core.cpu.regs[ESP], 0xFFFE);
    }
}
