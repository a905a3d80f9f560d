//! Per-instruction transfer functions.
//!
//! `kill` computes the wait an instruction needs before it may issue and
//! retires everything that wait covers.  `gen` records the asynchronous
//! operations the instruction itself starts.

use log::trace;
use std::collections::hash_map::Entry;

use crate::context::{
  BarrierKind, BarrierState, WaitCtx, WaitEntry, NUM_BARRIER_KINDS,
};
use crate::ir::{
  Format, GfxLevel, InstrKind, Instruction, MemorySyncInfo, Opcode, Operand,
  PhysReg, ProgramConfig, SyncScope, EXP_DUAL_SRC_BLEND_0,
  EXP_DUAL_SRC_BLEND_1, EXP_NULL, EXP_PARAM, EXP_POS, EXP_PRIM,
  SEMANTIC_ACQUIRE, SEMANTIC_ATOMIC, SEMANTIC_PRIVATE, SEMANTIC_RELEASE,
  SEMANTIC_RMW, SENDMSG_GS_DONE, STORAGE_ALL,
  STORAGE_COUNT, STORAGE_GDS, STORAGE_SCRATCH, STORAGE_VGPR_SPILL,
  VMEM_BVH, VMEM_NOSAMPLER,
};
use crate::target::*;
use crate::wait_imm::{counters_in, DepctrWait, WaitImm, WaitType};

/// Read-only parameters shared by every step of one pass run.
#[derive(Clone, Copy)]
pub struct PassCx<'a> {
  pub config: &'a ProgramConfig,
  pub info: &'a TargetInfo,
  /// Drain every nonzero counter before each instruction.
  pub force_waitcnt: bool,
}

impl<'a> PassCx<'a> {
  pub fn gfx_level(&self) -> GfxLevel {
    self.config.gfx_level
  }
}

//=============================================================================
// Instruction classification

/// The event a vector-memory access of sub-type `ty` generates.
pub fn get_vmem_event(cx: &PassCx, instr: &Instruction, ty: u8) -> u32 {
  if instr.definitions.is_empty() && cx.gfx_level() >= GfxLevel::Gfx10 {
    return EVENT_VMEM_STORE;
  }
  if cx.gfx_level() >= GfxLevel::Gfx12 && ty != VMEM_NOSAMPLER {
    if ty == VMEM_BVH {
      EVENT_VMEM_BVH
    } else {
      EVENT_VMEM_SAMPLE
    }
  } else {
    EVENT_VMEM
  }
}

/// Which register halves the access writes, two bits per unit.  With
/// SRAM ECC the hardware writes whole registers.
pub fn get_vmem_mask(cx: &PassCx, instr: &Instruction) -> u32 {
  if cx.config.sram_ecc_enabled {
    0xffff_ffff
  } else {
    instr.opcode.vmem_write_mask()
  }
}

/// Export events by target slot.  Unclassifiable slots are malformed input.
pub fn export_event(dest: u8) -> u32 {
  match dest {
    d if d <= EXP_NULL => EVENT_EXP_MRT_NULL,
    d if d <= EXP_POS + 4 => EVENT_EXP_POS,
    EXP_PRIM => EVENT_EXP_PRIM,
    EXP_DUAL_SRC_BLEND_0 | EXP_DUAL_SRC_BLEND_1 => EVENT_EXP_DUAL_SRC_BLEND,
    d if d >= EXP_PARAM => EVENT_EXP_PARAM,
    d => panic!("invalid export destination {}", d),
  }
}

/// The storage classes for which `instr` acts as an atomic access or a
/// control barrier with respect to `semantic` (acquire or release).
pub fn is_atomic_or_control_instr(
  cx: &PassCx, instr: &Instruction, sync: MemorySyncInfo, semantic: u8,
) -> u16 {
  let is_acquire = semantic & SEMANTIC_ACQUIRE != 0;
  let is_release = semantic & SEMANTIC_RELEASE != 0;

  if sync.semantics & SEMANTIC_ATOMIC != 0 {
    let rmw = sync.semantics & SEMANTIC_RMW != 0;
    let is_load = !instr.definitions.is_empty() || rmw;
    let is_store = instr.definitions.is_empty() || rmw;
    return if (is_load && is_acquire) || (is_store && is_release) {
      sync.storage
    } else {
      0
    };
  }

  let is_control_barrier = match &instr.kind {
    InstrKind::Barrier(info) => info.exec_scope > SyncScope::Invocation,
    _ => instr.opcode == Opcode::SBarrier,
  };
  if is_control_barrier && (is_acquire || is_release) {
    return STORAGE_ALL;
  }

  if is_release {
    let gs_done = instr.opcode == Opcode::SSendmsg
      && cx.gfx_level() < GfxLevel::Gfx11
      && instr.sopp_imm().map_or(false, |imm| imm & 0xf == SENDMSG_GS_DONE);
    let pos_or_prim_export = match &instr.kind {
      InstrKind::Exp(exp) => {
        (EXP_POS..=EXP_POS + 4).contains(&exp.dest) || exp.dest == EXP_PRIM
      }
      _ => false,
    };
    if gs_done || pos_or_prim_export {
      return STORAGE_ALL;
    }
  }
  0
}

//=============================================================================
// Hazard checks

/// The wait needed to complete the accesses of `entry` that matter for an
/// access of `reg` on the current logical path.
pub fn get_imm(cx: &PassCx, reg: PhysReg, entry: &WaitEntry) -> WaitImm {
  if !reg.is_vgpr() {
    return entry.imm;
  }

  let mut events = entry.logical_events;
  // On GFX11+ an ALU write to the inactive lanes of a pending DS/VMEM
  // destination still races with the load.
  if cx.gfx_level() >= GfxLevel::Gfx11 {
    events |= EVENT_LDS | EVENT_GDS | EVENT_VMEM | EVENT_VMEM_SAMPLE | EVENT_VMEM_BVH;
  }
  let counters = cx.info.counters_for_events(entry.events & events);

  let mut imm = WaitImm::new();
  for ty in counters_in(entry.counters & counters) {
    imm[ty] = entry.imm[ty];
  }
  imm
}

/// Folds into `wait` what `instr` must wait for before its operands may be
/// read and its definitions written.
pub fn check_instr(cx: &PassCx, ctx: &WaitCtx, wait: &mut WaitImm, instr: &Instruction) {
  for op in &instr.operands {
    for reg in op.units() {
      if let Some(entry) = ctx.gpr_map.get(&reg) {
        if entry.wait_on_read {
          wait.combine(&get_imm(cx, reg, entry));
        }
      }
    }
  }

  let vmem_type = instr.vmem_type(cx.gfx_level());
  let ds_event = instr.ds_info().map(|ds| if ds.gds { EVENT_GDS } else { EVENT_LDS });

  for def in &instr.definitions {
    for (j, reg) in def.units().enumerate() {
      let entry = match ctx.gpr_map.get(&reg) {
        Some(entry) => entry,
        None => continue,
      };
      let mut reg_imm = get_imm(cx, reg, entry);

      // Vector memory accesses complete in issue order.  Before GFX12
      // same-type loads also write their results in order, and a load
      // never races another one writing the other half or other lanes.
      if vmem_type != 0 {
        let event = get_vmem_event(cx, instr, vmem_type);
        let ty = cx.info.counter_of(event);
        let type_events = cx.info.events_of(ty);

        let event_matches = (entry.events & type_events) == event;
        let type_matches = ty != WaitType::Vm
          || (entry.vmem_types == vmem_type && vmem_type.count_ones() == 1);

        let mut different_halves = false;
        if event == EVENT_VMEM && event_matches {
          let mask = (get_vmem_mask(cx, instr) >> (j * 2)) & 0x3;
          different_halves = mask & entry.vm_mask as u32 == 0;
        }

        let different_lanes = (entry.logical_events & type_events) == 0;

        if (event_matches && type_matches && cx.gfx_level() < GfxLevel::Gfx12)
          || different_halves
          || different_lanes
        {
          reg_imm.unset(ty);
        }
      }

      // LDS and GDS accesses return in issue order.
      if let Some(ds_event) = ds_event {
        if (entry.events & cx.info.events_of(WaitType::Lgkm)) == ds_event {
          reg_imm.unset(WaitType::Lgkm);
        }
      }

      wait.combine(&reg_imm);
    }
  }
}

//=============================================================================
// Barriers

/// Barrier waits are delayed until an access that depends on them shows
/// up.  This moves the dependencies of a release (or acquire) into the
/// slot paid at that access.
pub fn setup_barrier(cx: &PassCx, ctx: &mut WaitCtx, sync: MemorySyncInfo, is_acquire: bool) {
  let subgroup_scope = if cx.config.workgroup_size <= cx.config.wave_size {
    SyncScope::Workgroup
  } else {
    SyncScope::Subgroup
  };
  if sync.scope <= subgroup_scope {
    return;
  }

  let src_kind = if is_acquire { BarrierKind::AcquireDep } else { BarrierKind::ReleaseDep };
  let src = ctx.bar(src_kind);

  let mut dst_imm = WaitImm::new();
  let mut dst_events = 0;
  for i in 0..STORAGE_COUNT {
    if (sync.storage & src.storage) & (1 << i) == 0 {
      continue;
    }
    // LDS is private to the workgroup.
    if src.events[i] == EVENT_LDS && sync.scope.min(SyncScope::Workgroup) <= subgroup_scope {
      continue;
    }
    dst_imm.combine(&src.imm[i]);
    dst_events |= src.events[i];
  }
  if dst_events == 0 {
    return;
  }

  let dst_kind = if is_acquire { BarrierKind::Acquire } else { BarrierKind::Release };
  let dst = ctx.bar_mut(dst_kind);
  for i in 0..STORAGE_COUNT {
    if sync.storage & (1 << i) != 0 {
      dst.imm[i].combine(&dst_imm);
      dst.events[i] |= dst_events;
      dst.scope[i] = dst.scope[i].max(sync.scope);
    }
  }
  dst.storage |= sync.storage;
  ctx.bar_nonempty |= dst_kind.bit();
}

fn finish_barrier_internal(
  cx: &PassCx, imm: &mut WaitImm, depctr: &mut DepctrWait, instr: &Instruction,
  info: &BarrierState, storage_idx: usize,
) {
  let mut events = info.events[storage_idx];
  let mut vm_vsrc = false;

  if info.scope[storage_idx] <= SyncScope::Workgroup {
    let is_vmem = instr.is_vmem() || (instr.is_flat_like() && !instr.may_use_lds());
    let is_lds = instr.ds_info().map_or(false, |ds| !ds.gds);
    let is_barrier = instr.is_barrier();
    let gfx10 = cx.gfx_level() >= GfxLevel::Gfx10;

    // Outside WGP mode one cache serves the whole workgroup and keeps its
    // memory accesses in order.
    let vmem_events = EVENT_VMEM | EVENT_VMEM_STORE;
    if events & vmem_events != 0 && (is_vmem || is_barrier) && !cx.config.wgp_mode {
      events &= !vmem_events;
      vm_vsrc |= is_barrier && gfx10;
    }

    if events & EVENT_LDS != 0
      && (is_lds || (is_barrier && gfx10 && !cx.config.wgp_mode))
    {
      events &= !EVENT_LDS;
      vm_vsrc |= is_barrier;
    }
  }

  if events != 0 {
    imm.combine(&info.imm[storage_idx]);
  }
  if vm_vsrc {
    depctr.vm_vsrc = 0;
  }
}

fn finish_barriers(
  cx: &PassCx, ctx: &WaitCtx, imm: &mut WaitImm, depctr: &mut DepctrWait,
  instr: &Instruction, sync: MemorySyncInfo,
) {
  if ctx.bar_nonempty & BarrierKind::Release.bit() != 0 {
    let info = ctx.bar(BarrierKind::Release);
    let storage = is_atomic_or_control_instr(cx, instr, sync, SEMANTIC_RELEASE);
    for i in 0..STORAGE_COUNT {
      if storage & info.storage & (1 << i) != 0 {
        finish_barrier_internal(cx, imm, depctr, instr, info, i);
      }
    }
  }
  if ctx.bar_nonempty & BarrierKind::Acquire.bit() != 0 {
    let info = ctx.bar(BarrierKind::Acquire);
    let storage = if sync.semantics & SEMANTIC_PRIVATE != 0 { 0 } else { sync.storage };
    for i in 0..STORAGE_COUNT {
      if storage & info.storage & (1 << i) != 0 {
        finish_barrier_internal(cx, imm, depctr, instr, info, i);
      }
    }
  }
}

/// Waits for every counter that may be nonzero.
pub fn force_waitcnt(ctx: &WaitCtx, imm: &mut WaitImm) {
  for ty in counters_in(ctx.nonzero) {
    imm[ty] = 0;
  }
}

fn update_barrier_info_for_wait(cx: &PassCx, ctx: &mut WaitCtx, idx: usize, imm: &WaitImm) {
  let info = &mut ctx.bar[idx];
  for (ty, target) in imm.iter_set() {
    for j in 0..STORAGE_COUNT {
      if info.storage & (1 << j) == 0 {
        continue;
      }
      let bar = &mut info.imm[j];
      if bar.is_set(ty) && target <= bar[ty] {
        bar.unset(ty);
        info.events[j] &= !cx.info.events_of(ty);

        if info.events[j] == 0 {
          debug_assert!(info.imm[j].is_empty());
          info.scope[j] = SyncScope::Invocation;
          info.storage &= !(1 << j);
        }
      }
    }
  }
  if info.storage == 0 {
    ctx.bar_nonempty &= !(1 << idx);
  }
}

//=============================================================================
// kill

/// Adds to `imm` (and `depctr`) what `instr` must wait for, then drops
/// everything that wait completes from the context.
pub fn kill(
  cx: &PassCx, ctx: &mut WaitCtx, imm: &mut WaitImm, depctr: &mut DepctrWait,
  instr: &Instruction, sync: MemorySyncInfo,
) {
  // Also drains before jumping to a separately compiled epilog.
  if instr.opcode == Opcode::SSetpcB64 || cx.force_waitcnt {
    force_waitcnt(ctx, imm);
  }

  check_instr(cx, ctx, imm, instr);

  if instr.is_ordered_count_release() {
    let gds = ctx.bar(BarrierKind::ReleaseDep).imm[STORAGE_GDS.trailing_zeros() as usize];
    imm.combine(&gds);
  }

  match &instr.kind {
    InstrKind::Barrier(barrier) => {
      if barrier.sync.semantics & SEMANTIC_RELEASE != 0 {
        setup_barrier(cx, ctx, barrier.sync, false);
      }
      if barrier.sync.semantics & SEMANTIC_ACQUIRE != 0 {
        setup_barrier(cx, ctx, barrier.sync, true);
      }
    }
    _ if sync.semantics & SEMANTIC_RELEASE != 0 => {
      setup_barrier(cx, ctx, sync, false);
    }
    _ => {}
  }

  finish_barriers(cx, ctx, imm, depctr, instr, sync);

  if !imm.is_empty() {
    // A pending flat access is counted on two counters; only a full drain
    // of either is known to complete it.
    if ctx.pending_flat_vm && imm.is_set(WaitType::Vm) {
      imm[WaitType::Vm] = 0;
    }
    if ctx.pending_flat_lgkm && imm.is_set(WaitType::Lgkm) {
      imm[WaitType::Lgkm] = 0;
    }

    for (ty, target) in imm.iter_set() {
      if target == 0 {
        ctx.nonzero &= !ty.bit();
      }
    }

    for idx in 0..NUM_BARRIER_KINDS {
      if ctx.bar_nonempty & (1 << idx) != 0 {
        update_barrier_info_for_wait(cx, ctx, idx, imm);
      }
    }

    let imm = *imm;
    let info = cx.info;
    ctx.gpr_map.retain(|reg, entry| {
      for (ty, target) in imm.iter_set() {
        if target <= entry.imm[ty] {
          entry.remove_wait(ty, info.events_of(ty));
        }
      }
      if entry.counters == 0 {
        trace!("    retired {:?}", reg);
      }
      entry.counters != 0
    });
  }

  if imm[WaitType::Vm] == 0 {
    ctx.pending_flat_vm = false;
  }
  if imm[WaitType::Lgkm] == 0 {
    ctx.pending_flat_lgkm = false;
  }
}

//=============================================================================
// gen

fn update_barrier_info_for_event(
  cx: &PassCx, ctx: &mut WaitCtx, counters: u8, event: u32, kind: BarrierKind,
  storage: u16,
) {
  if storage != 0 {
    ctx.bar_mut(kind).storage |= storage;
    ctx.bar_nonempty |= kind.bit();
  }

  let unordered = cx.info.unordered_events;
  let info = ctx.bar_mut(kind);
  for i in 0..STORAGE_COUNT {
    if info.storage & (1 << i) == 0 {
      continue;
    }
    let bar = &mut info.imm[i];
    let bar_ev = &mut info.events[i];

    if storage & (1 << i) != 0 {
      // Waiting on this slot must now wait for this access too.
      *bar_ev |= event;
      for ty in counters_in(counters) {
        bar[ty] = 0;
      }
    } else if *bar_ev & unordered == 0 && unordered & event == 0 {
      // The slot's accesses are now one further ahead of the counter.
      for ty in counters_in(counters) {
        if bar.is_set(ty) && (*bar_ev & cx.info.events_of(ty)) == event {
          bar[ty] = (bar[ty] + 1).min(cx.info.max_cnt[ty]);
        }
      }
    }
  }
}

/// Accounts for a new access in the barrier slots.  `instr` is `None` for
/// accesses made before the program starts.
pub fn update_barriers(
  cx: &PassCx, ctx: &mut WaitCtx, counters: u8, event: u32, instr: Option<&Instruction>,
  sync: MemorySyncInfo,
) {
  let mut storage_rel = sync.storage;
  // Private scratch and spill stores are still tracked, so that the VGPR
  // deallocation at the end can wait for them.
  if sync.semantics & SEMANTIC_PRIVATE != 0 {
    storage_rel &= STORAGE_SCRATCH | STORAGE_VGPR_SPILL;
  }
  update_barrier_info_for_event(cx, ctx, counters, event, BarrierKind::ReleaseDep, storage_rel);

  if let Some(instr) = instr {
    let storage_acq = is_atomic_or_control_instr(cx, instr, sync, SEMANTIC_ACQUIRE);
    update_barrier_info_for_event(cx, ctx, counters, event, BarrierKind::AcquireDep, storage_acq);
  }

  update_barrier_info_for_event(cx, ctx, counters, event, BarrierKind::Release, 0);
  update_barrier_info_for_event(cx, ctx, counters, event, BarrierKind::Acquire, 0);
}

/// Issues `event`: every older access of the same event is now one more
/// completion away on each counter it uses.
pub fn update_counters(
  cx: &PassCx, ctx: &mut WaitCtx, event: u32, instr: Option<&Instruction>,
  sync: MemorySyncInfo,
) {
  let counters = cx.info.counters_for_event(event);
  ctx.nonzero |= counters;

  update_barriers(cx, ctx, counters, event, instr, sync);

  if cx.info.is_unordered(event) {
    return;
  }

  for entry in ctx.gpr_map.values_mut() {
    if cx.info.is_unordered(entry.events) {
      continue;
    }
    debug_assert!(entry.events != 0);
    for ty in counters_in(counters) {
      if (entry.events & cx.info.events_of(ty)) == event {
        entry.imm[ty] = entry.imm[ty].saturating_add(1).min(cx.info.max_cnt[ty]);
      }
    }
  }
}

/// Tracks `size` register units from `reg` as accessed by `event`.
pub fn insert_wait_entry(
  cx: &PassCx, ctx: &mut WaitCtx, reg: PhysReg, size: u8, event: u32,
  wait_on_read: bool, vmem_types: u8, mut vm_mask: u32,
) {
  let counters = cx.info.counters_for_event(event);
  let mut new_entry = WaitEntry::new(event, WaitImm::zero(counters), counters, wait_on_read);
  if counters & WaitType::Vm.bit() != 0 {
    new_entry.vmem_types |= vmem_types;
  }

  for i in 0..size as u16 {
    new_entry.vm_mask = (vm_mask & 0x3) as u8;
    match ctx.gpr_map.entry(reg.plus(i)) {
      Entry::Occupied(mut occupied) => {
        let entry = occupied.get_mut();
        entry.join(&new_entry);
        entry.logical_events |= event;
      }
      Entry::Vacant(vacant) => {
        vacant.insert(new_entry);
      }
    }
    vm_mask >>= 2;
  }
}

/// Operands are read by the access: later writes must wait, reads need not.
fn insert_operand_entry(cx: &PassCx, ctx: &mut WaitCtx, op: &Operand, event: u32) {
  if let Operand::Reg { reg, size } = *op {
    insert_wait_entry(cx, ctx, reg, size, event, false, 0, 0);
  }
}

fn insert_def_entry(
  cx: &PassCx, ctx: &mut WaitCtx, instr: &Instruction, idx: usize, event: u32,
  vmem_types: u8, vm_mask: u32,
) {
  let def = instr.definitions.get(idx).unwrap_or_else(|| {
    panic!("{} is missing definition {}", instr.opcode.name(), idx)
  });
  insert_wait_entry(cx, ctx, def.reg, def.size, event, true, vmem_types, vm_mask);
}

/// Records the asynchronous operations started by `instr`.
pub fn gen(cx: &PassCx, ctx: &mut WaitCtx, instr: &Instruction) {
  let none = MemorySyncInfo::default();
  match &instr.kind {
    InstrKind::Exp(exp) => {
      let event = export_event(exp.dest);
      update_counters(cx, ctx, event, Some(instr), none);

      for i in 0..4 {
        if exp.enabled_mask & (1 << i) != 0 {
          let idx = if exp.compressed { i >> 1 } else { i };
          assert!(idx < instr.operands.len(), "export data operand {} missing", idx);
          insert_operand_entry(cx, ctx, &instr.operands[idx], event);
        }
      }
      insert_wait_entry(cx, ctx, PhysReg::EXEC, 2, event, false, 0, 0);
    }
    InstrKind::Flat(flat) if instr.format() == Format::Flat => {
      let vmem_event = get_vmem_event(cx, instr, VMEM_NOSAMPLER);
      update_counters(cx, ctx, vmem_event, Some(instr), flat.sync);
      update_counters(cx, ctx, EVENT_LDS, Some(instr), flat.sync);

      if !instr.definitions.is_empty() {
        let mask = get_vmem_mask(cx, instr);
        insert_def_entry(cx, ctx, instr, 0, vmem_event, 0, mask);
        if flat.may_use_lds {
          insert_def_entry(cx, ctx, instr, 0, EVENT_LDS, 0, 0);
          if cx.gfx_level() < GfxLevel::Gfx10 {
            ctx.pending_flat_lgkm = true;
            ctx.pending_flat_vm = true;
          }
        }
      }
    }
    InstrKind::Smem(sync) => {
      update_counters(cx, ctx, EVENT_SMEM, Some(instr), *sync);
      if !instr.definitions.is_empty() {
        insert_def_entry(cx, ctx, instr, 0, EVENT_SMEM, 0, 0);
      }
    }
    InstrKind::Ds(ds) => {
      let event = if ds.gds { EVENT_GDS } else { EVENT_LDS };
      update_counters(cx, ctx, event, Some(instr), ds.sync);
      if ds.gds {
        update_counters(cx, ctx, EVENT_GDS_GPR_LOCK, Some(instr), none);
      }

      for idx in 0..instr.definitions.len() {
        insert_def_entry(cx, ctx, instr, idx, event, 0, 0);
      }

      if ds.gds {
        for op in &instr.operands {
          insert_operand_entry(cx, ctx, op, EVENT_GDS_GPR_LOCK);
        }
        insert_wait_entry(cx, ctx, PhysReg::EXEC, 2, EVENT_GDS_GPR_LOCK, false, 0, 0);
      }
    }
    InstrKind::LdsDir(sync) => {
      update_counters(cx, ctx, EVENT_LDSDIR, Some(instr), *sync);
      insert_def_entry(cx, ctx, instr, 0, EVENT_LDSDIR, 0, 0);
    }
    InstrKind::Flat(_) | InstrKind::Vmem(_) => {
      let ty = instr.vmem_type(cx.gfx_level());
      let event = get_vmem_event(cx, instr, ty);
      let mask = if event == EVENT_VMEM { get_vmem_mask(cx, instr) } else { 0 };

      update_counters(cx, ctx, event, Some(instr), instr.sync_info());

      for idx in 0..instr.definitions.len() {
        insert_def_entry(cx, ctx, instr, idx, event, ty, mask);
      }

      // GFX6 keeps reading the store data (or image address) operand after
      // the instruction issued.
      if cx.gfx_level() == GfxLevel::Gfx6 {
        let locked = if instr.format() != Format::Mimg && instr.operands.len() == 4 {
          Some(3)
        } else if instr.format() == Format::Mimg
          && instr.operands.get(2).map_or(false, |op| !op.is_undefined())
        {
          Some(2)
        } else {
          None
        };
        if let Some(idx) = locked {
          update_counters(cx, ctx, EVENT_VMEM_GPR_LOCK, Some(instr), none);
          insert_operand_entry(cx, ctx, &instr.operands[idx], EVENT_VMEM_GPR_LOCK);
        }
      }
    }
    InstrKind::Sopp { .. }
      if matches!(instr.opcode, Opcode::SSendmsg | Opcode::SSendmsghalt) =>
    {
      update_counters(cx, ctx, EVENT_SENDMSG, Some(instr), none);
    }
    InstrKind::Salu
      if matches!(instr.opcode, Opcode::SSendmsgRtnB32 | Opcode::SSendmsgRtnB64) =>
    {
      update_counters(cx, ctx, EVENT_SENDMSG_RTN, Some(instr), none);
      insert_def_entry(cx, ctx, instr, 0, EVENT_SENDMSG_RTN, 0, 0);
    }
    _ => {}
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ir::{Definition, ExpInfo, FlatInfo, STORAGE_BUFFER};

  fn with_cx<R>(gfx_level: GfxLevel, f: impl FnOnce(&PassCx) -> R) -> R {
    let config = ProgramConfig::new(gfx_level);
    let info = TargetInfo::new(gfx_level);
    f(&PassCx { config: &config, info: &info, force_waitcnt: false })
  }

  fn v(n: u16) -> PhysReg {
    PhysReg::vgpr(n)
  }

  fn load(dst: u16) -> Instruction {
    Instruction::vmem(
      Opcode::BufferLoadDword,
      &[Definition::new(v(dst), 1)],
      &[Operand::reg(PhysReg::sgpr(0), 4), Operand::reg(v(10), 1), Operand::Constant(0)],
      MemorySyncInfo::storage(STORAGE_BUFFER),
    )
  }

  fn use_of(src: u16) -> Instruction {
    Instruction::valu(Opcode::VMovB32, &[Definition::new(v(20), 1)], &[Operand::reg(v(src), 1)])
  }

  fn needed(cx: &PassCx, ctx: &mut WaitCtx, instr: &Instruction) -> WaitImm {
    let mut imm = WaitImm::new();
    let mut depctr = DepctrWait::new();
    kill(cx, ctx, &mut imm, &mut depctr, instr, instr.sync_info());
    imm
  }

  #[test]
  fn loads_count_in_issue_order() {
    with_cx(GfxLevel::Gfx10, |cx| {
      let mut ctx = WaitCtx::new();
      gen(cx, &mut ctx, &load(0));
      gen(cx, &mut ctx, &load(1));
      assert_eq!(ctx.gpr_map[&v(0)].imm[WaitType::Vm], 1);
      assert_eq!(ctx.gpr_map[&v(1)].imm[WaitType::Vm], 0);

      // The older load completes first, so reading it leaves the younger
      // one in flight. A single vm=0 wait at the first read would also be
      // safe, but it would stall longer.
      let imm = needed(cx, &mut ctx, &use_of(0));
      assert_eq!(imm, WaitImm::single(WaitType::Vm, 1));
      assert!(!ctx.gpr_map.contains_key(&v(0)));
      assert!(ctx.gpr_map.contains_key(&v(1)));

      let imm = needed(cx, &mut ctx, &use_of(1));
      assert_eq!(imm, WaitImm::single(WaitType::Vm, 0));
      assert!(ctx.gpr_map.is_empty());
      assert_eq!(ctx.nonzero & WaitType::Vm.bit(), 0);
    })
  }

  #[test]
  fn issue_counts_stop_at_the_counter_maximum() {
    with_cx(GfxLevel::Gfx10, |cx| {
      let mut ctx = WaitCtx::new();
      gen(cx, &mut ctx, &load(0));
      ctx.gpr_map.get_mut(&v(0)).unwrap().imm[WaitType::Vm] = u16::MAX;
      gen(cx, &mut ctx, &load(1));
      assert_eq!(ctx.gpr_map[&v(0)].imm[WaitType::Vm], cx.info.max_cnt[WaitType::Vm]);
    })
  }

  #[test]
  fn same_type_loads_do_not_wait_for_each_other() {
    with_cx(GfxLevel::Gfx10, |cx| {
      let mut ctx = WaitCtx::new();
      gen(cx, &mut ctx, &load(0));
      // Overwriting a pending load destination with a load of the same
      // type is ordered by the hardware.
      assert!(needed(cx, &mut ctx, &load(0)).is_empty());
    });
    with_cx(GfxLevel::Gfx12, |cx| {
      let mut ctx = WaitCtx::new();
      gen(cx, &mut ctx, &load(0));
      assert_eq!(needed(cx, &mut ctx, &load(0)), WaitImm::single(WaitType::Vm, 0));
    });
  }

  #[test]
  fn d16_halves_are_independent() {
    with_cx(GfxLevel::Gfx12, |cx| {
      let lo = Instruction::flat(
        Opcode::GlobalLoadShortD16,
        &[Definition::new(v(0), 1)],
        &[Operand::reg(v(4), 2), Operand::Undefined],
        FlatInfo::default(),
      );
      let hi = Instruction::flat(
        Opcode::GlobalLoadShortD16Hi,
        &[Definition::new(v(0), 1)],
        &[Operand::reg(v(4), 2), Operand::Undefined],
        FlatInfo::default(),
      );
      let mut ctx = WaitCtx::new();
      gen(cx, &mut ctx, &lo);
      assert!(needed(cx, &mut ctx, &hi).is_empty());
      gen(cx, &mut ctx, &hi);
      assert_eq!(ctx.gpr_map[&v(0)].vm_mask, 0x3);
      assert_eq!(needed(cx, &mut ctx, &lo), WaitImm::single(WaitType::Vm, 0));
    })
  }

  #[test]
  fn scalar_loads_are_unordered() {
    with_cx(GfxLevel::Gfx9, |cx| {
      let smem = |dst: u16| {
        Instruction::smem(
          Opcode::SLoadDword,
          &[Definition::new(PhysReg::sgpr(dst), 1)],
          &[Operand::reg(PhysReg::sgpr(0), 2), Operand::Constant(0)],
          MemorySyncInfo::default(),
        )
      };
      let mut ctx = WaitCtx::new();
      gen(cx, &mut ctx, &smem(4));
      gen(cx, &mut ctx, &smem(5));
      assert_eq!(ctx.gpr_map[&PhysReg::sgpr(4)].imm[WaitType::Lgkm], 0);
      let read = Instruction::salu(
        Opcode::SMovB32,
        &[Definition::new(PhysReg::sgpr(8), 1)],
        &[Operand::reg(PhysReg::sgpr(4), 1)],
      );
      assert_eq!(needed(cx, &mut ctx, &read), WaitImm::single(WaitType::Lgkm, 0));
      assert!(ctx.gpr_map.is_empty());
    })
  }

  #[test]
  fn exports_block_writes_of_their_data() {
    with_cx(GfxLevel::Gfx10, |cx| {
      let exp = Instruction::exp(
        &[Operand::reg(v(0), 1), Operand::reg(v(1), 1), Operand::Undefined, Operand::Undefined],
        ExpInfo { dest: EXP_POS, enabled_mask: 0x3, compressed: false },
      );
      let mut ctx = WaitCtx::new();
      gen(cx, &mut ctx, &exp);
      assert!(ctx.gpr_map.contains_key(&PhysReg::EXEC));
      // Reading is fine, overwriting is not.
      assert!(needed(cx, &mut ctx, &use_of(1)).is_empty());
      let overwrite =
        Instruction::valu(Opcode::VMovB32, &[Definition::new(v(1), 1)], &[Operand::Constant(0)]);
      assert_eq!(needed(cx, &mut ctx, &overwrite), WaitImm::single(WaitType::Exp, 0));
    })
  }

  #[test]
  #[should_panic(expected = "invalid export destination")]
  fn unclassifiable_export_panics() {
    export_event(18);
  }

  #[test]
  fn export_classes() {
    assert_eq!(export_event(0), EVENT_EXP_MRT_NULL);
    assert_eq!(export_event(EXP_NULL), EVENT_EXP_MRT_NULL);
    assert_eq!(export_event(EXP_POS + 4), EVENT_EXP_POS);
    assert_eq!(export_event(EXP_PRIM), EVENT_EXP_PRIM);
    assert_eq!(export_event(22), EVENT_EXP_DUAL_SRC_BLEND);
    assert_eq!(export_event(EXP_PARAM + 3), EVENT_EXP_PARAM);
  }

  #[test]
  fn flat_lds_access_forces_full_drains_before_gfx10() {
    with_cx(GfxLevel::Gfx9, |cx| {
      let flat = |dst: u16| {
        Instruction::flat(
          Opcode::FlatLoadDword,
          &[Definition::new(v(dst), 1)],
          &[Operand::reg(v(8), 2)],
          FlatInfo { sync: MemorySyncInfo::default(), may_use_lds: true },
        )
      };
      let mut ctx = WaitCtx::new();
      gen(cx, &mut ctx, &load(0));
      gen(cx, &mut ctx, &flat(1));
      assert!(ctx.pending_flat_vm && ctx.pending_flat_lgkm);
      let imm = needed(cx, &mut ctx, &use_of(0));
      assert_eq!(imm[WaitType::Vm], 0);
      assert!(!ctx.pending_flat_vm);
      assert!(ctx.pending_flat_lgkm);
    })
  }

  #[test]
  fn gds_locks_operands_and_exec() {
    with_cx(GfxLevel::Gfx9, |cx| {
      let gds = Instruction::ds(
        Opcode::DsAddRtnU32,
        &[Definition::new(v(0), 1)],
        &[Operand::reg(v(1), 1), Operand::reg(v(2), 1)],
        crate::ir::DsInfo { gds: true, ..Default::default() },
      );
      let mut ctx = WaitCtx::new();
      gen(cx, &mut ctx, &gds);
      assert_eq!(ctx.gpr_map[&v(1)].events, EVENT_GDS_GPR_LOCK);
      assert!(!ctx.gpr_map[&v(1)].wait_on_read);
      assert!(ctx.gpr_map[&PhysReg::EXEC].events & EVENT_GDS_GPR_LOCK != 0);
      assert_eq!(ctx.gpr_map[&v(0)].events, EVENT_GDS);
      let write_exec =
        Instruction::salu(Opcode::SMovB64, &[Definition::new(PhysReg::EXEC, 2)], &[Operand::Constant(0)]);
      assert_eq!(needed(cx, &mut ctx, &write_exec), WaitImm::single(WaitType::Exp, 0));
    })
  }

  #[test]
  fn release_then_atomic_waits_for_prior_stores() {
    with_cx(GfxLevel::Gfx10, |cx| {
      let store = Instruction::vmem(
        Opcode::BufferStoreDword,
        &[],
        &[Operand::reg(PhysReg::sgpr(0), 4), Operand::reg(v(10), 1), Operand::Constant(0), Operand::reg(v(0), 1)],
        MemorySyncInfo::storage(STORAGE_BUFFER),
      );
      let mut ctx = WaitCtx::new();
      gen(cx, &mut ctx, &store);
      assert_eq!(ctx.bar(BarrierKind::ReleaseDep).imm[0], WaitImm::single(WaitType::Vs, 0));

      let release = Instruction::barrier(
        MemorySyncInfo::new(STORAGE_BUFFER, SEMANTIC_RELEASE, SyncScope::Device),
        SyncScope::Invocation,
      );
      assert!(needed(cx, &mut ctx, &release).is_empty());
      assert!(ctx.bar_nonempty & BarrierKind::Release.bit() != 0);

      let atomic = Instruction::vmem(
        Opcode::BufferAtomicAdd,
        &[],
        &[Operand::reg(PhysReg::sgpr(0), 4), Operand::reg(v(10), 1), Operand::Constant(0), Operand::reg(v(1), 1)],
        MemorySyncInfo::new(STORAGE_BUFFER, SEMANTIC_ATOMIC, SyncScope::Device),
      );
      assert_eq!(needed(cx, &mut ctx, &atomic), WaitImm::single(WaitType::Vs, 0));
      assert_eq!(ctx.bar_nonempty & BarrierKind::Release.bit(), 0);
    })
  }

  #[test]
  fn workgroup_barrier_on_one_wave_is_free() {
    with_cx(GfxLevel::Gfx10, |cx| {
      let mut ctx = WaitCtx::new();
      gen(cx, &mut ctx, &load(0));
      let barrier = Instruction::barrier(
        MemorySyncInfo::new(STORAGE_BUFFER, SEMANTIC_RELEASE, SyncScope::Workgroup),
        SyncScope::Workgroup,
      );
      assert!(needed(cx, &mut ctx, &barrier).is_empty());
      assert_eq!(ctx.bar_nonempty & BarrierKind::Release.bit(), 0);
    })
  }
}
