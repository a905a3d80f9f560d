//! Rewriting one block: fold the existing wait directives, compute the
//! waits each instruction needs and emit them right before it.

use log::trace;

use crate::context::{BarrierKind, WaitCtx};
use crate::ir::{
  storage_index, Block, GfxLevel, InstrKind, Instruction, Opcode,
  BLOCK_KIND_END_WITH_REGS, NUM_REG_UNITS, SEMANTIC_ACQUIRE,
  SENDMSG_DEALLOC_VGPRS, STORAGE_GDS, STORAGE_SCRATCH, STORAGE_VGPR_SPILL,
};
use crate::target::EVENTS_EXP;
use crate::update::{force_waitcnt, gen, kill, setup_barrier, PassCx};
use crate::wait_imm::{DepctrWait, WaitImm, WaitType};

//=============================================================================
// Clauses

/// Whether `b` may issue back-to-back with `a` in a memory clause.
pub fn should_form_clause(a: &Instruction, b: &Instruction) -> bool {
  if a.definitions.is_empty() != b.definitions.is_empty() {
    return false;
  }
  if a.format() != b.format() {
    return false;
  }
  if a.operands.is_empty() || b.operands.is_empty() {
    return false;
  }

  // Loads without a descriptor may well hit nearby addresses.
  if a.is_flat_like() || a.accesses_lds() {
    return true;
  }
  if a.is_smem() && a.operands[0].size() == 2 && b.operands[0].size() == 2 {
    return true;
  }
  // So may loads through the same descriptor.
  if a.is_vmem() || a.is_smem() {
    return a.operands[0] == b.operands[0];
  }
  false
}

/// One bit per register unit.
struct RegSet([u64; NUM_REG_UNITS / 64]);

impl RegSet {
  fn new() -> Self {
    RegSet([0; NUM_REG_UNITS / 64])
  }

  fn contains(&self, unit: u16) -> bool {
    self.0[unit as usize / 64] & (1 << (unit % 64)) != 0
  }

  fn insert(&mut self, unit: u16) {
    self.0[unit as usize / 64] |= 1 << (unit % 64);
  }

  /// Returns false if `instr` reads a register written earlier in the
  /// clause, then adds its definitions.
  fn check_clause_raw(&mut self, instr: &Instruction) -> bool {
    for op in &instr.operands {
      if op.units().any(|reg| self.contains(reg.reg())) {
        return false;
      }
    }
    for def in &instr.definitions {
      for reg in def.units() {
        self.insert(reg.reg());
      }
    }
    true
  }
}

//=============================================================================
// Emission

fn emit_waitcnt(out: &mut Vec<Instruction>, imm: &mut WaitImm) {
  trace!("    emit s_waitcnt {}", imm);
  out.push(Instruction::waitcnt(*imm));
  *imm = WaitImm::new();
}

fn emit_depctr(out: &mut Vec<Instruction>, depctr: &mut DepctrWait) {
  trace!("    emit s_waitcnt_depctr {}", depctr);
  out.push(Instruction::depctr(*depctr));
  *depctr = DepctrWait::new();
}

/// Releases the VGPRs before the end of the program, so that waves waiting
/// for registers can launch while outstanding stores drain.  The message
/// absorbs the wait queued for `s_endpgm`, so that a second run over its
/// own output reproduces it.
fn deallocate_vgprs(
  cx: &PassCx, ctx: &WaitCtx, queued: &mut WaitImm, out: &mut Vec<Instruction>,
) {
  if cx.gfx_level() < GfxLevel::Gfx11 {
    return;
  }

  // Without register pressure new waves are unlikely to be waiting.
  let config = cx.config;
  let max_waves_limit = config.physical_vgprs / config.max_waves_per_simd.max(1);
  if config.num_vgprs <= max_waves_limit {
    return;
  }

  // The message waits for every counter except stores.
  if ctx.nonzero & WaitType::Vs.bit() == 0 {
    return;
  }

  // Exports take about as long as the stores; skip the message traffic.
  if ctx.gpr_map.values().any(|entry| entry.events & EVENTS_EXP != 0) {
    return;
  }

  // Scratch is released as well, so scratch stores must finish first.
  let bar = ctx.bar(BarrierKind::ReleaseDep);
  let mut imm = WaitImm::new();
  imm.combine(&bar.imm[storage_index(STORAGE_SCRATCH)]);
  imm.combine(&bar.imm[storage_index(STORAGE_VGPR_SPILL)]);
  imm.combine(queued);

  if imm[WaitType::Vs] == 0 {
    return;
  }

  *queued = WaitImm::new();
  if !imm.is_empty() {
    emit_waitcnt(out, &mut imm);
  }
  trace!("    emit s_sendmsg dealloc_vgprs");
  out.push(Instruction::sopp(Opcode::SSendmsg, SENDMSG_DEALLOC_VGPRS));
}

fn is_vgpr_dealloc(cx: &PassCx, instr: &Instruction) -> bool {
  cx.gfx_level() >= GfxLevel::Gfx11
    && instr.opcode == Opcode::SSendmsg
    && instr.sopp_imm() == Some(SENDMSG_DEALLOC_VGPRS)
}

//=============================================================================
// The block walk

/// Rewrites `block` given the context at its entry.  On return `ctx` holds
/// the context at its exit.
pub fn handle_block(cx: &PassCx, block: &mut Block, ctx: &mut WaitCtx) {
  let mut pending = std::mem::take(&mut block.instructions);
  pending.reverse();
  let mut new_instructions = Vec::with_capacity(pending.len() + 4);

  let mut queued_imm = WaitImm::new();
  let mut queued_depctr = DepctrWait::new();

  // Instructions after the current one that are still part of the clause
  // it belongs to.
  let mut clause_left = 0usize;

  while let Some(mut instr) = pending.pop() {
    let in_clause = clause_left > 0;
    clause_left = clause_left.saturating_sub(1);

    let is_wait = match &instr.kind {
      InstrKind::Waitcnt(imm) => {
        queued_imm.combine(imm);
        true
      }
      InstrKind::Depctr(wait) => {
        queued_depctr.combine(wait);
        true
      }
      _ => false,
    };

    // Only this pass emits the release message, right before s_endpgm.
    // Drop an existing one and derive it again.
    if is_vgpr_dealloc(cx, &instr) {
      trace!("    drop existing s_sendmsg dealloc_vgprs");
      continue;
    }

    let sync = instr.sync_info();
    kill(cx, ctx, &mut queued_imm, &mut queued_depctr, &instr, sync);

    // At the start of a possible clause, also wait for what the rest of
    // the clause needs so the clause is not split.  LDS clauses have no
    // cache benefit.
    if (!in_clause || !queued_imm.is_empty()) && !instr.is_ds() {
      clause_left = 0;
      let mut regs_written: Option<RegSet> = None;
      for next in pending.iter().rev() {
        if !should_form_clause(&instr, next) {
          break;
        }
        let written = regs_written.get_or_insert_with(|| {
          let mut set = RegSet::new();
          set.check_clause_raw(&instr);
          set
        });
        if !written.check_clause_raw(next) {
          break;
        }
        kill(cx, ctx, &mut queued_imm, &mut queued_depctr, next, next.sync_info());
        clause_left += 1;
      }
    }

    if instr.opcode == Opcode::SEndpgm {
      deallocate_vgprs(cx, ctx, &mut queued_imm, &mut new_instructions);
    }

    gen(cx, ctx, &instr);

    if instr.is_barrier() || is_wait {
      continue;
    }

    if let InstrKind::VinterpInreg { wait_exp } = &mut instr.kind {
      if queued_imm.is_set(WaitType::Exp) {
        *wait_exp = (*wait_exp as u16).min(queued_imm[WaitType::Exp]) as u8;
        queued_imm.unset(WaitType::Exp);
      }
    }

    if !queued_imm.is_empty() {
      emit_waitcnt(&mut new_instructions, &mut queued_imm);
    }
    if !queued_depctr.is_empty() {
      emit_depctr(&mut new_instructions, &mut queued_depctr);
    }

    let is_ordered_count_acquire =
      instr.opcode == Opcode::DsOrderedCount && !instr.is_ordered_count_release();

    new_instructions.push(instr);

    if sync.semantics & SEMANTIC_ACQUIRE != 0 {
      setup_barrier(cx, ctx, sync, true);
    }

    if is_ordered_count_acquire {
      let gds = ctx.bar(BarrierKind::ReleaseDep).imm[storage_index(STORAGE_GDS)];
      queued_imm.combine(&gds);
    }
  }

  // The next shader part expects all memory operations to be done.
  if block.kind & BLOCK_KIND_END_WITH_REGS != 0 {
    force_waitcnt(ctx, &mut queued_imm);
  }

  if !queued_imm.is_empty() {
    emit_waitcnt(&mut new_instructions, &mut queued_imm);
  }
  if !queued_depctr.is_empty() {
    emit_depctr(&mut new_instructions, &mut queued_depctr);
  }

  block.instructions = new_instructions;
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ir::{
    Definition, FlatInfo, MemorySyncInfo, Operand, PhysReg, ProgramConfig,
    STORAGE_BUFFER,
  };
  use crate::target::TargetInfo;

  fn run(config: ProgramConfig, instructions: Vec<Instruction>) -> (Vec<Instruction>, WaitCtx) {
    let info = TargetInfo::new(config.gfx_level);
    let cx = PassCx { config: &config, info: &info, force_waitcnt: false };
    let mut block = Block::new(0, 0);
    block.instructions = instructions;
    let mut ctx = WaitCtx::new();
    handle_block(&cx, &mut block, &mut ctx);
    (block.instructions, ctx)
  }

  fn v(n: u16) -> PhysReg {
    PhysReg::vgpr(n)
  }

  fn buffer_load(dst: u16, addr: u16) -> Instruction {
    Instruction::vmem(
      Opcode::BufferLoadDword,
      &[Definition::new(v(dst), 1)],
      &[Operand::reg(PhysReg::sgpr(0), 4), Operand::reg(v(addr), 1), Operand::Constant(0)],
      MemorySyncInfo::storage(STORAGE_BUFFER),
    )
  }

  fn waits(instructions: &[Instruction]) -> Vec<(usize, WaitImm)> {
    instructions
      .iter()
      .enumerate()
      .filter_map(|(i, instr)| match instr.kind {
        InstrKind::Waitcnt(imm) => Some((i, imm)),
        _ => None,
      })
      .collect()
  }

  #[test]
  fn clause_members_share_one_wait() {
    let (out, _) = run(
      ProgramConfig::new(GfxLevel::Gfx10),
      vec![buffer_load(0, 10), buffer_load(1, 10), buffer_load(2, 0), buffer_load(3, 1)],
    );
    assert_eq!(waits(&out), vec![(2, WaitImm::single(WaitType::Vm, 0))]);
  }

  #[test]
  fn clause_stops_at_read_after_write() {
    let mut set = RegSet::new();
    assert!(set.check_clause_raw(&buffer_load(0, 10)));
    assert!(set.check_clause_raw(&buffer_load(1, 10)));
    assert!(!set.check_clause_raw(&buffer_load(2, 1)));
    assert!(should_form_clause(&buffer_load(0, 10), &buffer_load(1, 11)));
    let other_descriptor = Instruction::vmem(
      Opcode::BufferLoadDword,
      &[Definition::new(v(1), 1)],
      &[Operand::reg(PhysReg::sgpr(4), 4), Operand::reg(v(10), 1), Operand::Constant(0)],
      MemorySyncInfo::storage(STORAGE_BUFFER),
    );
    assert!(!should_form_clause(&buffer_load(0, 10), &other_descriptor));
  }

  #[test]
  fn existing_waits_are_folded() {
    let use_v0 =
      Instruction::valu(Opcode::VAddF32, &[Definition::new(v(5), 1)], &[Operand::reg(v(0), 1), Operand::reg(v(0), 1)]);
    let (out, ctx) = run(
      ProgramConfig::new(GfxLevel::Gfx10),
      vec![
        buffer_load(0, 10),
        Instruction::waitcnt(WaitImm::single(WaitType::Lgkm, 0)),
        Instruction::waitcnt(WaitImm::single(WaitType::Vm, 3)),
        use_v0,
      ],
    );
    // The two directives are merged with the required one into a single
    // wait right before the use.
    let mut expected = WaitImm::single(WaitType::Vm, 0);
    expected[WaitType::Lgkm] = 0;
    assert_eq!(waits(&out), vec![(1, expected)]);
    assert_eq!(out.len(), 3);
    assert!(ctx.gpr_map.is_empty());
  }

  #[test]
  fn interpolation_absorbs_export_waits() {
    let exp = Instruction::exp(
      &[Operand::reg(v(0), 1), Operand::Undefined, Operand::Undefined, Operand::Undefined],
      crate::ir::ExpInfo { dest: crate::ir::EXP_PARAM, enabled_mask: 0x1, compressed: false },
    );
    let interp = Instruction::new(
      Opcode::VInterpP10F32Inreg,
      &[Definition::new(v(0), 1)],
      &[Operand::reg(v(1), 1), Operand::reg(v(2), 1), Operand::reg(v(3), 1)],
      InstrKind::VinterpInreg { wait_exp: 7 },
    );
    let (out, _) = run(ProgramConfig::new(GfxLevel::Gfx11), vec![exp, interp]);
    assert!(waits(&out).is_empty());
    assert_eq!(out[1].kind, InstrKind::VinterpInreg { wait_exp: 0 });
  }

  #[test]
  fn end_with_regs_drains_everything() {
    let config = ProgramConfig::new(GfxLevel::Gfx10);
    let info = TargetInfo::new(config.gfx_level);
    let cx = PassCx { config: &config, info: &info, force_waitcnt: false };
    let mut block = Block::new(0, BLOCK_KIND_END_WITH_REGS);
    block.instructions = vec![buffer_load(0, 10)];
    let mut ctx = WaitCtx::new();
    handle_block(&cx, &mut block, &mut ctx);
    assert_eq!(waits(&block.instructions), vec![(1, WaitImm::single(WaitType::Vm, 0))]);
  }

  fn scratch_then_global_store() -> Vec<Instruction> {
    let store = Instruction::flat(
      Opcode::ScratchStoreDword,
      &[],
      &[Operand::reg(v(1), 1), Operand::Undefined, Operand::reg(v(0), 1)],
      FlatInfo {
        sync: MemorySyncInfo::new(
          STORAGE_SCRATCH,
          crate::ir::SEMANTIC_PRIVATE,
          crate::ir::SyncScope::Invocation,
        ),
        may_use_lds: false,
      },
    );
    let global_store = Instruction::flat(
      Opcode::GlobalStoreDword,
      &[],
      &[Operand::reg(v(2), 2), Operand::Undefined, Operand::reg(v(0), 1)],
      FlatInfo { sync: MemorySyncInfo::storage(STORAGE_BUFFER), may_use_lds: false },
    );
    vec![store, global_store, Instruction::sopp(Opcode::SEndpgm, 0)]
  }

  fn high_pressure_gfx11() -> ProgramConfig {
    let mut config = ProgramConfig::new(GfxLevel::Gfx11);
    config.num_vgprs = 256;
    config
  }

  #[test]
  fn vgprs_are_released_early_under_pressure() {
    let (out, _) = run(high_pressure_gfx11(), scratch_then_global_store());
    // The scratch store is one store behind the global one.
    assert_eq!(out.len(), 5);
    assert_eq!(out[2].kind, InstrKind::Waitcnt(WaitImm::single(WaitType::Vs, 1)));
    assert_eq!(out[3].opcode, Opcode::SSendmsg);
    assert_eq!(out[3].sopp_imm(), Some(SENDMSG_DEALLOC_VGPRS));
    assert_eq!(out[4].opcode, Opcode::SEndpgm);
  }

  #[test]
  fn release_message_is_derived_again_on_rerun() {
    let (first, _) = run(high_pressure_gfx11(), scratch_then_global_store());
    let (second, _) = run(high_pressure_gfx11(), first.clone());
    assert_eq!(second, first);
  }

  #[test]
  fn release_message_absorbs_the_final_wait() {
    // Already waiting for the scratch store, but after the message.
    let mut instructions = scratch_then_global_store();
    instructions.insert(2, Instruction::waitcnt(WaitImm::single(WaitType::Vs, 1)));
    let (out, _) = run(high_pressure_gfx11(), instructions);
    assert_eq!(out.len(), 5);
    assert_eq!(out[2].kind, InstrKind::Waitcnt(WaitImm::single(WaitType::Vs, 1)));
    assert_eq!(out[3].opcode, Opcode::SSendmsg);
  }
}
