//! The fixed-point iteration over the CFG.
//!
//! Blocks are visited in layout order (reverse postorder).  Reaching a loop
//! exit jumps back to the loop header as long as some block inside the loop
//! changed since the header was last entered; blocks whose joined entry
//! context did not change since their last rewrite are skipped.

use log::debug;

use crate::block::handle_block;
use crate::context::WaitCtx;
use crate::ir::{
  MemorySyncInfo, Program, BLOCK_KIND_DISCARD_EARLY_EXIT, BLOCK_KIND_LOOP_EXIT,
  BLOCK_KIND_LOOP_HEADER, STORAGE_SHARED, VMEM_NOSAMPLER,
};
use crate::target::{TargetInfo, EVENT_LDS, EVENT_VMEM};
use crate::update::{insert_wait_entry, update_barriers, update_counters, PassCx};

/// The contexts at the end of the iteration.
pub struct Solution {
  pub in_ctx: Vec<WaitCtx>,
  pub out_ctx: Vec<WaitCtx>,
  pub num_block_visits: usize,
}

/// Whether the join of a block's predecessors should take register entries
/// from the logical predecessors: true for a divergent merge, where some
/// linear predecessor carries no lanes of its own.
fn is_logical_merge(linear_preds: &[u32], logical_preds: &[u32]) -> bool {
  logical_preds.len() > 1 && linear_preds.iter().any(|pred| !logical_preds.contains(pred))
}

/// Accesses still in flight when the program starts.
fn seed_entry_context(cx: &PassCx, program: &Program, ctx: &mut WaitCtx) {
  if program.pending_lds_access {
    update_barriers(
      cx,
      ctx,
      cx.info.counters_for_event(EVENT_LDS),
      EVENT_LDS,
      None,
      MemorySyncInfo::storage(STORAGE_SHARED),
    );
  }

  for def in &program.args_pending_vmem {
    update_counters(cx, ctx, EVENT_VMEM, None, MemorySyncInfo::default());
    insert_wait_entry(cx, ctx, def.reg, def.size, EVENT_VMEM, true, VMEM_NOSAMPLER, 0xffff_ffff);
  }
}

/// Computes the contexts at every block boundary and rewrites every block
/// (except discard early exits) with the waits it needs.
pub fn solve(program: &mut Program, force_waitcnt: bool) -> Solution {
  let config = program.config;
  let info = TargetInfo::new(config.gfx_level);
  let cx = PassCx { config: &config, info: &info, force_waitcnt };

  let num_blocks = program.blocks.len();
  let mut done = vec![false; num_blocks];
  let mut in_ctx = vec![WaitCtx::new(); num_blocks];
  let mut out_ctx = vec![WaitCtx::new(); num_blocks];

  let mut loop_header_indices: Vec<usize> = Vec::new();
  // The outermost loop depth at which some block changed since its header
  // was entered.
  let mut loop_progress = 0usize;
  let mut num_block_visits = 0;

  if num_blocks > 0 {
    seed_entry_context(&cx, program, &mut in_ctx[0]);
  }

  let mut i = 0;
  while i < num_blocks {
    let idx = i;
    i += 1;
    let current = &mut program.blocks[idx];
    debug_assert_eq!(current.index as usize, idx);

    // The jump to a discard early exit may happen anywhere in a block, so
    // it cannot be joined like this.  Waits are emitted along with the
    // discard itself.
    if current.kind & BLOCK_KIND_DISCARD_EARLY_EXIT != 0 {
      continue;
    }

    if current.kind & BLOCK_KIND_LOOP_HEADER != 0 {
      loop_header_indices.push(idx);
    } else if current.kind & BLOCK_KIND_LOOP_EXIT != 0 {
      let header = loop_header_indices
        .pop()
        .unwrap_or_else(|| panic!("loop exit block {} outside of any loop", idx));
      let repeat = loop_progress == loop_header_indices.len() + 1;
      loop_progress = loop_progress.min(loop_header_indices.len());
      if repeat {
        debug!("block {}: repeating loop from header {}", idx, header);
        i = header;
        continue;
      }
    }

    num_block_visits += 1;

    let mut ctx = in_ctx[idx].clone();
    let logical_merge = is_logical_merge(&current.linear_preds, &current.logical_preds);
    let mut changed = false;
    for &pred in &current.linear_preds {
      changed |= ctx.join(&out_ctx[pred as usize], false, logical_merge);
    }
    for &pred in &current.logical_preds {
      changed |= ctx.join(&out_ctx[pred as usize], true, logical_merge);
    }

    if done[idx] && !changed {
      debug!("block {}: unchanged", idx);
      in_ctx[idx] = ctx;
      continue;
    }
    in_ctx[idx] = ctx.clone();

    loop_progress = loop_progress.max(current.loop_nest_depth as usize);
    done[idx] = true;

    debug!("block {}: rewriting, {} entries live", idx, ctx.gpr_map.len());
    handle_block(&cx, current, &mut ctx);
    out_ctx[idx] = ctx;
  }

  debug!("{} blocks, {} visits", num_blocks, num_block_visits);

  Solution { in_ctx, out_ctx, num_block_visits }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ir::{
    Block, Definition, GfxLevel, InstrKind, Instruction, Opcode, Operand,
    PhysReg, ProgramConfig, STORAGE_BUFFER,
  };
  use crate::wait_imm::{WaitImm, WaitType};

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

  fn use_of(reg: PhysReg) -> Instruction {
    Instruction::valu(Opcode::VMovB32, &[Definition::new(v(20), 1)], &[Operand::reg(reg, 1)])
  }

  /// Appends a block whose linear and logical predecessors are `preds`.
  fn block(program: &mut Program, kind: u16, preds: &[u32], depth: u32, instrs: Vec<Instruction>) {
    let mut block = Block::new(program.blocks.len() as u32, kind);
    block.linear_preds = preds.iter().copied().collect();
    block.logical_preds = preds.iter().copied().collect();
    block.loop_nest_depth = depth;
    block.instructions = instrs;
    program.blocks.push(block);
  }

  fn waits(block: &Block) -> Vec<WaitImm> {
    block
      .instructions
      .iter()
      .filter_map(|instr| match instr.kind {
        InstrKind::Waitcnt(imm) => Some(imm),
        _ => None,
      })
      .collect()
  }

  fn assert_fixed_point(program: &Program, solution: &Solution) {
    for block in &program.blocks {
      if block.kind & BLOCK_KIND_DISCARD_EARLY_EXIT != 0 {
        continue;
      }
      let idx = block.index as usize;
      let merge = is_logical_merge(&block.linear_preds, &block.logical_preds);
      let mut ctx = solution.in_ctx[idx].clone();
      for &pred in &block.linear_preds {
        assert!(!ctx.join(&solution.out_ctx[pred as usize], false, merge), "block {}", idx);
      }
      for &pred in &block.logical_preds {
        assert!(!ctx.join(&solution.out_ctx[pred as usize], true, merge), "block {}", idx);
      }
    }
  }

  #[test]
  fn waits_flow_across_blocks() {
    let mut program = Program::new(ProgramConfig::new(GfxLevel::Gfx10));
    block(&mut program, 0, &[], 0, vec![load(0)]);
    block(&mut program, 0, &[0], 0, vec![use_of(v(0))]);
    let solution = solve(&mut program, false);
    assert!(waits(&program.blocks[0]).is_empty());
    assert_eq!(waits(&program.blocks[1]), vec![WaitImm::single(WaitType::Vm, 0)]);
    assert_eq!(solution.num_block_visits, 2);
    assert!(solution.out_ctx[1].gpr_map.is_empty());
  }

  #[test]
  fn loop_back_edge_is_followed() {
    let mut program = Program::new(ProgramConfig::new(GfxLevel::Gfx10));
    block(&mut program, 0, &[], 0, vec![]);
    block(&mut program, BLOCK_KIND_LOOP_HEADER, &[0, 2], 1, vec![use_of(v(2))]);
    block(&mut program, 0, &[1], 1, vec![load(2)]);
    block(&mut program, BLOCK_KIND_LOOP_EXIT, &[2], 0, vec![]);
    let solution = solve(&mut program, false);

    // The load at the end of the body reaches the header's next iteration.
    assert_eq!(waits(&program.blocks[1]), vec![WaitImm::single(WaitType::Vm, 0)]);
    assert!(waits(&program.blocks[2]).is_empty());
    assert_fixed_point(&program, &solution);
    assert!(solution.num_block_visits <= 3 * program.blocks.len());
  }

  #[test]
  fn nested_loops_terminate() {
    let mut program = Program::new(ProgramConfig::new(GfxLevel::Gfx10));
    block(&mut program, 0, &[], 0, vec![load(0)]);
    block(&mut program, BLOCK_KIND_LOOP_HEADER, &[0, 5], 1, vec![use_of(v(1))]);
    block(&mut program, BLOCK_KIND_LOOP_HEADER, &[1, 3], 2, vec![use_of(v(2))]);
    block(&mut program, 0, &[2], 2, vec![load(2), load(3)]);
    block(&mut program, BLOCK_KIND_LOOP_EXIT, &[3], 1, vec![use_of(v(0)), load(1)]);
    block(&mut program, 0, &[4], 1, vec![use_of(v(3))]);
    block(&mut program, BLOCK_KIND_LOOP_EXIT, &[5], 0, vec![use_of(v(1))]);
    let solution = solve(&mut program, false);

    assert_fixed_point(&program, &solution);
    let num_blocks = program.blocks.len();
    assert!(solution.num_block_visits <= num_blocks * num_blocks);
    // v2 comes around the inner back edge one load ahead of v3, v1 around
    // the outer one.
    assert_eq!(waits(&program.blocks[2]), vec![WaitImm::single(WaitType::Vm, 1)]);
    assert_eq!(waits(&program.blocks[1]), vec![WaitImm::single(WaitType::Vm, 0)]);
  }

  #[test]
  fn linear_only_blocks_see_scalar_but_not_vector_entries() {
    let mut program = Program::new(ProgramConfig::new(GfxLevel::Gfx10));
    let smem = Instruction::smem(
      Opcode::SLoadDword,
      &[Definition::new(PhysReg::sgpr(4), 1)],
      &[Operand::reg(PhysReg::sgpr(0), 2), Operand::Constant(0)],
      MemorySyncInfo::default(),
    );
    block(&mut program, 0, &[], 0, vec![load(0), smem]);
    let mut linear_only = Block::new(1, 0);
    linear_only.linear_preds.push(0);
    linear_only.instructions = vec![
      use_of(v(0)),
      Instruction::salu(
        Opcode::SMovB32,
        &[Definition::new(PhysReg::sgpr(8), 1)],
        &[Operand::reg(PhysReg::sgpr(4), 1)],
      ),
    ];
    program.blocks.push(linear_only);
    solve(&mut program, false);

    // No lanes reach this block with the load pending.
    let instrs = &program.blocks[1].instructions;
    assert_eq!(instrs.len(), 3);
    assert_eq!(instrs[0].opcode, Opcode::VMovB32);
    assert_eq!(instrs[1].kind, InstrKind::Waitcnt(WaitImm::single(WaitType::Lgkm, 0)));
  }

  #[test]
  fn pending_arguments_seed_the_entry() {
    let mut program = Program::new(ProgramConfig::new(GfxLevel::Gfx10));
    program.args_pending_vmem.push(Definition::new(v(0), 2));
    program.pending_lds_access = true;
    block(&mut program, 0, &[], 0, vec![use_of(v(1))]);
    let solution = solve(&mut program, false);

    assert_eq!(waits(&program.blocks[0]), vec![WaitImm::single(WaitType::Vm, 0)]);
    let entry = &solution.in_ctx[0];
    assert_eq!(entry.gpr_map.len(), 2);
    assert!(entry.bar_nonempty != 0);
  }

  #[test]
  fn discard_early_exit_is_left_alone() {
    let mut program = Program::new(ProgramConfig::new(GfxLevel::Gfx10));
    block(&mut program, 0, &[], 0, vec![load(0)]);
    block(&mut program, BLOCK_KIND_DISCARD_EARLY_EXIT, &[0], 0, vec![use_of(v(0))]);
    let solution = solve(&mut program, false);
    assert_eq!(program.blocks[1].instructions.len(), 1);
    assert_eq!(solution.num_block_visits, 1);
  }
}
