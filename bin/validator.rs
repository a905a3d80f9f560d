//! Structural checks on input programs, so that the pass is only ever fed
//! programs it has a contract for.

use waitcnt::{
  Block, Definition, InstrKind, Instruction, Operand, PhysReg, Program,
  BLOCK_KIND_LOOP_EXIT, BLOCK_KIND_LOOP_HEADER, EXP_DUAL_SRC_BLEND_0,
  EXP_DUAL_SRC_BLEND_1, EXP_NULL, EXP_PARAM, EXP_POS, EXP_PRIM,
  NUM_REG_UNITS,
};

/// Export targets the hardware model can classify.
pub fn is_valid_export_dest(dest: u8) -> bool {
  dest <= EXP_NULL
    || (EXP_POS..=EXP_POS + 4).contains(&dest)
    || dest == EXP_PRIM
    || dest == EXP_DUAL_SRC_BLEND_0
    || dest == EXP_DUAL_SRC_BLEND_1
    || (EXP_PARAM..64).contains(&dest)
}

fn check_range(reg: PhysReg, size: u8) -> bool {
  if size == 0 || size > 32 {
    return false;
  }
  let last = reg.0 as usize + size as usize - 1;
  // A range may not straddle the scalar and vector files.
  last < NUM_REG_UNITS && reg.is_vgpr() == PhysReg(last as u16).is_vgpr()
}

fn check_operand(op: &Operand) -> bool {
  match op {
    Operand::Reg { reg, size } => check_range(*reg, *size),
    Operand::Constant(_) | Operand::Undefined => true,
  }
}

fn check_definition(def: &Definition) -> bool {
  check_range(def.reg, def.size)
}

fn check_instruction(block: &Block, i: usize, instr: &Instruction) -> Result<(), String> {
  let at = || format!("block {} instruction {} ({})", block.index, i, instr.opcode.name());

  if !instr.operands.iter().all(check_operand) {
    return Err(format!("{}: invalid operand register range", at()));
  }
  if !instr.definitions.iter().all(check_definition) {
    return Err(format!("{}: invalid definition register range", at()));
  }

  match &instr.kind {
    InstrKind::Exp(exp) => {
      if !is_valid_export_dest(exp.dest) {
        return Err(format!("{}: unknown export destination {}", at(), exp.dest));
      }
      if exp.enabled_mask > 0xf {
        return Err(format!("{}: invalid export mask {:#x}", at(), exp.enabled_mask));
      }
      let data_operands = if exp.compressed { 2 } else { 4 };
      if instr.operands.len() < data_operands {
        return Err(format!("{}: missing export data", at()));
      }
    }
    InstrKind::LdsDir(_) | InstrKind::VinterpInreg { .. } => {
      if instr.definitions.len() != 1 {
        return Err(format!("{}: expected a single definition", at()));
      }
    }
    InstrKind::Smem(_) | InstrKind::Vmem(_) | InstrKind::Flat(_) | InstrKind::Ds(_) => {
      if instr.operands.is_empty() {
        return Err(format!("{}: memory access without an address", at()));
      }
    }
    InstrKind::Waitcnt(_) | InstrKind::Depctr(_) | InstrKind::Barrier(_) => {
      if !instr.operands.is_empty() || !instr.definitions.is_empty() {
        return Err(format!("{}: unexpected operands", at()));
      }
    }
    _ => {}
  }
  Ok(())
}

fn check_preds(block: &Block, preds: &[u32], num_blocks: usize) -> Result<(), String> {
  for (i, &pred) in preds.iter().enumerate() {
    if pred as usize >= num_blocks {
      return Err(format!("block {}: predecessor {} out of range", block.index, pred));
    }
    if preds[..i].contains(&pred) {
      return Err(format!("block {}: duplicate predecessor {}", block.index, pred));
    }
    // Back edges only lead to loop headers.
    if pred >= block.index && block.kind & BLOCK_KIND_LOOP_HEADER == 0 {
      return Err(format!(
        "block {}: back edge from block {} into a block that is not a loop header",
        block.index, pred
      ));
    }
  }
  Ok(())
}

pub fn validate(program: &Program) -> Result<(), String> {
  let config = &program.config;
  if config.wave_size != 32 && config.wave_size != 64 {
    return Err(format!("invalid wave size {}", config.wave_size));
  }

  for def in &program.args_pending_vmem {
    if !def.reg.is_vgpr() || !check_definition(def) {
      return Err(format!("argument {:?} is not a vector register range", def));
    }
  }

  let num_blocks = program.blocks.len();
  let mut loop_headers: Vec<&Block> = Vec::new();

  for (idx, block) in program.blocks.iter().enumerate() {
    if block.index as usize != idx {
      return Err(format!("block at position {} has index {}", idx, block.index));
    }
    if idx == 0 && (!block.linear_preds.is_empty() || !block.logical_preds.is_empty()) {
      return Err("the entry block has predecessors".into());
    }
    if idx > 0 && block.linear_preds.is_empty() {
      return Err(format!("block {} is unreachable", idx));
    }
    check_preds(block, &block.linear_preds, num_blocks)?;
    check_preds(block, &block.logical_preds, num_blocks)?;

    // Loop structure: exits close the innermost open loop.
    if block.kind & BLOCK_KIND_LOOP_HEADER != 0 {
      if !block.linear_preds.iter().any(|&pred| pred >= block.index) {
        return Err(format!("loop header {} has no back edge", idx));
      }
      loop_headers.push(block);
    } else if block.kind & BLOCK_KIND_LOOP_EXIT != 0 {
      match loop_headers.pop() {
        None => return Err(format!("loop exit {} outside of any loop", idx)),
        Some(header) if header.loop_nest_depth != block.loop_nest_depth + 1 => {
          return Err(format!(
            "loop exit {} at depth {} closes header {} at depth {}",
            idx, block.loop_nest_depth, header.index, header.loop_nest_depth
          ));
        }
        Some(_) => {}
      }
    }
    if block.loop_nest_depth as usize != loop_headers.len() {
      return Err(format!(
        "block {} has depth {}, but is inside {} loops",
        idx,
        block.loop_nest_depth,
        loop_headers.len()
      ));
    }

    for (i, instr) in block.instructions.iter().enumerate() {
      check_instruction(block, i, instr)?;
    }
  }

  if let Some(header) = loop_headers.last() {
    return Err(format!("loop header {} is never exited", header.index));
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_framework::*;
  use waitcnt::{GfxLevel, BLOCK_KIND_TOP_LEVEL};

  fn looped(exit_depth: u32) -> Program {
    let mut b = ProgramBuilder::new(GfxLevel::Gfx10);
    b.block(BLOCK_KIND_TOP_LEVEL, &[], 0, vec![]);
    b.block(BLOCK_KIND_LOOP_HEADER, &[0, 2], 1, vec![]);
    b.block(0, &[1], 1, vec![i_branch()]);
    b.block(BLOCK_KIND_LOOP_EXIT, &[2], exit_depth, vec![i_endpgm()]);
    b.finish()
  }

  #[test]
  fn accepts_loops() {
    assert_eq!(validate(&looped(0)), Ok(()));
    assert!(validate(&looped(1)).is_err());
  }

  #[test]
  fn rejects_back_edges_into_plain_blocks() {
    let mut b = ProgramBuilder::new(GfxLevel::Gfx10);
    b.block(BLOCK_KIND_TOP_LEVEL, &[], 0, vec![]);
    b.block(0, &[0, 1], 0, vec![]);
    assert!(validate(&b.finish()).unwrap_err().contains("back edge"));
  }

  #[test]
  fn rejects_bad_exports_and_ranges() {
    assert!(is_valid_export_dest(0));
    assert!(is_valid_export_dest(EXP_POS + 1));
    assert!(!is_valid_export_dest(18));
    assert!(!is_valid_export_dest(25));

    let mut b = ProgramBuilder::new(GfxLevel::Gfx10);
    b.block(BLOCK_KIND_TOP_LEVEL, &[], 0, vec![i_exp(18, v(0))]);
    assert!(validate(&b.finish()).unwrap_err().contains("export destination"));

    let mut b = ProgramBuilder::new(GfxLevel::Gfx10);
    b.block(BLOCK_KIND_TOP_LEVEL, &[], 0, vec![i_valu(v(0), &[s(255)])]);
    let mut program = b.finish();
    program.blocks[0].instructions[0].operands[0] = r_n(s(254), 4);
    assert!(validate(&program).unwrap_err().contains("operand"));
  }
}
