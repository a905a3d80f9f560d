/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Helpers to build, run and inspect test programs.

use log::info;

use waitcnt::{
  insert_waitcnt_with_opts, Block, Definition, DsInfo, ExpInfo,
  FlatInfo, GfxLevel, InstrKind, Instruction, MemorySyncInfo, Opcode, Operand,
  PhysReg, Program, ProgramConfig, SyncScope, WaitImm, WaitType,
  WaitcntOptions, WaitcntResult,
};

use crate::validator::validate;

//=============================================================================
// Registers and operands

pub fn v(n: u16) -> PhysReg {
  PhysReg::vgpr(n)
}

pub fn s(n: u16) -> PhysReg {
  PhysReg::sgpr(n)
}

pub fn r(reg: PhysReg) -> Operand {
  Operand::reg(reg, 1)
}

pub fn r_n(reg: PhysReg, size: u8) -> Operand {
  Operand::reg(reg, size)
}

pub fn def(reg: PhysReg) -> Definition {
  Definition::new(reg, 1)
}

pub fn def_n(reg: PhysReg, size: u8) -> Definition {
  Definition::new(reg, size)
}

//=============================================================================
// Instructions

/// A vector ALU operation.
pub fn i_valu(dst: PhysReg, srcs: &[PhysReg]) -> Instruction {
  let operands: Vec<Operand> = srcs.iter().map(|reg| r(*reg)).collect();
  let opcode = if srcs.len() == 1 { Opcode::VMovB32 } else { Opcode::VAddF32 };
  Instruction::valu(opcode, &[def(dst)], &operands)
}

/// A scalar ALU operation.
pub fn i_salu(dst: PhysReg, srcs: &[PhysReg]) -> Instruction {
  let operands: Vec<Operand> = srcs.iter().map(|reg| r(*reg)).collect();
  let opcode = if srcs.len() == 1 { Opcode::SMovB32 } else { Opcode::SAddU32 };
  Instruction::salu(opcode, &[def(dst)], &operands)
}

/// A buffer load through the descriptor in `s[0:3]`.
pub fn i_buffer_load(dst: PhysReg, addr: PhysReg) -> Instruction {
  Instruction::vmem(
    Opcode::BufferLoadDword,
    &[def(dst)],
    &[r_n(s(0), 4), r(addr), Operand::Constant(0)],
    MemorySyncInfo::storage(waitcnt::STORAGE_BUFFER),
  )
}

pub fn i_buffer_store(addr: PhysReg, data: PhysReg) -> Instruction {
  Instruction::vmem(
    Opcode::BufferStoreDword,
    &[],
    &[r_n(s(0), 4), r(addr), Operand::Constant(0), r(data)],
    MemorySyncInfo::storage(waitcnt::STORAGE_BUFFER),
  )
}

pub fn i_global_load(dst: PhysReg, addr: PhysReg) -> Instruction {
  Instruction::flat(
    Opcode::GlobalLoadDword,
    &[def(dst)],
    &[r_n(addr, 2), Operand::Undefined],
    FlatInfo { sync: MemorySyncInfo::storage(waitcnt::STORAGE_BUFFER), may_use_lds: false },
  )
}

pub fn i_global_store(addr: PhysReg, data: PhysReg, sync: MemorySyncInfo) -> Instruction {
  Instruction::flat(
    Opcode::GlobalStoreDword,
    &[],
    &[r_n(addr, 2), Operand::Undefined, r(data)],
    FlatInfo { sync, may_use_lds: false },
  )
}

pub fn i_image_sample(dst: PhysReg, coord: PhysReg) -> Instruction {
  Instruction::vmem(
    Opcode::ImageSample,
    &[def_n(dst, 4)],
    &[r_n(s(8), 8), r_n(s(16), 4), Operand::Undefined, r_n(coord, 2)],
    MemorySyncInfo::storage(waitcnt::STORAGE_IMAGE),
  )
}

/// A scalar load from the 64-bit address in `base`.
pub fn i_smem_load(dst: PhysReg, base: PhysReg, offset: u32) -> Instruction {
  Instruction::smem(
    Opcode::SLoadDword,
    &[def(dst)],
    &[r_n(base, 2), Operand::Constant(offset)],
    MemorySyncInfo::storage(waitcnt::STORAGE_BUFFER),
  )
}

pub fn i_ds_read(dst: PhysReg, addr: PhysReg) -> Instruction {
  Instruction::ds(
    Opcode::DsReadB32,
    &[def(dst)],
    &[r(addr)],
    DsInfo { sync: MemorySyncInfo::storage(waitcnt::STORAGE_SHARED), ..DsInfo::default() },
  )
}

pub fn i_ds_write(addr: PhysReg, data: PhysReg) -> Instruction {
  Instruction::ds(
    Opcode::DsWriteB32,
    &[],
    &[r(addr), r(data)],
    DsInfo { sync: MemorySyncInfo::storage(waitcnt::STORAGE_SHARED), ..DsInfo::default() },
  )
}

/// Exports one component to `dest`.
pub fn i_exp(dest: u8, data: PhysReg) -> Instruction {
  Instruction::exp(
    &[r(data), Operand::Undefined, Operand::Undefined, Operand::Undefined],
    ExpInfo { dest, enabled_mask: 0x1, compressed: false },
  )
}

/// A workgroup control barrier which also orders shared and buffer memory.
pub fn i_workgroup_barrier() -> Instruction {
  Instruction::barrier(
    MemorySyncInfo::new(
      waitcnt::STORAGE_SHARED | waitcnt::STORAGE_BUFFER,
      waitcnt::SEMANTIC_ACQREL,
      SyncScope::Workgroup,
    ),
    SyncScope::Workgroup,
  )
}

pub fn i_s_barrier() -> Instruction {
  Instruction::sopp(Opcode::SBarrier, 0)
}

pub fn i_wait(counters: &[(WaitType, u16)]) -> Instruction {
  let mut imm = WaitImm::new();
  for (ty, value) in counters {
    imm[*ty] = *value;
  }
  Instruction::waitcnt(imm)
}

pub fn i_endpgm() -> Instruction {
  Instruction::sopp(Opcode::SEndpgm, 0)
}

pub fn i_branch() -> Instruction {
  Instruction::sopp(Opcode::SBranch, 0)
}

//=============================================================================
// Building programs

/// Builds a program block by block, in layout order.
pub struct ProgramBuilder {
  program: Program,
}

impl ProgramBuilder {
  pub fn new(gfx_level: GfxLevel) -> Self {
    Self { program: Program::new(ProgramConfig::new(gfx_level)) }
  }

  pub fn config_mut(&mut self) -> &mut ProgramConfig {
    &mut self.program.config
  }

  pub fn num_blocks(&self) -> usize {
    self.program.blocks.len()
  }

  pub fn block_mut(&mut self, index: u32) -> &mut Block {
    &mut self.program.blocks[index as usize]
  }

  /// Adds a block whose linear and logical predecessors are both `preds`.
  pub fn block(
    &mut self, kind: u16, preds: &[u32], depth: u32, instructions: Vec<Instruction>,
  ) -> u32 {
    self.divergent_block(kind, preds, preds, depth, instructions)
  }

  pub fn divergent_block(
    &mut self, kind: u16, linear_preds: &[u32], logical_preds: &[u32], depth: u32,
    instructions: Vec<Instruction>,
  ) -> u32 {
    let index = self.program.blocks.len() as u32;
    let mut block = Block::new(index, kind);
    block.linear_preds = linear_preds.iter().copied().collect();
    block.logical_preds = logical_preds.iter().copied().collect();
    block.loop_nest_depth = depth;
    block.instructions = instructions;
    self.program.blocks.push(block);
    index
  }

  pub fn finish(self) -> Program {
    self.program
  }
}

//=============================================================================
// Running and inspecting

pub fn print_program(program: &Program, title: &str) {
  println!("");
  println!("=== {} ===", title);
  print!("{:?}", program);
}

/// Validates `program` and runs the pass over it.
pub fn run_waitcnt(
  program: &mut Program, opts: &WaitcntOptions,
) -> Result<WaitcntResult, String> {
  validate(program)?;
  let result = insert_waitcnt_with_opts(program, opts).map_err(|err| err.to_string())?;
  info!(
    "{} block visits, {} waits inserted",
    result.num_block_visits, result.num_waits_inserted
  );
  Ok(result)
}

/// Every wait directive in `program`, with its block and position.
pub fn waits_of(program: &Program) -> Vec<(u32, usize, WaitImm)> {
  let mut waits = Vec::new();
  for block in &program.blocks {
    for (i, instr) in block.instructions.iter().enumerate() {
      if let InstrKind::Waitcnt(imm) = instr.kind {
        waits.push((block.index, i, imm));
      }
    }
  }
  waits
}

/// Drops every wait and dependency-counter directive.
pub fn strip_waits(program: &mut Program) {
  for block in program.blocks.iter_mut() {
    block
      .instructions
      .retain(|instr| !matches!(instr.kind, InstrKind::Waitcnt(_) | InstrKind::Depctr(_)));
  }
}

/// Compares two programs block by block, describing the first difference.
pub fn compare_programs(expected: &Program, actual: &Program) -> Result<(), String> {
  if expected.config != actual.config {
    return Err(format!("config differs: {:?} vs {:?}", expected.config, actual.config));
  }
  if expected.blocks.len() != actual.blocks.len() {
    return Err(format!(
      "expected {} blocks, found {}",
      expected.blocks.len(),
      actual.blocks.len()
    ));
  }
  for (exp, act) in expected.blocks.iter().zip(actual.blocks.iter()) {
    for (i, (exp_instr, act_instr)) in
      exp.instructions.iter().zip(act.instructions.iter()).enumerate()
    {
      if exp_instr != act_instr {
        return Err(format!(
          "block {} instruction {}: expected `{:?}`, found `{:?}`",
          exp.index, i, exp_instr, act_instr
        ));
      }
    }
    if exp.instructions.len() != act.instructions.len() {
      return Err(format!(
        "block {}: expected {} instructions, found {}",
        exp.index,
        exp.instructions.len(),
        act.instructions.len()
      ));
    }
    if exp != act {
      return Err(format!("block {}: header differs", exp.index));
    }
  }
  Ok(())
}

