//! Implements fuzzing primitives for programs.
//!
//! Generated programs have structured control flow (straight-line code,
//! uniform and divergent if/else diamonds, nested loops), registers drawn
//! from small pools so that accesses collide often, and a final `s_endpgm`.

use arbitrary::{Arbitrary, Result, Unstructured};
use std::fmt;

use waitcnt::{
  DsInfo, ExpInfo, FlatInfo, GfxLevel, InstrKind, Instruction,
  MemorySyncInfo, Opcode, Operand, PhysReg, Program, ProgramConfig,
  SyncScope, WaitImm, WaitType, BLOCK_KIND_BRANCH, BLOCK_KIND_END_WITH_REGS,
  BLOCK_KIND_INVERT, BLOCK_KIND_LOOP_EXIT, BLOCK_KIND_LOOP_HEADER, BLOCK_KIND_LOOP_PREHEADER,
  BLOCK_KIND_MERGE, BLOCK_KIND_TOP_LEVEL, BLOCK_KIND_UNIFORM, EXP_MRT_Z,
  EXP_NULL, EXP_PARAM, EXP_POS, EXP_PRIM, SEMANTIC_ACQREL, SEMANTIC_PRIVATE,
  STORAGE_BUFFER, STORAGE_GDS, STORAGE_IMAGE, STORAGE_SCRATCH,
  STORAGE_SHARED,
};

use crate::test_framework::*;

/// Vector registers v0..NUM_VGPRS (plus room for four-wide results).
pub const NUM_VGPRS: u16 = 16;
/// Scalar registers s16..s16+NUM_SGPRS.
pub const NUM_SGPRS: u16 = 16;
const FIRST_SGPR: u16 = 16;

const MAX_BLOCKS: usize = 32;
const MAX_LOOP_DEPTH: u32 = 3;
const MAX_BLOCK_INSTRS: u8 = 12;

/// A random program that passes validation.
pub struct FuzzProgram {
  pub program: Program,
}

impl fmt::Debug for FuzzProgram {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{:?}", self.program)
  }
}

struct FuzzingEnv {
  gfx_level: GfxLevel,
  builder: ProgramBuilder,
  /// The block instructions are currently appended to.
  current: u32,
  depth: u32,
}

impl FuzzingEnv {
  fn vgpr(&self, u: &mut Unstructured) -> Result<PhysReg> {
    Ok(v(u.int_in_range(0..=NUM_VGPRS - 1)?))
  }

  fn sgpr(&self, u: &mut Unstructured) -> Result<PhysReg> {
    Ok(s(FIRST_SGPR + u.int_in_range(0..=NUM_SGPRS - 1)?))
  }

  fn sync(&self, u: &mut Unstructured, storage: u16) -> Result<MemorySyncInfo> {
    let semantics = if u.ratio(1, 8)? { SEMANTIC_ACQREL } else { 0 };
    let scope = *u.choose(&[SyncScope::Invocation, SyncScope::Workgroup, SyncScope::Device])?;
    Ok(MemorySyncInfo::new(storage, semantics, scope))
  }

  fn wait(&self, u: &mut Unstructured) -> Result<Instruction> {
    let max = WaitImm::max(self.gfx_level);
    let mut imm = WaitImm::new();
    for &ty in &WaitType::ALL {
      if max[ty] != 0 && u.ratio(1, 3)? {
        imm[ty] = u.int_in_range(0..=max[ty])?;
      }
    }
    Ok(Instruction::waitcnt(imm))
  }

  fn inst(&mut self, u: &mut Unstructured) -> Result<Instruction> {
    const NUM_VARIANTS: u8 = 16;

    let inst = match u.int_in_range(0..=NUM_VARIANTS - 1)? {
      0 | 1 => {
        let srcs = [self.vgpr(u)?, self.vgpr(u)?];
        i_valu(self.vgpr(u)?, &srcs)
      }
      2 => {
        let srcs = [self.sgpr(u)?];
        i_salu(self.sgpr(u)?, &srcs)
      }
      3 => i_buffer_load(self.vgpr(u)?, self.vgpr(u)?),
      4 => {
        let store = i_buffer_store(self.vgpr(u)?, self.vgpr(u)?);
        let sync = self.sync(u, STORAGE_BUFFER)?;
        Instruction::vmem(store.opcode, &[], &store.operands, sync)
      }
      5 => i_global_load(self.vgpr(u)?, v(u.int_in_range(0..=NUM_VGPRS - 2)?)),
      6 => {
        let addr = v(u.int_in_range(0..=NUM_VGPRS - 2)?);
        let sync = self.sync(u, STORAGE_BUFFER)?;
        i_global_store(addr, self.vgpr(u)?, sync)
      }
      7 => i_smem_load(self.sgpr(u)?, s(4), u.int_in_range(0..=64)? * 4),
      8 => i_ds_read(self.vgpr(u)?, self.vgpr(u)?),
      9 => i_ds_write(self.vgpr(u)?, self.vgpr(u)?),
      10 => {
        let dest = *u.choose(&[0, EXP_MRT_Z, EXP_NULL, EXP_POS, EXP_POS + 1, EXP_PRIM, EXP_PARAM])?;
        let data = self.vgpr(u)?;
        Instruction::exp(
          &[r(data), Operand::Undefined, Operand::Undefined, Operand::Undefined],
          ExpInfo { dest, enabled_mask: 0x1, compressed: false },
        )
      }
      11 => i_image_sample(v(u.int_in_range(0..=NUM_VGPRS - 4)?), v(u.int_in_range(0..=NUM_VGPRS - 2)?)),
      12 => self.wait(u)?,
      13 => {
        if u.ratio(1, 2)? {
          let storage = *u.choose(&[STORAGE_SHARED, STORAGE_BUFFER, STORAGE_SHARED | STORAGE_IMAGE])?;
          let scope = *u.choose(&[SyncScope::Workgroup, SyncScope::Device])?;
          Instruction::barrier(MemorySyncInfo::new(storage, SEMANTIC_ACQREL, scope), SyncScope::Workgroup)
        } else {
          i_s_barrier()
        }
      }
      14 => {
        let sync = MemorySyncInfo::new(STORAGE_SCRATCH, SEMANTIC_PRIVATE, SyncScope::Invocation);
        let data = self.vgpr(u)?;
        Instruction::flat(
          Opcode::ScratchStoreDword,
          &[],
          &[r(self.vgpr(u)?), Operand::Undefined, r(data)],
          FlatInfo { sync, may_use_lds: false },
        )
      }
      15 => self.inst_special(u)?,
      x => {
        debug_assert!(x < NUM_VARIANTS, "update NUM_VARIANTS above");
        unreachable!()
      }
    };
    Ok(inst)
  }

  /// Rarer instructions, some of which only exist on some generations.
  fn inst_special(&mut self, u: &mut Unstructured) -> Result<Instruction> {
    let inst = match u.int_in_range(0..=3u8)? {
      0 if self.gfx_level >= GfxLevel::Gfx11 => Instruction::new(
        Opcode::LdsParamLoad,
        &[def(self.vgpr(u)?)],
        &[r(s(8))],
        InstrKind::LdsDir(MemorySyncInfo::storage(STORAGE_SHARED)),
      ),
      1 if self.gfx_level >= GfxLevel::Gfx11 => {
        let ops = [r(self.vgpr(u)?), r(self.vgpr(u)?), r(self.vgpr(u)?)];
        Instruction::new(
          Opcode::VInterpP10F32Inreg,
          &[def(self.vgpr(u)?)],
          &ops,
          InstrKind::VinterpInreg { wait_exp: u.int_in_range(0..=7)? },
        )
      }
      2 => {
        let addr = v(u.int_in_range(0..=NUM_VGPRS - 2)?);
        Instruction::flat(
          Opcode::FlatLoadDword,
          &[def(self.vgpr(u)?)],
          &[r_n(addr, 2), Operand::Undefined],
          FlatInfo { sync: MemorySyncInfo::storage(STORAGE_BUFFER | STORAGE_SHARED), may_use_lds: true },
        )
      }
      _ => {
        let release = u.ratio(1, 2)?;
        Instruction::ds(
          Opcode::DsOrderedCount,
          &[def(self.vgpr(u)?)],
          &[r(self.vgpr(u)?)],
          DsInfo {
            sync: MemorySyncInfo::storage(STORAGE_GDS),
            gds: true,
            offset0: 0,
            offset1: if release { 1 } else { 0 },
          },
        )
      }
    };
    Ok(inst)
  }

  fn fill(&mut self, u: &mut Unstructured, instrs: &mut Vec<Instruction>) -> Result<()> {
    let num_instrs = u.int_in_range(0..=MAX_BLOCK_INSTRS)?;
    for _ in 0..num_instrs {
      instrs.push(self.inst(u)?);
    }
    Ok(())
  }

  fn new_block(&mut self, kind: u16, preds: &[u32], u: &mut Unstructured) -> Result<u32> {
    let mut instrs = Vec::new();
    self.fill(u, &mut instrs)?;
    let kind = if self.depth == 0 { kind | BLOCK_KIND_TOP_LEVEL } else { kind };
    self.current = self.builder.block(kind, preds, self.depth, instrs);
    Ok(self.current)
  }

  /// Adds a block inside a divergent diamond.  Blocks that only exist on
  /// the linear CFG stay empty.
  fn inner_block(
    &mut self, kind: u16, linear_preds: &[u32], logical_preds: &[u32], u: &mut Unstructured,
  ) -> Result<u32> {
    let mut instrs = Vec::new();
    if !logical_preds.is_empty() {
      self.fill(u, &mut instrs)?;
    }
    self.current =
      self.builder.divergent_block(kind, linear_preds, logical_preds, self.depth, instrs);
    Ok(self.current)
  }

  /// Appends a region of control flow after the current block.
  fn region(&mut self, u: &mut Unstructured) -> Result<()> {
    if self.builder.num_blocks() + 7 > MAX_BLOCKS {
      return Ok(());
    }
    match u.int_in_range(0..=3u8)? {
      // A diamond.
      0 => {
        let branch = self.current;
        self.builder.block_mut(branch).kind |= BLOCK_KIND_BRANCH;
        let then_block = self.new_block(BLOCK_KIND_UNIFORM, &[branch], u)?;
        let else_block = self.new_block(BLOCK_KIND_UNIFORM, &[branch], u)?;
        self.new_block(BLOCK_KIND_MERGE, &[then_block, else_block], u)?;
      }
      // A diamond on divergent lanes.  Each side can be skipped over a
      // linear-only block when no lane takes it.
      1 => {
        let branch = self.current;
        self.builder.block_mut(branch).kind |= BLOCK_KIND_BRANCH;
        let then_block = self.inner_block(0, &[branch], &[branch], u)?;
        let then_skip = self.inner_block(0, &[branch], &[], u)?;
        let invert = self.inner_block(BLOCK_KIND_INVERT, &[then_block, then_skip], &[], u)?;
        let else_block = self.inner_block(0, &[invert], &[branch], u)?;
        let else_skip = self.inner_block(0, &[invert], &[], u)?;
        let mut instrs = Vec::new();
        self.fill(u, &mut instrs)?;
        let kind = if self.depth == 0 { BLOCK_KIND_MERGE | BLOCK_KIND_TOP_LEVEL } else { BLOCK_KIND_MERGE };
        self.current = self.builder.divergent_block(
          kind,
          &[else_block, else_skip],
          &[then_block, else_block],
          self.depth,
          instrs,
        );
      }
      // A loop, possibly with more control flow inside.
      2 if self.depth < MAX_LOOP_DEPTH => {
        let preheader = self.current;
        self.builder.block_mut(preheader).kind |= BLOCK_KIND_LOOP_PREHEADER;
        self.depth += 1;
        let header = self.new_block(BLOCK_KIND_LOOP_HEADER, &[preheader], u)?;
        if u.ratio(1, 2)? {
          self.region(u)?;
        }
        let tail = self.current;
        let latch = self.new_block(BLOCK_KIND_UNIFORM, &[tail], u)?;
        self.builder.block_mut(header).linear_preds.push(latch);
        self.builder.block_mut(header).logical_preds.push(latch);
        self.depth -= 1;
        self.new_block(BLOCK_KIND_LOOP_EXIT, &[latch], u)?;
      }
      _ => {
        let pred = self.current;
        self.new_block(0, &[pred], u)?;
      }
    }
    Ok(())
  }
}

impl<'a> Arbitrary<'a> for FuzzProgram {
  fn arbitrary(u: &mut Unstructured<'a>) -> Result<FuzzProgram> {
    let gfx_level = *u.choose(&GfxLevel::ALL)?;
    let mut config = ProgramConfig::new(gfx_level);
    if gfx_level >= GfxLevel::Gfx10 && u.ratio(1, 2)? {
      config.wave_size = 32;
    }
    config.workgroup_size = *u.choose(&[32, 64, 256, 1024])?;
    config.wgp_mode = gfx_level >= GfxLevel::Gfx10 && bool::arbitrary(u)?;
    config.sram_ecc_enabled = bool::arbitrary(u)?;
    config.num_vgprs = u.int_in_range(1..=256)?;

    let mut env = FuzzingEnv {
      gfx_level,
      builder: ProgramBuilder::new(gfx_level),
      current: 0,
      depth: 0,
    };
    *env.builder.config_mut() = config;

    env.new_block(0, &[], u)?;
    let num_regions = u.int_in_range(0..=6u8)?;
    for _ in 0..num_regions {
      env.region(u)?;
    }

    let last = env.current;
    if u.ratio(1, 8)? {
      env.builder.block_mut(last).kind |= BLOCK_KIND_END_WITH_REGS;
    } else {
      env.builder.block_mut(last).instructions.push(i_endpgm());
    }

    let mut program = env.builder.finish();
    if u.ratio(1, 4)? {
      program.args_pending_vmem.push(def_n(v(NUM_VGPRS), 2));
    }
    program.pending_lds_access = u.ratio(1, 4)?;

    Ok(FuzzProgram { program })
  }
}
