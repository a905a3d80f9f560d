/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! The machine-code representation that the pass consumes and rewrites.
//!
//! Registers are allocated already: every operand and definition names a
//! physical register range.  Control flow is described by the predecessor
//! lists of each block, split into "linear" predecessors (the scalar control
//! flow that the hardware actually follows) and "logical" predecessors (the
//! control flow as seen by a single lane, i.e. under the execution mask).

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

use crate::wait_imm::{DepctrWait, WaitImm};

//=============================================================================
// Hardware generations

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum GfxLevel {
  Gfx6,
  Gfx7,
  Gfx8,
  Gfx9,
  Gfx10,
  Gfx10_3,
  Gfx11,
  Gfx11_5,
  Gfx12,
}

impl GfxLevel {
  pub const ALL: [GfxLevel; 9] = [
    GfxLevel::Gfx6,
    GfxLevel::Gfx7,
    GfxLevel::Gfx8,
    GfxLevel::Gfx9,
    GfxLevel::Gfx10,
    GfxLevel::Gfx10_3,
    GfxLevel::Gfx11,
    GfxLevel::Gfx11_5,
    GfxLevel::Gfx12,
  ];

  pub fn name(self) -> &'static str {
    match self {
      GfxLevel::Gfx6 => "gfx6",
      GfxLevel::Gfx7 => "gfx7",
      GfxLevel::Gfx8 => "gfx8",
      GfxLevel::Gfx9 => "gfx9",
      GfxLevel::Gfx10 => "gfx10",
      GfxLevel::Gfx10_3 => "gfx10.3",
      GfxLevel::Gfx11 => "gfx11",
      GfxLevel::Gfx11_5 => "gfx11.5",
      GfxLevel::Gfx12 => "gfx12",
    }
  }

  pub fn from_name(name: &str) -> Option<GfxLevel> {
    GfxLevel::ALL.iter().copied().find(|level| level.name() == name)
  }
}

impl fmt::Display for GfxLevel {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{}", self.name())
  }
}

//=============================================================================
// Registers, operands and definitions

/// One 32-bit register unit.  Units below 256 are scalar registers, units
/// from 256 up are vector registers.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct PhysReg(pub u16);

pub const NUM_REG_UNITS: usize = 512;

impl PhysReg {
  /// The execution mask, a scalar register pair.
  pub const EXEC: PhysReg = PhysReg(126);

  pub const fn sgpr(n: u16) -> PhysReg {
    PhysReg(n)
  }
  pub const fn vgpr(n: u16) -> PhysReg {
    PhysReg(256 + n)
  }
  pub fn reg(self) -> u16 {
    self.0
  }
  pub fn is_vgpr(self) -> bool {
    self.0 >= 256
  }
  pub fn plus(self, units: u16) -> PhysReg {
    PhysReg(self.0 + units)
  }
}

impl fmt::Debug for PhysReg {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    if self.is_vgpr() {
      write!(fmt, "v{}", self.0 - 256)
    } else {
      write!(fmt, "s{}", self.0)
    }
  }
}

fn fmt_reg_range(
  fmt: &mut fmt::Formatter, reg: PhysReg, size: u8,
) -> fmt::Result {
  if reg == PhysReg::EXEC && size == 2 {
    return write!(fmt, "exec");
  }
  let (prefix, base) =
    if reg.is_vgpr() { ('v', reg.0 - 256) } else { ('s', reg.0) };
  if size == 1 {
    write!(fmt, "{}{}", prefix, base)
  } else {
    write!(fmt, "{}[{}:{}]", prefix, base, base + size as u16 - 1)
  }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Operand {
  /// `size` consecutive register units starting at `reg`.
  Reg { reg: PhysReg, size: u8 },
  Constant(u32),
  Undefined,
}

impl Operand {
  pub fn reg(reg: PhysReg, size: u8) -> Operand {
    debug_assert!(size > 0);
    Operand::Reg { reg, size }
  }
  pub fn exec() -> Operand {
    Operand::Reg { reg: PhysReg::EXEC, size: 2 }
  }
  pub fn is_undefined(&self) -> bool {
    matches!(self, Operand::Undefined)
  }
  /// Size in register units; constants and undefined operands take none.
  pub fn size(&self) -> u8 {
    match self {
      Operand::Reg { size, .. } => *size,
      _ => 0,
    }
  }
  pub fn units(&self) -> impl Iterator<Item = PhysReg> {
    let (reg, size) = match self {
      Operand::Reg { reg, size } => (*reg, *size),
      _ => (PhysReg(0), 0),
    };
    (0..size as u16).map(move |i| reg.plus(i))
  }
}

impl fmt::Debug for Operand {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Operand::Reg { reg, size } => fmt_reg_range(fmt, *reg, *size),
      Operand::Constant(value) => write!(fmt, "#{}", value),
      Operand::Undefined => write!(fmt, "undef"),
    }
  }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Definition {
  pub reg: PhysReg,
  pub size: u8,
}

impl Definition {
  pub fn new(reg: PhysReg, size: u8) -> Definition {
    debug_assert!(size > 0);
    Definition { reg, size }
  }
  pub fn units(&self) -> impl Iterator<Item = PhysReg> {
    let reg = self.reg;
    (0..self.size as u16).map(move |i| reg.plus(i))
  }
}

impl fmt::Debug for Definition {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    fmt_reg_range(fmt, self.reg, self.size)
  }
}

//=============================================================================
// Memory synchronization metadata

pub const STORAGE_BUFFER: u16 = 1 << 0;
pub const STORAGE_GDS: u16 = 1 << 1;
pub const STORAGE_IMAGE: u16 = 1 << 2;
pub const STORAGE_SHARED: u16 = 1 << 3;
pub const STORAGE_VMEM_OUTPUT: u16 = 1 << 4;
pub const STORAGE_TASK_PAYLOAD: u16 = 1 << 5;
pub const STORAGE_SCRATCH: u16 = 1 << 6;
pub const STORAGE_VGPR_SPILL: u16 = 1 << 7;
pub const STORAGE_COUNT: usize = 8;
pub const STORAGE_ALL: u16 = (1 << STORAGE_COUNT) - 1;

pub const STORAGE_NAMES: [&str; STORAGE_COUNT] = [
  "buffer",
  "gds",
  "image",
  "shared",
  "vmem_output",
  "task_payload",
  "scratch",
  "vgpr_spill",
];

/// Index of a single storage class bit.
pub fn storage_index(storage: u16) -> usize {
  debug_assert!(storage.count_ones() == 1);
  storage.trailing_zeros() as usize
}

pub const SEMANTIC_ACQUIRE: u8 = 1 << 0;
pub const SEMANTIC_RELEASE: u8 = 1 << 1;
pub const SEMANTIC_VOLATILE: u8 = 1 << 2;
pub const SEMANTIC_PRIVATE: u8 = 1 << 3;
pub const SEMANTIC_CAN_REORDER: u8 = 1 << 4;
pub const SEMANTIC_ATOMIC: u8 = 1 << 5;
pub const SEMANTIC_RMW: u8 = 1 << 6;
pub const SEMANTIC_ACQREL: u8 = SEMANTIC_ACQUIRE | SEMANTIC_RELEASE;

pub const SEMANTIC_NAMES: [&str; 7] = [
  "acquire",
  "release",
  "volatile",
  "private",
  "can_reorder",
  "atomic",
  "rmw",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum SyncScope {
  Invocation,
  Subgroup,
  Workgroup,
  QueueFamily,
  Device,
}

impl Default for SyncScope {
  fn default() -> Self {
    SyncScope::Invocation
  }
}

impl SyncScope {
  pub fn name(self) -> &'static str {
    match self {
      SyncScope::Invocation => "invocation",
      SyncScope::Subgroup => "subgroup",
      SyncScope::Workgroup => "workgroup",
      SyncScope::QueueFamily => "queuefamily",
      SyncScope::Device => "device",
    }
  }
  pub fn from_name(name: &str) -> Option<SyncScope> {
    [
      SyncScope::Invocation,
      SyncScope::Subgroup,
      SyncScope::Workgroup,
      SyncScope::QueueFamily,
      SyncScope::Device,
    ]
    .iter()
    .copied()
    .find(|scope| scope.name() == name)
  }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct MemorySyncInfo {
  pub storage: u16,
  pub semantics: u8,
  pub scope: SyncScope,
}

impl MemorySyncInfo {
  pub fn new(storage: u16, semantics: u8, scope: SyncScope) -> Self {
    Self { storage, semantics, scope }
  }
  pub fn storage(storage: u16) -> Self {
    Self { storage, semantics: 0, scope: SyncScope::Invocation }
  }
}

fn fmt_bit_names(
  fmt: &mut fmt::Formatter, key: &str, bits: u32, names: &[&str],
) -> fmt::Result {
  write!(fmt, " {}=", key)?;
  let mut first = true;
  for (i, name) in names.iter().enumerate() {
    if bits & (1 << i) != 0 {
      write!(fmt, "{}{}", if first { "" } else { "," }, name)?;
      first = false;
    }
  }
  Ok(())
}

impl fmt::Display for MemorySyncInfo {
  /// Renders as zero or more space-prefixed `key=value` attributes.
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    if self.storage != 0 {
      fmt_bit_names(fmt, "storage", self.storage as u32, &STORAGE_NAMES)?;
    }
    if self.semantics != 0 {
      fmt_bit_names(fmt, "semantics", self.semantics as u32, &SEMANTIC_NAMES)?;
    }
    if self.scope != SyncScope::Invocation {
      write!(fmt, " scope={}", self.scope.name())?;
    }
    Ok(())
  }
}

//=============================================================================
// Opcodes

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Format {
  Sop1,
  Sop2,
  Sopp,
  Smem,
  Ds,
  LdsDir,
  Exp,
  Flat,
  Global,
  Scratch,
  Mubuf,
  Mtbuf,
  Mimg,
  Valu,
  VinterpInreg,
  PseudoBarrier,
}

/// Sub-types of vector memory accesses, as bits.  Only loads of the same
/// type are guaranteed to write their destinations in issue order.
pub const VMEM_NOSAMPLER: u8 = 1 << 0;
pub const VMEM_SAMPLER: u8 = 1 << 1;
pub const VMEM_BVH: u8 = 1 << 2;

macro_rules! opcodes {
  ($($variant:ident => $name:literal, $format:ident;)*) => {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
    pub enum Opcode {
      $($variant,)*
    }

    impl Opcode {
      pub const ALL: &'static [Opcode] = &[$(Opcode::$variant,)*];

      pub fn name(self) -> &'static str {
        match self {
          $(Opcode::$variant => $name,)*
        }
      }

      pub fn from_name(name: &str) -> Option<Opcode> {
        match name {
          $($name => Some(Opcode::$variant),)*
          _ => None,
        }
      }

      pub fn format(self) -> Format {
        match self {
          $(Opcode::$variant => Format::$format,)*
        }
      }
    }
  };
}

opcodes! {
  SMovB32 => "s_mov_b32", Sop1;
  SMovB64 => "s_mov_b64", Sop1;
  SSetpcB64 => "s_setpc_b64", Sop1;
  SSendmsgRtnB32 => "s_sendmsg_rtn_b32", Sop1;
  SSendmsgRtnB64 => "s_sendmsg_rtn_b64", Sop1;
  SAddU32 => "s_add_u32", Sop2;
  SAndB64 => "s_and_b64", Sop2;
  SCselectB32 => "s_cselect_b32", Sop2;
  SNop => "s_nop", Sopp;
  SEndpgm => "s_endpgm", Sopp;
  SBranch => "s_branch", Sopp;
  SCbranchScc0 => "s_cbranch_scc0", Sopp;
  SCbranchExecz => "s_cbranch_execz", Sopp;
  SBarrier => "s_barrier", Sopp;
  SSendmsg => "s_sendmsg", Sopp;
  SSendmsghalt => "s_sendmsghalt", Sopp;
  SWaitcnt => "s_waitcnt", Sopp;
  SWaitcntDepctr => "s_waitcnt_depctr", Sopp;
  SLoadDword => "s_load_dword", Smem;
  SLoadDwordx2 => "s_load_dwordx2", Smem;
  SLoadDwordx4 => "s_load_dwordx4", Smem;
  SBufferLoadDword => "s_buffer_load_dword", Smem;
  SBufferLoadDwordx4 => "s_buffer_load_dwordx4", Smem;
  DsReadB32 => "ds_read_b32", Ds;
  DsReadB64 => "ds_read_b64", Ds;
  DsWriteB32 => "ds_write_b32", Ds;
  DsAddU32 => "ds_add_u32", Ds;
  DsAddRtnU32 => "ds_add_rtn_u32", Ds;
  DsOrderedCount => "ds_ordered_count", Ds;
  LdsParamLoad => "lds_param_load", LdsDir;
  LdsDirectLoad => "lds_direct_load", LdsDir;
  Exp => "exp", Exp;
  FlatLoadDword => "flat_load_dword", Flat;
  FlatLoadDwordx2 => "flat_load_dwordx2", Flat;
  FlatStoreDword => "flat_store_dword", Flat;
  FlatLoadShortD16 => "flat_load_short_d16", Flat;
  FlatLoadShortD16Hi => "flat_load_short_d16_hi", Flat;
  GlobalLoadDword => "global_load_dword", Global;
  GlobalLoadDwordx2 => "global_load_dwordx2", Global;
  GlobalLoadDwordx4 => "global_load_dwordx4", Global;
  GlobalStoreDword => "global_store_dword", Global;
  GlobalAtomicAdd => "global_atomic_add", Global;
  GlobalLoadUbyteD16 => "global_load_ubyte_d16", Global;
  GlobalLoadShortD16 => "global_load_short_d16", Global;
  GlobalLoadShortD16Hi => "global_load_short_d16_hi", Global;
  ScratchLoadDword => "scratch_load_dword", Scratch;
  ScratchStoreDword => "scratch_store_dword", Scratch;
  ScratchLoadShortD16 => "scratch_load_short_d16", Scratch;
  ScratchLoadShortD16Hi => "scratch_load_short_d16_hi", Scratch;
  BufferLoadDword => "buffer_load_dword", Mubuf;
  BufferLoadDwordx2 => "buffer_load_dwordx2", Mubuf;
  BufferLoadDwordx4 => "buffer_load_dwordx4", Mubuf;
  BufferStoreDword => "buffer_store_dword", Mubuf;
  BufferAtomicAdd => "buffer_atomic_add", Mubuf;
  BufferLoadUbyteD16 => "buffer_load_ubyte_d16", Mubuf;
  BufferLoadShortD16 => "buffer_load_short_d16", Mubuf;
  BufferLoadShortD16Hi => "buffer_load_short_d16_hi", Mubuf;
  BufferLoadFormatD16Xyz => "buffer_load_format_d16_xyz", Mubuf;
  TbufferLoadFormatX => "tbuffer_load_format_x", Mtbuf;
  TbufferLoadFormatD16X => "tbuffer_load_format_d16_x", Mtbuf;
  TbufferLoadFormatD16Xyz => "tbuffer_load_format_d16_xyz", Mtbuf;
  ImageSample => "image_sample", Mimg;
  ImageSampleLz => "image_sample_lz", Mimg;
  ImageLoad => "image_load", Mimg;
  ImageStore => "image_store", Mimg;
  ImageMsaaLoad => "image_msaa_load", Mimg;
  ImageBvh64IntersectRay => "image_bvh64_intersect_ray", Mimg;
  VMovB32 => "v_mov_b32", Valu;
  VAddF32 => "v_add_f32", Valu;
  VMulF32 => "v_mul_f32", Valu;
  VAddU32 => "v_add_u32", Valu;
  VCndmaskB32 => "v_cndmask_b32", Valu;
  VInterpP10F32Inreg => "v_interp_p10_f32_inreg", VinterpInreg;
  PBarrier => "p_barrier", PseudoBarrier;
}

impl Opcode {
  /// Which halves of each destination register unit the access writes, two
  /// bits per unit.  Only the 16-bit ("d16") loads write less than the
  /// whole destination.
  pub fn vmem_write_mask(self) -> u32 {
    match self {
      Opcode::BufferLoadUbyteD16
      | Opcode::BufferLoadShortD16
      | Opcode::TbufferLoadFormatD16X
      | Opcode::FlatLoadShortD16
      | Opcode::GlobalLoadUbyteD16
      | Opcode::GlobalLoadShortD16
      | Opcode::ScratchLoadShortD16 => 0x1,
      Opcode::BufferLoadShortD16Hi
      | Opcode::FlatLoadShortD16Hi
      | Opcode::GlobalLoadShortD16Hi
      | Opcode::ScratchLoadShortD16Hi => 0x2,
      Opcode::BufferLoadFormatD16Xyz | Opcode::TbufferLoadFormatD16Xyz => 0x7,
      _ => 0xffff_ffff,
    }
  }
}

//=============================================================================
// Instructions

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct DsInfo {
  pub sync: MemorySyncInfo,
  pub gds: bool,
  pub offset0: u16,
  pub offset1: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct ExpInfo {
  /// Export target slot.
  pub dest: u8,
  /// Which of the four data components are written.
  pub enabled_mask: u8,
  /// Two components are packed per data operand.
  pub compressed: bool,
}

pub const EXP_MRT_Z: u8 = 8;
pub const EXP_NULL: u8 = 9;
pub const EXP_POS: u8 = 12;
pub const EXP_PRIM: u8 = 20;
pub const EXP_DUAL_SRC_BLEND_0: u8 = 21;
pub const EXP_DUAL_SRC_BLEND_1: u8 = 22;
pub const EXP_PARAM: u8 = 32;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct FlatInfo {
  pub sync: MemorySyncInfo,
  /// The address may point into LDS (only meaningful for `Format::Flat`).
  pub may_use_lds: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct BarrierInfo {
  pub sync: MemorySyncInfo,
  /// Scope of the execution barrier; `Invocation` for a memory-only barrier.
  pub exec_scope: SyncScope,
}

/// Per-format payload of an instruction.  Each variant carries exactly what
/// the hazard tracking needs to know about instructions of that format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum InstrKind {
  Salu,
  Sopp { imm: u16 },
  Valu,
  VinterpInreg { wait_exp: u8 },
  Smem(MemorySyncInfo),
  Ds(DsInfo),
  LdsDir(MemorySyncInfo),
  Exp(ExpInfo),
  /// Flat, global and scratch accesses.
  Flat(FlatInfo),
  /// Buffer, typed-buffer and image accesses.
  Vmem(MemorySyncInfo),
  Barrier(BarrierInfo),
  Waitcnt(WaitImm),
  Depctr(DepctrWait),
}

impl InstrKind {
  fn matches_format(&self, format: Format) -> bool {
    match (self, format) {
      (InstrKind::Salu, Format::Sop1) | (InstrKind::Salu, Format::Sop2) => true,
      (InstrKind::Sopp { .. }, Format::Sopp)
      | (InstrKind::Waitcnt(_), Format::Sopp)
      | (InstrKind::Depctr(_), Format::Sopp) => true,
      (InstrKind::Valu, Format::Valu) => true,
      (InstrKind::VinterpInreg { .. }, Format::VinterpInreg) => true,
      (InstrKind::Smem(_), Format::Smem) => true,
      (InstrKind::Ds(_), Format::Ds) => true,
      (InstrKind::LdsDir(_), Format::LdsDir) => true,
      (InstrKind::Exp(_), Format::Exp) => true,
      (InstrKind::Flat(_), Format::Flat)
      | (InstrKind::Flat(_), Format::Global)
      | (InstrKind::Flat(_), Format::Scratch) => true,
      (InstrKind::Vmem(_), Format::Mubuf)
      | (InstrKind::Vmem(_), Format::Mtbuf)
      | (InstrKind::Vmem(_), Format::Mimg) => true,
      (InstrKind::Barrier(_), Format::PseudoBarrier) => true,
      _ => false,
    }
  }
}

pub const SENDMSG_GS_DONE: u16 = 3;
pub const SENDMSG_DEALLOC_VGPRS: u16 = 3;

#[derive(Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Instruction {
  pub opcode: Opcode,
  pub definitions: SmallVec<[Definition; 2]>,
  pub operands: SmallVec<[Operand; 4]>,
  pub kind: InstrKind,
}

impl Instruction {
  pub fn new(
    opcode: Opcode, definitions: &[Definition], operands: &[Operand],
    kind: InstrKind,
  ) -> Instruction {
    assert!(
      kind.matches_format(opcode.format()),
      "instruction payload {:?} does not fit opcode {}",
      kind,
      opcode.name()
    );
    let is_wait = matches!(kind, InstrKind::Waitcnt(_));
    let is_depctr = matches!(kind, InstrKind::Depctr(_));
    assert_eq!(is_wait, opcode == Opcode::SWaitcnt);
    assert_eq!(is_depctr, opcode == Opcode::SWaitcntDepctr);
    Instruction {
      opcode,
      definitions: definitions.iter().copied().collect(),
      operands: operands.iter().copied().collect(),
      kind,
    }
  }

  pub fn waitcnt(imm: WaitImm) -> Instruction {
    Instruction::new(Opcode::SWaitcnt, &[], &[], InstrKind::Waitcnt(imm))
  }

  pub fn depctr(wait: DepctrWait) -> Instruction {
    Instruction::new(Opcode::SWaitcntDepctr, &[], &[], InstrKind::Depctr(wait))
  }

  pub fn sopp(opcode: Opcode, imm: u16) -> Instruction {
    Instruction::new(opcode, &[], &[], InstrKind::Sopp { imm })
  }

  pub fn salu(
    opcode: Opcode, definitions: &[Definition], operands: &[Operand],
  ) -> Instruction {
    Instruction::new(opcode, definitions, operands, InstrKind::Salu)
  }

  pub fn valu(
    opcode: Opcode, definitions: &[Definition], operands: &[Operand],
  ) -> Instruction {
    Instruction::new(opcode, definitions, operands, InstrKind::Valu)
  }

  pub fn smem(
    opcode: Opcode, definitions: &[Definition], operands: &[Operand],
    sync: MemorySyncInfo,
  ) -> Instruction {
    Instruction::new(opcode, definitions, operands, InstrKind::Smem(sync))
  }

  pub fn vmem(
    opcode: Opcode, definitions: &[Definition], operands: &[Operand],
    sync: MemorySyncInfo,
  ) -> Instruction {
    Instruction::new(opcode, definitions, operands, InstrKind::Vmem(sync))
  }

  pub fn flat(
    opcode: Opcode, definitions: &[Definition], operands: &[Operand],
    info: FlatInfo,
  ) -> Instruction {
    Instruction::new(opcode, definitions, operands, InstrKind::Flat(info))
  }

  pub fn ds(
    opcode: Opcode, definitions: &[Definition], operands: &[Operand],
    info: DsInfo,
  ) -> Instruction {
    Instruction::new(opcode, definitions, operands, InstrKind::Ds(info))
  }

  pub fn exp(operands: &[Operand], info: ExpInfo) -> Instruction {
    Instruction::new(Opcode::Exp, &[], operands, InstrKind::Exp(info))
  }

  pub fn barrier(sync: MemorySyncInfo, exec_scope: SyncScope) -> Instruction {
    Instruction::new(
      Opcode::PBarrier,
      &[],
      &[],
      InstrKind::Barrier(BarrierInfo { sync, exec_scope }),
    )
  }

  pub fn format(&self) -> Format {
    self.opcode.format()
  }

  /// Buffer, typed-buffer and image instructions.
  pub fn is_vmem(&self) -> bool {
    matches!(self.format(), Format::Mubuf | Format::Mtbuf | Format::Mimg)
  }

  /// Flat, global and scratch instructions.
  pub fn is_flat_like(&self) -> bool {
    matches!(self.format(), Format::Flat | Format::Global | Format::Scratch)
  }

  pub fn is_ds(&self) -> bool {
    self.format() == Format::Ds
  }

  pub fn is_smem(&self) -> bool {
    self.format() == Format::Smem
  }

  pub fn is_barrier(&self) -> bool {
    self.format() == Format::PseudoBarrier
  }

  pub fn ds_info(&self) -> Option<&DsInfo> {
    match &self.kind {
      InstrKind::Ds(info) => Some(info),
      _ => None,
    }
  }

  pub fn may_use_lds(&self) -> bool {
    match &self.kind {
      InstrKind::Flat(info) => info.may_use_lds,
      _ => false,
    }
  }

  pub fn accesses_lds(&self) -> bool {
    match &self.kind {
      InstrKind::Ds(info) => !info.gds,
      InstrKind::LdsDir(_) => true,
      InstrKind::Flat(info) => info.may_use_lds,
      _ => false,
    }
  }

  /// The memory synchronization metadata of the access, if any.
  pub fn sync_info(&self) -> MemorySyncInfo {
    match &self.kind {
      InstrKind::Smem(sync)
      | InstrKind::LdsDir(sync)
      | InstrKind::Vmem(sync) => *sync,
      InstrKind::Ds(info) => info.sync,
      InstrKind::Flat(info) => info.sync,
      InstrKind::Barrier(info) => info.sync,
      _ => MemorySyncInfo::default(),
    }
  }

  /// The vector-memory sub-type bits, zero for instructions that do not
  /// load through the vector memory path in order.  Flat accesses may hit
  /// LDS and get no type.
  pub fn vmem_type(&self, gfx_level: GfxLevel) -> u8 {
    match self.opcode {
      Opcode::ImageBvh64IntersectRay => VMEM_BVH,
      Opcode::ImageMsaaLoad if gfx_level >= GfxLevel::Gfx12 => VMEM_SAMPLER,
      Opcode::ImageSample | Opcode::ImageSampleLz => VMEM_SAMPLER,
      _ if self.is_vmem() => VMEM_NOSAMPLER,
      _ if matches!(self.format(), Format::Global | Format::Scratch) => {
        VMEM_NOSAMPLER
      }
      _ => 0,
    }
  }

  /// Whether this is the "release" form of an ordered-count operation.
  pub fn is_ordered_count_release(&self) -> bool {
    match (&self.opcode, &self.kind) {
      (Opcode::DsOrderedCount, InstrKind::Ds(info)) => {
        (info.offset1 as u16 | (info.offset0 >> 8)) & 0x1 != 0
      }
      _ => false,
    }
  }

  pub fn sopp_imm(&self) -> Option<u16> {
    match self.kind {
      InstrKind::Sopp { imm } => Some(imm),
      _ => None,
    }
  }
}

impl fmt::Debug for Instruction {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    for (i, def) in self.definitions.iter().enumerate() {
      write!(fmt, "{}{:?}", if i > 0 { ", " } else { "" }, def)?;
    }
    if !self.definitions.is_empty() {
      write!(fmt, " = ")?;
    }
    write!(fmt, "{}", self.opcode.name())?;
    for (i, op) in self.operands.iter().enumerate() {
      write!(fmt, "{}{:?}", if i > 0 { ", " } else { " " }, op)?;
    }
    match &self.kind {
      InstrKind::Salu | InstrKind::Valu => Ok(()),
      InstrKind::Sopp { imm } => {
        if *imm != 0 {
          write!(fmt, " imm={}", imm)?;
        }
        Ok(())
      }
      InstrKind::VinterpInreg { wait_exp } => {
        write!(fmt, " wait_exp={}", wait_exp)
      }
      InstrKind::Smem(sync)
      | InstrKind::LdsDir(sync)
      | InstrKind::Vmem(sync) => write!(fmt, "{}", sync),
      InstrKind::Ds(info) => {
        write!(fmt, "{}", info.sync)?;
        if info.gds {
          write!(fmt, " gds")?;
        }
        if info.offset0 != 0 {
          write!(fmt, " offset0={}", info.offset0)?;
        }
        if info.offset1 != 0 {
          write!(fmt, " offset1={}", info.offset1)?;
        }
        Ok(())
      }
      InstrKind::Exp(info) => {
        write!(fmt, " dest={} en={:#x}", info.dest, info.enabled_mask)?;
        if info.compressed {
          write!(fmt, " compr")?;
        }
        Ok(())
      }
      InstrKind::Flat(info) => {
        write!(fmt, "{}", info.sync)?;
        if info.may_use_lds {
          write!(fmt, " lds")?;
        }
        Ok(())
      }
      InstrKind::Barrier(info) => {
        write!(fmt, "{}", info.sync)?;
        if info.exec_scope != SyncScope::Invocation {
          write!(fmt, " exec_scope={}", info.exec_scope.name())?;
        }
        Ok(())
      }
      InstrKind::Waitcnt(imm) => {
        if !imm.is_empty() {
          write!(fmt, " {}", imm)?;
        }
        Ok(())
      }
      InstrKind::Depctr(wait) => {
        if !wait.is_empty() {
          write!(fmt, " {}", wait)?;
        }
        Ok(())
      }
    }
  }
}

//=============================================================================
// Blocks and programs

pub const BLOCK_KIND_TOP_LEVEL: u16 = 1 << 0;
pub const BLOCK_KIND_LOOP_PREHEADER: u16 = 1 << 1;
pub const BLOCK_KIND_LOOP_HEADER: u16 = 1 << 2;
pub const BLOCK_KIND_LOOP_EXIT: u16 = 1 << 3;
pub const BLOCK_KIND_BRANCH: u16 = 1 << 4;
pub const BLOCK_KIND_MERGE: u16 = 1 << 5;
pub const BLOCK_KIND_INVERT: u16 = 1 << 6;
pub const BLOCK_KIND_UNIFORM: u16 = 1 << 7;
pub const BLOCK_KIND_DISCARD_EARLY_EXIT: u16 = 1 << 8;
pub const BLOCK_KIND_END_WITH_REGS: u16 = 1 << 9;

pub const BLOCK_KIND_NAMES: [&str; 10] = [
  "top_level",
  "loop_preheader",
  "loop_header",
  "loop_exit",
  "branch",
  "merge",
  "invert",
  "uniform",
  "discard_early_exit",
  "end_with_regs",
];

#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Block {
  pub index: u32,
  pub kind: u16,
  pub linear_preds: SmallVec<[u32; 2]>,
  pub logical_preds: SmallVec<[u32; 2]>,
  pub loop_nest_depth: u32,
  pub instructions: Vec<Instruction>,
}

impl Block {
  pub fn new(index: u32, kind: u16) -> Block {
    Block {
      index,
      kind,
      linear_preds: SmallVec::new(),
      logical_preds: SmallVec::new(),
      loop_nest_depth: 0,
      instructions: Vec::new(),
    }
  }
}

fn fmt_preds(fmt: &mut fmt::Formatter, key: &str, preds: &[u32]) -> fmt::Result {
  if preds.is_empty() {
    return Ok(());
  }
  write!(fmt, " {}=", key)?;
  for (i, pred) in preds.iter().enumerate() {
    write!(fmt, "{}{}", if i > 0 { "," } else { "" }, pred)?;
  }
  Ok(())
}

impl fmt::Debug for Block {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "block {}", self.index)?;
    if self.kind != 0 {
      fmt_bit_names(fmt, "kind", self.kind as u32, &BLOCK_KIND_NAMES)?;
    }
    fmt_preds(fmt, "preds", &self.linear_preds)?;
    fmt_preds(fmt, "logical", &self.logical_preds)?;
    if self.loop_nest_depth != 0 {
      write!(fmt, " depth={}", self.loop_nest_depth)?;
    }
    writeln!(fmt, ":")?;
    for instr in &self.instructions {
      writeln!(fmt, "  {:?}", instr)?;
    }
    Ok(())
  }
}

/// Shader-wide parameters the pass depends on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct ProgramConfig {
  pub gfx_level: GfxLevel,
  pub wave_size: u32,
  pub workgroup_size: u32,
  /// Workgroup processor mode: a workgroup may span two compute units.
  pub wgp_mode: bool,
  pub sram_ecc_enabled: bool,
  pub physical_vgprs: u32,
  pub max_waves_per_simd: u32,
  /// Vector registers used by the program.
  pub num_vgprs: u32,
}

impl ProgramConfig {
  pub fn new(gfx_level: GfxLevel) -> Self {
    Self {
      gfx_level,
      wave_size: 64,
      workgroup_size: 64,
      wgp_mode: false,
      sram_ecc_enabled: false,
      physical_vgprs: 512,
      max_waves_per_simd: 16,
      num_vgprs: 0,
    }
  }
}

impl Default for ProgramConfig {
  fn default() -> Self {
    ProgramConfig::new(GfxLevel::Gfx10)
  }
}

#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Program {
  pub config: ProgramConfig,
  /// Blocks in reverse postorder; `blocks[i].index == i`.
  pub blocks: Vec<Block>,
  /// LDS accesses from an earlier shader part may still be in flight.
  pub pending_lds_access: bool,
  /// Arguments still being loaded from vector memory at function entry.
  pub args_pending_vmem: Vec<Definition>,
}

impl Program {
  pub fn new(config: ProgramConfig) -> Program {
    Program {
      config,
      blocks: Vec::new(),
      pending_lds_access: false,
      args_pending_vmem: Vec::new(),
    }
  }

  pub fn gfx_level(&self) -> GfxLevel {
    self.config.gfx_level
  }

  pub fn num_instructions(&self) -> usize {
    self.blocks.iter().map(|b| b.instructions.len()).sum()
  }
}

impl fmt::Debug for Program {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    let cfg = &self.config;
    write!(
      fmt,
      "config {} wave={} workgroup={}",
      cfg.gfx_level, cfg.wave_size, cfg.workgroup_size
    )?;
    if cfg.wgp_mode {
      write!(fmt, " wgp")?;
    }
    if cfg.sram_ecc_enabled {
      write!(fmt, " sram_ecc")?;
    }
    writeln!(
      fmt,
      " vgprs={} physical_vgprs={} max_waves={}",
      cfg.num_vgprs, cfg.physical_vgprs, cfg.max_waves_per_simd
    )?;
    if self.pending_lds_access {
      writeln!(fmt, "pending_lds")?;
    }
    for def in &self.args_pending_vmem {
      writeln!(fmt, "pending_vmem {:?}", def)?;
    }
    for block in &self.blocks {
      write!(fmt, "{:?}", block)?;
    }
    Ok(())
  }
}
