//! Checker: verifies that a program with waits inserted never touches a
//! register while an asynchronous access to it may be in flight.
//!
//! The checker is independent of the context the pass keeps.  It tracks
//! every asynchronous access individually instead of one merged entry per
//! register, and it only knows the hardware rules, not the pass's shortcuts.
//!
//! The dataflow state at each program point is a map from
//!
//!   (issuing instruction, register unit, event) -> pending access
//!
//! where a pending access records whether it writes the unit, the counter
//! its completion decrements, how many younger accesses completing in order
//! with it were issued since (`younger`), and whether it may touch the lanes
//! active on the current logical path.
//!
//! The transfer functions are:
//!
//!   - wait `cnt <= N` (including the `wait_exp` field of interpolation
//!     instructions):
//!
//!       drop every access on `cnt` with `N <= younger`; at most `N` accesses
//!       are left and the `younger` ones complete after this one.
//!
//!   - an instruction starting an access with event `E`:
//!
//!       `younger += 1` for every pending access with event `E`, unless the
//!       event is unordered; then add the new accesses with `younger = 0`.
//!
//!   - any other instruction checks its operands and definitions:
//!
//!       reading a unit with a pending write, writing a unit with a pending
//!       read, and (for instructions whose result is not itself written
//!       asynchronously) writing a unit with a pending write are errors.
//!
//! At control-flow joins accesses are united, keeping the smallest `younger`
//! count; lane visibility only flows along logical edges.  Where several
//! logical paths merge, a linear-only path adds just the accesses started in
//! blocks without lanes.  We find the
//! fixpoint of the analysis, then check every instruction once against its
//! entry state.

use std::fmt;

use crate::context::Map;
use crate::ir::{
  Format, GfxLevel, InstrKind, Instruction, Opcode, Operand, PhysReg, Program,
  ProgramConfig, BLOCK_KIND_DISCARD_EARLY_EXIT, BLOCK_KIND_END_WITH_REGS,
};
use crate::target::{
  TargetInfo, EVENT_GDS, EVENT_GDS_GPR_LOCK, EVENT_LDS, EVENT_LDSDIR,
  EVENT_SENDMSG, EVENT_SENDMSG_RTN, EVENT_SMEM, EVENT_VMEM, EVENT_VMEM_BVH,
  EVENT_VMEM_GPR_LOCK, EVENT_VMEM_SAMPLE,
};
use crate::update::{export_event, get_vmem_event, PassCx};
use crate::wait_imm::{WaitImm, WaitType};

//=============================================================================
// Errors

/// A program point: block index and position in the block.  Accesses made
/// before the program starts are located in block `u32::MAX`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstrLoc {
  pub block: u32,
  pub index: u32,
}

impl InstrLoc {
  fn argument(index: usize) -> InstrLoc {
    InstrLoc { block: u32::MAX, index: index as u32 }
  }
}

impl fmt::Display for InstrLoc {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    if self.block == u32::MAX {
      write!(fmt, "argument {}", self.index)
    } else {
      write!(fmt, "block {} instruction {}", self.block, self.index)
    }
  }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckerError {
  /// A register is read while an asynchronous write to it may be in flight.
  ReadAfterWrite { at: InstrLoc, reg: PhysReg, access: InstrLoc },
  /// A register is overwritten while an asynchronous access may still read
  /// it.
  WriteAfterRead { at: InstrLoc, reg: PhysReg, access: InstrLoc },
  /// A register is overwritten while an asynchronous write to it may land
  /// later.
  WriteAfterWrite { at: InstrLoc, reg: PhysReg, access: InstrLoc },
  /// Control leaves the program while an access is in flight.
  PendingAtExit { at: InstrLoc, reg: PhysReg, access: InstrLoc },
  /// The analysis did not stabilize.
  NoFixpoint { rounds: usize },
}

impl fmt::Display for CheckerError {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      CheckerError::ReadAfterWrite { at, reg, access } => write!(
        fmt,
        "{}: reads {:?} before the write by {} completed",
        at, reg, access
      ),
      CheckerError::WriteAfterRead { at, reg, access } => write!(
        fmt,
        "{}: overwrites {:?} before the read by {} completed",
        at, reg, access
      ),
      CheckerError::WriteAfterWrite { at, reg, access } => write!(
        fmt,
        "{}: overwrites {:?} before the write by {} completed",
        at, reg, access
      ),
      CheckerError::PendingAtExit { at, reg, access } => write!(
        fmt,
        "{}: leaves the program with the access of {:?} by {} in flight",
        at, reg, access
      ),
      CheckerError::NoFixpoint { rounds } => {
        write!(fmt, "no fixpoint after {} rounds", rounds)
      }
    }
  }
}

#[derive(Clone, Debug)]
pub struct CheckerErrors {
  pub errors: Vec<CheckerError>,
}

impl fmt::Display for CheckerErrors {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{} checker error(s)", self.errors.len())?;
    for error in &self.errors {
      write!(fmt, "\n  {}", error)?;
    }
    Ok(())
  }
}

//=============================================================================
// Abstract state

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct AccessKey {
  origin: InstrLoc,
  unit: PhysReg,
  event: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PendingAccess {
  write: bool,
  counter: WaitType,
  younger: u16,
  /// Unordered accesses only complete on a wait for zero.
  ordered: bool,
  logical: bool,
}

/// State that steps through program points as we scan over a block.
#[derive(Clone, Debug, PartialEq, Eq)]
struct CheckerState {
  pending: Map<AccessKey, PendingAccess>,
}

/// One access an instruction starts.
struct NewAccess {
  unit: PhysReg,
  event: u32,
  write: bool,
}

impl CheckerState {
  fn new() -> CheckerState {
    CheckerState { pending: Map::default() }
  }

  /// Merge the exit state of a predecessor at a CFG join-point, keeping the
  /// smallest `younger` count.  Only accesses `admit` accepts come in, and
  /// they keep their lanes only if `lanes` is set.
  fn meet_with(&mut self, other: &CheckerState, lanes: bool, admit: impl Fn(&AccessKey) -> bool) {
    for (key, access) in &other.pending {
      if !admit(key) {
        continue;
      }
      let logical = lanes && access.logical;
      match self.pending.get_mut(key) {
        Some(existing) => {
          existing.younger = existing.younger.min(access.younger);
          existing.logical |= logical;
        }
        None => {
          self.pending.insert(*key, PendingAccess { logical, ..*access });
        }
      }
    }
  }

  /// Mark the accesses still pending along a logical edge as visible to the
  /// lanes coming in over it.
  fn take_lanes(&mut self, other: &CheckerState) {
    for (key, access) in &other.pending {
      if let Some(existing) = self.pending.get_mut(key) {
        existing.logical |= access.logical;
      }
    }
  }

  fn process_wait(&mut self, imm: &WaitImm) {
    self.pending.retain(|_, access| {
      !(imm.is_set(access.counter) && imm[access.counter] <= access.younger)
    });
  }

  /// Update with the issue of an access with `event`.
  fn process_issue(&mut self, info: &TargetInfo, event: u32, ordered: bool) {
    if !ordered {
      return;
    }
    for (key, access) in self.pending.iter_mut() {
      if key.event == event && access.ordered {
        access.younger = access.younger.saturating_add(1).min(info.max_cnt[access.counter]);
      }
    }
  }

  fn add_access(&mut self, info: &TargetInfo, origin: InstrLoc, new: &NewAccess, ordered: bool) {
    let key = AccessKey { origin, unit: new.unit, event: new.event };
    let access = PendingAccess {
      write: new.write,
      counter: info.counter_of(new.event),
      younger: 0,
      ordered,
      logical: true,
    };
    self.pending.insert(key, access);
  }
}

//=============================================================================
// Instruction semantics

fn operand_units(op: &Operand, event: u32, out: &mut Vec<NewAccess>) {
  for unit in op.units() {
    out.push(NewAccess { unit, event, write: false });
  }
}

fn def_units(instr: &Instruction, event: u32, out: &mut Vec<NewAccess>) {
  for def in &instr.definitions {
    for unit in def.units() {
      out.push(NewAccess { unit, event, write: true });
    }
  }
}

fn exec_units(event: u32, out: &mut Vec<NewAccess>) {
  for i in 0..2 {
    out.push(NewAccess { unit: PhysReg::EXEC.plus(i), event, write: false });
  }
}

/// The events `instr` issues, in issue order, and the register accesses it
/// leaves in flight.
fn async_effects(cx: &PassCx, instr: &Instruction) -> (Vec<u32>, Vec<NewAccess>) {
  let mut events = Vec::new();
  let mut accesses = Vec::new();
  match &instr.kind {
    InstrKind::Exp(exp) => {
      let event = export_event(exp.dest);
      events.push(event);
      for i in 0..4 {
        if exp.enabled_mask & (1 << i) != 0 {
          let idx = if exp.compressed { i >> 1 } else { i };
          if let Some(op) = instr.operands.get(idx) {
            operand_units(op, event, &mut accesses);
          }
        }
      }
      exec_units(event, &mut accesses);
    }
    InstrKind::Flat(flat) if instr.format() == Format::Flat => {
      let event = get_vmem_event(cx, instr, crate::ir::VMEM_NOSAMPLER);
      events.push(event);
      events.push(EVENT_LDS);
      def_units(instr, event, &mut accesses);
      if flat.may_use_lds {
        def_units(instr, EVENT_LDS, &mut accesses);
      }
    }
    InstrKind::Smem(_) => {
      events.push(EVENT_SMEM);
      def_units(instr, EVENT_SMEM, &mut accesses);
    }
    InstrKind::Ds(ds) => {
      let event = if ds.gds { EVENT_GDS } else { EVENT_LDS };
      events.push(event);
      def_units(instr, event, &mut accesses);
      if ds.gds {
        events.push(EVENT_GDS_GPR_LOCK);
        for op in &instr.operands {
          operand_units(op, EVENT_GDS_GPR_LOCK, &mut accesses);
        }
        exec_units(EVENT_GDS_GPR_LOCK, &mut accesses);
      }
    }
    InstrKind::LdsDir(_) => {
      events.push(EVENT_LDSDIR);
      def_units(instr, EVENT_LDSDIR, &mut accesses);
    }
    InstrKind::Flat(_) | InstrKind::Vmem(_) => {
      let event = get_vmem_event(cx, instr, instr.vmem_type(cx.gfx_level()));
      events.push(event);
      def_units(instr, event, &mut accesses);
      // The oldest generation reads store data and image addresses late.
      if cx.gfx_level() == GfxLevel::Gfx6 {
        let locked = match instr.format() {
          Format::Mimg => instr.operands.get(2).filter(|op| !op.is_undefined()),
          _ if instr.operands.len() == 4 => instr.operands.get(3),
          _ => None,
        };
        if let Some(op) = locked {
          events.push(EVENT_VMEM_GPR_LOCK);
          operand_units(op, EVENT_VMEM_GPR_LOCK, &mut accesses);
        }
      }
    }
    InstrKind::Sopp { .. } if matches!(instr.opcode, Opcode::SSendmsg | Opcode::SSendmsghalt) => {
      events.push(EVENT_SENDMSG);
    }
    InstrKind::Salu if matches!(instr.opcode, Opcode::SSendmsgRtnB32 | Opcode::SSendmsgRtnB64) => {
      events.push(EVENT_SENDMSG_RTN);
      def_units(instr, EVENT_SENDMSG_RTN, &mut accesses);
    }
    _ => {}
  }
  (events, accesses)
}

/// Instructions whose own result lands asynchronously.  Their ordering
/// against earlier writes of the same register is up to the memory system,
/// so they are not checked for write-after-write.
fn writes_asynchronously(instr: &Instruction) -> bool {
  matches!(
    instr.kind,
    InstrKind::Smem(_) | InstrKind::Ds(_) | InstrKind::LdsDir(_) | InstrKind::Flat(_) | InstrKind::Vmem(_)
  )
}

//=============================================================================
// The checker

pub struct Checker<'a> {
  program: &'a Program,
  config: ProgramConfig,
  info: TargetInfo,
  bb_in: Vec<CheckerState>,
  bb_out: Vec<CheckerState>,
}

impl<'a> Checker<'a> {
  pub fn new(program: &'a Program) -> Checker<'a> {
    let num_blocks = program.blocks.len();
    Checker {
      program,
      config: program.config,
      info: TargetInfo::new(program.config.gfx_level),
      bb_in: vec![CheckerState::new(); num_blocks],
      bb_out: vec![CheckerState::new(); num_blocks],
    }
  }

  fn cx(&self) -> PassCx {
    PassCx { config: &self.config, info: &self.info, force_waitcnt: false }
  }

  /// Vector-memory results still being written when the program starts.
  fn entry_state(&self) -> CheckerState {
    let mut state = CheckerState::new();
    for (i, def) in self.program.args_pending_vmem.iter().enumerate() {
      state.process_issue(&self.info, EVENT_VMEM, true);
      for unit in def.units() {
        let new = NewAccess { unit, event: EVENT_VMEM, write: true };
        state.add_access(&self.info, InstrLoc::argument(i), &new, true);
      }
    }
    state
  }

  /// Whether an access on `unit` can conflict with an instruction running on
  /// the current logical path.
  fn is_visible(&self, key: &AccessKey, access: &PendingAccess) -> bool {
    if access.logical || !key.unit.is_vgpr() {
      return true;
    }
    // These write inactive lanes as well from GFX11 on.
    self.config.gfx_level >= GfxLevel::Gfx11
      && key.event & (EVENT_LDS | EVENT_GDS | EVENT_VMEM | EVENT_VMEM_SAMPLE | EVENT_VMEM_BVH) != 0
  }

  fn check_exit(&self, state: &CheckerState, at: InstrLoc, errors: &mut Vec<CheckerError>) {
    for key in state.pending.keys() {
      errors.push(CheckerError::PendingAtExit { at, reg: key.unit, access: key.origin });
    }
  }

  fn check_hazards(
    &self, state: &CheckerState, at: InstrLoc, instr: &Instruction,
    errors: &mut Vec<CheckerError>,
  ) {
    if state.pending.is_empty() {
      return;
    }
    let reads: Vec<PhysReg> = instr.operands.iter().flat_map(|op| op.units()).collect();
    let writes: Vec<PhysReg> = instr.definitions.iter().flat_map(|def| def.units()).collect();
    let check_waw = !writes_asynchronously(instr);

    for (key, access) in &state.pending {
      if !self.is_visible(key, access) {
        continue;
      }
      let reg = key.unit;
      let access_loc = key.origin;
      if access.write && reads.contains(&reg) {
        errors.push(CheckerError::ReadAfterWrite { at, reg, access: access_loc });
      }
      if writes.contains(&reg) {
        if !access.write {
          errors.push(CheckerError::WriteAfterRead { at, reg, access: access_loc });
        } else if check_waw {
          errors.push(CheckerError::WriteAfterWrite { at, reg, access: access_loc });
        }
      }
    }
  }

  /// Steps `state` over one instruction, reporting hazards to `errors`.
  fn process_instr(
    &self, state: &mut CheckerState, at: InstrLoc, instr: &Instruction,
    errors: &mut Vec<CheckerError>,
  ) {
    match &instr.kind {
      InstrKind::Waitcnt(imm) => {
        state.process_wait(imm);
        return;
      }
      InstrKind::VinterpInreg { wait_exp } => {
        state.process_wait(&WaitImm::single(WaitType::Exp, *wait_exp as u16));
      }
      _ => {}
    }

    self.check_hazards(state, at, instr, errors);
    if instr.opcode == Opcode::SSetpcB64 {
      self.check_exit(state, at, errors);
    }

    let cx = self.cx();
    let (events, accesses) = async_effects(&cx, instr);
    if events.is_empty() {
      return;
    }

    // Before GFX10 a flat load that may hit LDS completes out of order with
    // respect to everything on both counters.
    let flat_unordered = self.config.gfx_level < GfxLevel::Gfx10
      && instr.format() == Format::Flat
      && instr.may_use_lds()
      && !instr.definitions.is_empty();

    for &event in &events {
      let ordered = !flat_unordered && !self.info.is_unordered(event);
      state.process_issue(&self.info, event, ordered);
    }
    for new in &accesses {
      let ordered = !flat_unordered && !self.info.is_unordered(new.event);
      state.add_access(&self.info, at, new, ordered);
    }
  }

  fn process_block(&self, idx: usize, state: &mut CheckerState, errors: &mut Vec<CheckerError>) {
    let block = &self.program.blocks[idx];
    for (i, instr) in block.instructions.iter().enumerate() {
      let at = InstrLoc { block: idx as u32, index: i as u32 };
      self.process_instr(state, at, instr, errors);
    }
    if block.kind & BLOCK_KIND_END_WITH_REGS != 0 {
      let at = InstrLoc { block: idx as u32, index: block.instructions.len() as u32 };
      self.check_exit(state, at, errors);
    }
  }

  /// Whether the accesses started by `origin` ran with no lanes of their
  /// own, in a block that only exists on the linear CFG.
  fn is_laneless(&self, origin: InstrLoc) -> bool {
    origin.block != 0
      && self
        .program
        .blocks
        .get(origin.block as usize)
        .map_or(false, |block| block.logical_preds.is_empty())
  }

  fn block_entry(&self, idx: usize, entry: &CheckerState) -> CheckerState {
    let block = &self.program.blocks[idx];
    let mut state = if idx == 0 { entry.clone() } else { CheckerState::new() };
    if block.logical_preds.len() > 1 {
      // Some lanes arrive through one of the logical predecessors, so no
      // path skips all of them.  Around them only accesses started in
      // lane-less blocks can come in.
      for &pred in &block.logical_preds {
        state.meet_with(&self.bb_out[pred as usize], true, |_| true);
      }
      for &pred in &block.linear_preds {
        if !block.logical_preds.contains(&pred) {
          state.meet_with(&self.bb_out[pred as usize], false, |key| self.is_laneless(key.origin));
        }
      }
    } else {
      for &pred in &block.linear_preds {
        state.meet_with(&self.bb_out[pred as usize], false, |_| true);
      }
      for &pred in &block.logical_preds {
        state.take_lanes(&self.bb_out[pred as usize]);
      }
    }
    state
  }

  /// Iterate the block transfer functions to the fixpoint.
  fn analyze(&mut self) -> Result<(), CheckerError> {
    let entry = self.entry_state();
    let num_blocks = self.program.blocks.len();
    let max_rounds = (num_blocks + 2) * 8;
    let mut scratch = Vec::new();

    for _ in 0..max_rounds {
      let mut changed = false;
      for idx in 0..num_blocks {
        if self.program.blocks[idx].kind & BLOCK_KIND_DISCARD_EARLY_EXIT != 0 {
          continue;
        }
        let mut state = self.block_entry(idx, &entry);
        self.bb_in[idx] = state.clone();
        self.process_block(idx, &mut state, &mut scratch);
        scratch.clear();
        if state != self.bb_out[idx] {
          self.bb_out[idx] = state;
          changed = true;
        }
      }
      if !changed {
        return Ok(());
      }
    }
    Err(CheckerError::NoFixpoint { rounds: max_rounds })
  }

  /// Check every instruction against the solution.
  fn find_errors(&self) -> Vec<CheckerError> {
    let mut errors = Vec::new();
    for (idx, block) in self.program.blocks.iter().enumerate() {
      if block.kind & BLOCK_KIND_DISCARD_EARLY_EXIT != 0 {
        continue;
      }
      let mut state = self.bb_in[idx].clone();
      self.process_block(idx, &mut state, &mut errors);
    }
    errors
  }

  pub fn run(mut self) -> Result<(), CheckerErrors> {
    if let Err(error) = self.analyze() {
      return Err(CheckerErrors { errors: vec![error] });
    }
    let errors = self.find_errors();
    if errors.is_empty() {
      Ok(())
    } else {
      Err(CheckerErrors { errors })
    }
  }
}

/// Checks `program` for hazards on asynchronously accessed registers.
pub fn check(program: &Program) -> Result<(), CheckerErrors> {
  Checker::new(program).run()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ir::{
    Block, Definition, ExpInfo, MemorySyncInfo, STORAGE_BUFFER, BLOCK_KIND_LOOP_EXIT,
    BLOCK_KIND_LOOP_HEADER, EXP_POS,
  };

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

  fn use_of(n: u16) -> Instruction {
    Instruction::valu(Opcode::VMovB32, &[Definition::new(v(20), 1)], &[Operand::reg(v(n), 1)])
  }

  fn vm(n: u16) -> Instruction {
    Instruction::waitcnt(WaitImm::single(WaitType::Vm, n))
  }

  fn program_of(blocks: Vec<(u16, Vec<u32>, Vec<Instruction>)>) -> Program {
    let mut program = Program::new(ProgramConfig::new(GfxLevel::Gfx10));
    for (i, (kind, preds, instrs)) in blocks.into_iter().enumerate() {
      let mut block = Block::new(i as u32, kind);
      block.linear_preds = preds.iter().copied().collect();
      block.logical_preds = preds.iter().copied().collect();
      block.instructions = instrs;
      program.blocks.push(block);
    }
    program
  }

  #[test]
  fn counted_waits_are_accepted() {
    let program = program_of(vec![(0, vec![], vec![load(0), load(1), vm(1), use_of(0), vm(0), use_of(1)])]);
    assert!(check(&program).is_ok());
  }

  #[test]
  fn too_weak_wait_is_reported() {
    let program = program_of(vec![(0, vec![], vec![load(0), load(1), vm(2), use_of(0)])]);
    let errors = check(&program).unwrap_err().errors;
    assert_eq!(
      errors,
      vec![CheckerError::ReadAfterWrite {
        at: InstrLoc { block: 0, index: 3 },
        reg: v(0),
        access: InstrLoc { block: 0, index: 0 },
      }]
    );
  }

  #[test]
  fn export_data_may_not_be_overwritten() {
    let exp = Instruction::exp(
      &[Operand::reg(v(0), 1), Operand::Undefined, Operand::Undefined, Operand::Undefined],
      ExpInfo { dest: EXP_POS, enabled_mask: 0x1, compressed: false },
    );
    let overwrite =
      Instruction::valu(Opcode::VMovB32, &[Definition::new(v(0), 1)], &[Operand::Constant(0)]);
    let program = program_of(vec![(0, vec![], vec![exp, use_of(0), overwrite])]);
    let errors = check(&program).unwrap_err().errors;
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], CheckerError::WriteAfterRead { reg, .. } if reg == v(0)));
  }

  #[test]
  fn loop_carried_load_is_found() {
    let program = program_of(vec![
      (0, vec![], vec![]),
      (BLOCK_KIND_LOOP_HEADER, vec![0, 2], vec![use_of(2)]),
      (0, vec![1], vec![load(2)]),
      (BLOCK_KIND_LOOP_EXIT, vec![2], vec![]),
    ]);
    let errors = check(&program).unwrap_err().errors;
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], CheckerError::ReadAfterWrite { at, .. } if at.block == 1));
  }

  #[test]
  fn pending_arguments_and_exits() {
    let mut program = program_of(vec![(BLOCK_KIND_END_WITH_REGS, vec![], vec![use_of(7)])]);
    program.args_pending_vmem.push(Definition::new(v(0), 1));
    let errors = check(&program).unwrap_err().errors;
    assert_eq!(
      errors,
      vec![CheckerError::PendingAtExit {
        at: InstrLoc { block: 0, index: 1 },
        reg: v(0),
        access: InstrLoc::argument(0),
      }]
    );
  }

  #[test]
  fn rewritten_programs_pass() {
    let mut program = program_of(vec![
      (0, vec![], vec![load(0), load(1)]),
      (BLOCK_KIND_LOOP_HEADER, vec![0, 2], vec![use_of(1), load(3)]),
      (0, vec![1], vec![use_of(0), load(0)]),
      (BLOCK_KIND_LOOP_EXIT, vec![2], vec![use_of(3)]),
    ]);
    assert!(check(&program).is_err());
    crate::driver::solve(&mut program, false);
    if let Err(errors) = check(&program) {
      panic!("{}", errors);
    }
  }

  /// An if/else on divergent lanes: the then and else sides (blocks 1 and 4)
  /// get their own lanes, blocks 2, 3 and 5 only run on the linear CFG.
  fn divergent_if_else(
    branch: Vec<Instruction>, then: Vec<Instruction>, else_: Vec<Instruction>,
    else_linear: Vec<Instruction>, merge: Vec<Instruction>,
  ) -> Program {
    let shape: Vec<(Vec<u32>, Vec<u32>, Vec<Instruction>)> = vec![
      (vec![], vec![], branch),
      (vec![0], vec![0], then),
      (vec![0], vec![], vec![]),
      (vec![1, 2], vec![], vec![]),
      (vec![3], vec![0], else_),
      (vec![3], vec![], else_linear),
      (vec![4, 5], vec![1, 4], merge),
    ];
    let mut program = Program::new(ProgramConfig::new(GfxLevel::Gfx10));
    for (i, (linear, logical, instrs)) in shape.into_iter().enumerate() {
      let mut block = Block::new(i as u32, 0);
      block.linear_preds = linear.iter().copied().collect();
      block.logical_preds = logical.iter().copied().collect();
      block.instructions = instrs;
      program.blocks.push(block);
    }
    program
  }

  #[test]
  fn waits_on_both_sides_cover_the_merge() {
    // Every wave runs at least one side, and waits do not depend on lanes.
    let program = divergent_if_else(
      vec![load(0)],
      vec![vm(0), use_of(0)],
      vec![vm(0), use_of(0)],
      vec![],
      vec![use_of(0)],
    );
    if let Err(errors) = check(&program) {
      panic!("{}", errors);
    }
  }

  #[test]
  fn linear_only_load_reaches_the_merge() {
    let smem = Instruction::smem(
      Opcode::SLoadDword,
      &[Definition::new(PhysReg::sgpr(4), 1)],
      &[Operand::reg(PhysReg::sgpr(0), 2), Operand::Constant(0)],
      MemorySyncInfo::default(),
    );
    let read = Instruction::salu(
      Opcode::SMovB32,
      &[Definition::new(PhysReg::sgpr(5), 1)],
      &[Operand::reg(PhysReg::sgpr(4), 1)],
    );
    let program = divergent_if_else(vec![], vec![], vec![], vec![smem], vec![read]);
    let errors = check(&program).unwrap_err().errors;
    assert_eq!(
      errors,
      vec![CheckerError::ReadAfterWrite {
        at: InstrLoc { block: 6, index: 0 },
        reg: PhysReg::sgpr(4),
        access: InstrLoc { block: 5, index: 0 },
      }]
    );
  }

  #[test]
  fn then_side_load_is_seen_after_the_else_side() {
    // The else side runs after the then side on the same wave, so a scalar
    // result of the then side is still in flight there.
    let smem = Instruction::smem(
      Opcode::SLoadDword,
      &[Definition::new(PhysReg::sgpr(4), 1)],
      &[Operand::reg(PhysReg::sgpr(0), 2), Operand::Constant(0)],
      MemorySyncInfo::default(),
    );
    let read = Instruction::salu(
      Opcode::SMovB32,
      &[Definition::new(PhysReg::sgpr(5), 1)],
      &[Operand::reg(PhysReg::sgpr(4), 1)],
    );
    let program = divergent_if_else(vec![], vec![smem], vec![read], vec![], vec![]);
    let errors = check(&program).unwrap_err().errors;
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], CheckerError::ReadAfterWrite { at, .. } if at.block == 4));
  }
}
