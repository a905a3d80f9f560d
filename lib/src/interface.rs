/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Top level module for all the exported wait insertion interfaces.

use log::{debug, info};
use std::fmt;

use crate::checker::check;
use crate::driver::solve;

pub use crate::checker::{CheckerError, CheckerErrors, InstrLoc};
pub use crate::ir::*;
pub use crate::wait_imm::{DepctrWait, WaitImm, WaitType};

//=============================================================================
// Options, results and errors

/// Tweaks how the pass runs.
#[derive(Clone, Copy, Debug, Default)]
pub struct WaitcntOptions {
  /// Wait for every outstanding counter before every instruction.
  pub force_waitcnt: bool,
  /// Run the hazard checker on the rewritten program.
  pub run_checker: bool,
}

/// Statistics about a run of the pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitcntResult {
  /// How many times a block was visited by the fixed-point iteration.
  pub num_block_visits: usize,
  /// Wait instructions in the output beyond those already in the input.
  pub num_waits_inserted: usize,
}

#[derive(Clone, Debug)]
pub enum WaitcntError {
  /// The rewritten program still has a hazard.
  Checker(CheckerErrors),
}

impl fmt::Display for WaitcntError {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      WaitcntError::Checker(errors) => write!(fmt, "checker failed: {}", errors),
    }
  }
}

impl From<CheckerErrors> for WaitcntError {
  fn from(errors: CheckerErrors) -> Self {
    WaitcntError::Checker(errors)
  }
}

//=============================================================================
// Entry points

fn count_waits(program: &Program) -> usize {
  program
    .blocks
    .iter()
    .flat_map(|block| block.instructions.iter())
    .filter(|instr| matches!(instr.kind, InstrKind::Waitcnt(_)))
    .count()
}

/// Inserts the waits `program` needs, with default options.
pub fn insert_waitcnt(program: &mut Program) -> Result<WaitcntResult, WaitcntError> {
  insert_waitcnt_with_opts(program, &WaitcntOptions::default())
}

/// Inserts the waits `program` needs.  Existing waits are merged with the
/// inserted ones; running the pass twice leaves the program unchanged.
pub fn insert_waitcnt_with_opts(
  program: &mut Program, opts: &WaitcntOptions,
) -> Result<WaitcntResult, WaitcntError> {
  info!(
    "insert_waitcnt: {} blocks, {} instructions, {}",
    program.blocks.len(),
    program.num_instructions(),
    program.config.gfx_level
  );

  let waits_before = count_waits(program);
  let solution = solve(program, opts.force_waitcnt);
  let num_waits_inserted = count_waits(program).saturating_sub(waits_before);

  debug!(
    "insert_waitcnt: {} block visits, {} waits inserted",
    solution.num_block_visits, num_waits_inserted
  );

  if opts.run_checker {
    check(program)?;
    debug!("insert_waitcnt: checker passed");
  }

  Ok(WaitcntResult { num_block_visits: solution.num_block_visits, num_waits_inserted })
}
