/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

/// Test cases.  The list of them is right at the bottom, function
/// |find_program|.  Add new ones there.
use waitcnt::{
  GfxLevel, MemorySyncInfo, Program, WaitType, BLOCK_KIND_BRANCH,
  BLOCK_KIND_END_WITH_REGS, BLOCK_KIND_INVERT, BLOCK_KIND_LOOP_EXIT,
  BLOCK_KIND_LOOP_HEADER, BLOCK_KIND_LOOP_PREHEADER, BLOCK_KIND_MERGE,
  BLOCK_KIND_TOP_LEVEL, BLOCK_KIND_UNIFORM, EXP_PARAM, EXP_POS, SEMANTIC_PRIVATE,
  STORAGE_BUFFER, STORAGE_SCRATCH, SyncScope,
};

use crate::parser;
use crate::test_framework::*;

use std::path::{Path, PathBuf};

/// Loads feeding ALU operations within one block.
fn test_straight_line() -> Program {
  let mut b = ProgramBuilder::new(GfxLevel::Gfx10);
  b.block(
    BLOCK_KIND_TOP_LEVEL,
    &[],
    0,
    vec![
      i_buffer_load(v(0), v(10)),
      i_buffer_load(v(1), v(11)),
      i_smem_load(s(20), s(4), 0),
      i_valu(v(2), &[v(0), v(0)]),
      i_salu(s(21), &[s(20)]),
      i_valu(v(3), &[v(1), v(2)]),
      i_endpgm(),
    ],
  );
  b.finish()
}

/// Two loads on one counter read back in issue order.  Counters complete in
/// order, so the first read only waits for the older load.
fn test_loads_read_in_order() -> Program {
  let mut b = ProgramBuilder::new(GfxLevel::Gfx10);
  b.block(
    BLOCK_KIND_TOP_LEVEL,
    &[],
    0,
    vec![
      i_buffer_load(v(0), v(10)),
      i_buffer_load(v(1), v(11)),
      i_valu(v(2), &[v(0)]),
      i_valu(v(3), &[v(1)]),
      i_endpgm(),
    ],
  );
  b.finish()
}

/// The waits are all there already.
fn test_already_waited() -> Program {
  let mut b = ProgramBuilder::new(GfxLevel::Gfx10);
  b.block(
    BLOCK_KIND_TOP_LEVEL,
    &[],
    0,
    vec![
      i_buffer_load(v(0), v(10)),
      i_wait(&[(WaitType::Vm, 0)]),
      i_valu(v(1), &[v(0)]),
      i_endpgm(),
    ],
  );
  b.finish()
}

/// A load carried around a loop back edge, and one out of the loop.
fn test_simple_loop() -> Program {
  let mut b = ProgramBuilder::new(GfxLevel::Gfx10);
  let pre = b.block(
    BLOCK_KIND_TOP_LEVEL | BLOCK_KIND_LOOP_PREHEADER,
    &[],
    0,
    vec![i_buffer_load(v(0), v(10))],
  );
  let header = b.block(BLOCK_KIND_LOOP_HEADER, &[pre, pre + 2], 1, vec![
    i_valu(v(1), &[v(0), v(1)]),
  ]);
  let body = b.block(BLOCK_KIND_UNIFORM, &[header], 1, vec![
    i_buffer_load(v(0), v(1)),
    i_branch(),
  ]);
  b.block(BLOCK_KIND_TOP_LEVEL | BLOCK_KIND_LOOP_EXIT, &[body], 0, vec![
    i_valu(v(2), &[v(0)]),
    i_endpgm(),
  ]);
  b.finish()
}

/// Two loops, one inside the other, each carrying a load around.
fn test_nested_loops() -> Program {
  let mut b = ProgramBuilder::new(GfxLevel::Gfx10);
  b.block(BLOCK_KIND_TOP_LEVEL | BLOCK_KIND_LOOP_PREHEADER, &[], 0, vec![
    i_buffer_load(v(0), v(10)),
  ]);
  b.block(BLOCK_KIND_LOOP_HEADER | BLOCK_KIND_LOOP_PREHEADER, &[0, 5], 1, vec![
    i_valu(v(4), &[v(1)]),
  ]);
  b.block(BLOCK_KIND_LOOP_HEADER, &[1, 3], 2, vec![i_valu(v(5), &[v(2)])]);
  b.block(BLOCK_KIND_UNIFORM, &[2], 2, vec![
    i_buffer_load(v(2), v(10)),
    i_buffer_load(v(3), v(11)),
    i_branch(),
  ]);
  b.block(BLOCK_KIND_LOOP_EXIT, &[3], 1, vec![
    i_valu(v(6), &[v(0)]),
    i_buffer_load(v(1), v(12)),
  ]);
  b.block(BLOCK_KIND_UNIFORM, &[4], 1, vec![i_valu(v(7), &[v(3)]), i_branch()]);
  b.block(BLOCK_KIND_TOP_LEVEL | BLOCK_KIND_LOOP_EXIT, &[5], 0, vec![
    i_valu(v(8), &[v(1)]),
    i_endpgm(),
  ]);
  b.finish()
}

/// An if/else under divergent control flow: the "then" load reaches the
/// merge only through the logical edges.
fn test_divergent_if() -> Program {
  let mut b = ProgramBuilder::new(GfxLevel::Gfx10);
  b.block(BLOCK_KIND_TOP_LEVEL | BLOCK_KIND_BRANCH, &[], 0, vec![
    i_smem_load(s(20), s(4), 0),
  ]);
  b.divergent_block(0, &[0], &[0], 0, vec![i_buffer_load(v(0), v(10))]);
  b.divergent_block(0, &[0], &[], 0, vec![]);
  b.divergent_block(BLOCK_KIND_INVERT, &[1, 2], &[], 0, vec![]);
  b.divergent_block(0, &[3], &[0], 0, vec![i_valu(v(1), &[v(11)])]);
  b.divergent_block(0, &[3], &[], 0, vec![]);
  b.divergent_block(BLOCK_KIND_TOP_LEVEL | BLOCK_KIND_MERGE, &[4, 5], &[1, 4], 0, vec![
    i_valu(v(2), &[v(0), v(1)]),
    i_salu(s(21), &[s(20)]),
    i_endpgm(),
  ]);
  b.finish()
}

/// Shared memory written before a workgroup barrier and read after it.
fn test_lds_barrier() -> Program {
  let mut b = ProgramBuilder::new(GfxLevel::Gfx10);
  {
    let config = b.config_mut();
    config.workgroup_size = 256;
    config.wgp_mode = true;
  }
  b.block(BLOCK_KIND_TOP_LEVEL, &[], 0, vec![
    i_ds_write(v(1), v(2)),
    i_workgroup_barrier(),
    i_s_barrier(),
    i_ds_read(v(3), v(1)),
    i_valu(v(4), &[v(3)]),
    i_endpgm(),
  ]);
  b.finish()
}

/// An exported register overwritten while the export is in flight.
fn test_exports() -> Program {
  let mut b = ProgramBuilder::new(GfxLevel::Gfx10);
  b.block(BLOCK_KIND_TOP_LEVEL, &[], 0, vec![
    i_valu(v(0), &[v(5)]),
    i_exp(EXP_POS, v(0)),
    i_valu(v(0), &[v(6)]),
    i_exp(EXP_PARAM, v(0)),
    i_endpgm(),
  ]);
  b.finish()
}

/// Register-pressure bound program with stores in flight at the end.
fn test_vgpr_dealloc() -> Program {
  let mut b = ProgramBuilder::new(GfxLevel::Gfx11);
  b.config_mut().num_vgprs = 256;
  let scratch = MemorySyncInfo::new(STORAGE_SCRATCH, SEMANTIC_PRIVATE, SyncScope::Invocation);
  b.block(BLOCK_KIND_TOP_LEVEL, &[], 0, vec![
    i_global_store(v(2), v(0), scratch),
    i_global_store(v(4), v(1), MemorySyncInfo::storage(STORAGE_BUFFER)),
    i_endpgm(),
  ]);
  b.finish()
}

/// A shader part handing its registers to the next part.
fn test_end_with_regs() -> Program {
  let mut b = ProgramBuilder::new(GfxLevel::Gfx10_3);
  b.block(BLOCK_KIND_TOP_LEVEL | BLOCK_KIND_END_WITH_REGS, &[], 0, vec![
    i_buffer_load(v(0), v(10)),
    i_smem_load(s(20), s(4), 0),
    i_image_sample(v(4), v(12)),
  ]);
  b.finish()
}

/// Arguments still arriving from memory when the program starts.
fn test_pending_args() -> Program {
  let mut b = ProgramBuilder::new(GfxLevel::Gfx10);
  b.block(BLOCK_KIND_TOP_LEVEL, &[], 0, vec![
    i_valu(v(4), &[v(1)]),
    i_ds_read(v(5), v(4)),
    i_valu(v(6), &[v(5)]),
    i_endpgm(),
  ]);
  let mut program = b.finish();
  program.args_pending_vmem.push(def_n(v(0), 2));
  program.pending_lds_access = true;
  program
}

/// The oldest generation keeps reading store data after issue.
fn test_gfx6_store_data() -> Program {
  let mut b = ProgramBuilder::new(GfxLevel::Gfx6);
  b.block(BLOCK_KIND_TOP_LEVEL, &[], 0, vec![
    i_buffer_store(v(10), v(0)),
    i_valu(v(0), &[v(1)]),
    i_endpgm(),
  ]);
  b.finish()
}

/// The named programs built in code, in listing order.
fn all_programs() -> Vec<(&'static str, Program)> {
  vec![
    ("straight_line", test_straight_line()),
    ("loads_read_in_order", test_loads_read_in_order()),
    ("already_waited", test_already_waited()),
    ("simple_loop", test_simple_loop()),
    ("nested_loops", test_nested_loops()),
    ("divergent_if", test_divergent_if()),
    ("lds_barrier", test_lds_barrier()),
    ("exports", test_exports()),
    ("vgpr_dealloc", test_vgpr_dealloc()),
    ("end_with_regs", test_end_with_regs()),
    ("pending_args", test_pending_args()),
    ("gfx6_store_data", test_gfx6_store_data()),
  ]
}

fn ends_in_tilde(path: &PathBuf) -> bool {
  path.to_str().map_or(false, |name| name.ends_with('~'))
}

/// Test programs under `tests/`, by file stem.
fn test_files() -> Vec<(String, PathBuf)> {
  let mut files = Vec::new();
  let test_dir = Path::new("tests");
  match test_dir.read_dir() {
    Err(err) => {
      println!("can't read test directory: {}", err);
    }
    Ok(entries) => {
      for entry in entries.flatten() {
        let path = entry.path();
        // Skip editor backup files, which would shadow the real ones.
        if ends_in_tilde(&path) {
          continue;
        }
        if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
          files.push((stem.to_string(), path.clone()));
        }
      }
    }
  }
  files
}

/// The names of every available test program.
pub fn all_test_names() -> Vec<String> {
  let mut names: Vec<String> =
    all_programs().into_iter().map(|(name, _)| name.to_string()).collect();
  names.extend(test_files().into_iter().map(|(name, _)| name));
  names.sort();
  names
}

// This returns either the requested program or, if not found, a list of the
// available ones.  A test file that does not parse is reported by name.
pub fn find_program(name: &str) -> Result<Program, Vec<String>> {
  for (cand, program) in all_programs() {
    if cand == name {
      return Ok(program);
    }
  }

  for (stem, path) in test_files() {
    if stem == name {
      return match parser::parse_file(path) {
        Ok(program) => Ok(program),
        Err(err) => Err(vec![format!("{}: {}", name, err.to_string())]),
      };
    }
  }

  Err(all_test_names())
}
