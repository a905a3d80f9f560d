/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use log::{error, info};
use serde::{Deserialize, Serialize};

use waitcnt::{Program, WaitcntOptions};
use waitcnt_util::test_framework::{print_program, run_waitcnt};
use waitcnt_util::{parser, test_cases};

/// A program saved for later runs, e.g. as a fuzz corpus entry.
#[derive(Serialize, Deserialize)]
struct ProgramImage {
  version: u32,
  program: Program,
}

const IMAGE_VERSION: u32 = 1;

fn load_image(path: &str) -> Result<Program, String> {
  let file = File::open(path).map_err(|err| format!("can't open {}: {}", path, err))?;
  let image: ProgramImage = bincode::deserialize_from(BufReader::new(file))
    .map_err(|err| format!("can't decode {}: {}", path, err))?;
  if image.version != IMAGE_VERSION {
    return Err(format!("{}: unsupported image version {}", path, image.version));
  }
  Ok(image.program)
}

fn save_image(path: &str, program: &Program) -> Result<(), String> {
  let file = File::create(path).map_err(|err| format!("can't create {}: {}", path, err))?;
  let image = ProgramImage { version: IMAGE_VERSION, program: program.clone() };
  bincode::serialize_into(BufWriter::new(file), &image)
    .map_err(|err| format!("can't write {}: {}", path, err))
}

//=============================================================================
// Top level

fn main() {
  pretty_env_logger::init();

  let app = clap::App::new("waitcnt-util")
    .about("a simple program to allow separate testing of the waitcnt pass")
    .arg(
      clap::Arg::new("test")
        .short('t')
        .takes_value(true)
        .help("test case name"),
    )
    .arg(
      clap::Arg::new("file")
        .short('f')
        .takes_value(true)
        .help("program in text format"),
    )
    .arg(
      clap::Arg::new("binary")
        .short('b')
        .takes_value(true)
        .help("program image in binary format"),
    )
    .arg(
      clap::Arg::new("output")
        .short('o')
        .takes_value(true)
        .help("save the input program as a binary image"),
    )
    .arg(
      clap::Arg::new("force-waitcnt")
        .long("force-waitcnt")
        .help("wait for everything before every instruction"),
    )
    .arg(
      clap::Arg::new("check")
        .long("check")
        .help("run the checker on the result"),
    )
    .group(
      clap::ArgGroup::new("input")
        .args(&["test", "file", "binary"])
        .required(true),
    );
  let matches = app.get_matches();

  let program = if let Some(name) = matches.value_of("test") {
    match test_cases::find_program(name) {
      Ok(program) => program,
      Err(available_names) => {
        error!("can't find program with name '{}'", name);
        println!("available program names are:");
        for name in available_names {
          println!("     {}", name);
        }
        return;
      }
    }
  } else if let Some(path) = matches.value_of("file") {
    match parser::parse_file(PathBuf::from(path)) {
      Ok(program) => program,
      Err(err) => {
        println!("{}: {}", path, err.to_string());
        return;
      }
    }
  } else if let Some(path) = matches.value_of("binary") {
    match load_image(path) {
      Ok(program) => program,
      Err(err) => {
        println!("{}", err);
        return;
      }
    }
  } else {
    println!("no input program given");
    return;
  };

  if let Some(path) = matches.value_of("output") {
    if let Err(err) = save_image(path, &program) {
      println!("{}", err);
      return;
    }
    info!("saved program image to {}", path);
  }

  let opts = WaitcntOptions {
    force_waitcnt: matches.is_present("force-waitcnt"),
    run_checker: matches.is_present("check"),
  };

  print_program(&program, "before insert_waitcnt");

  let mut program = program;
  match run_waitcnt(&mut program, &opts) {
    Ok(result) => {
      print_program(&program, "after insert_waitcnt");
      println!("");
      println!(
        "{} waits inserted, {} block visits",
        result.num_waits_inserted, result.num_block_visits
      );
    }
    Err(err) => {
      println!("insert_waitcnt failed: {}", err);
    }
  }
}

#[cfg(test)]
mod test_utils {
  use super::*;
  use waitcnt::WaitcntResult;

  /// Runs the pass with the checker over a named program.
  pub fn check(name: &str) -> (Program, WaitcntResult) {
    let _ = pretty_env_logger::try_init();
    let mut program = test_cases::find_program(name)
      .unwrap_or_else(|names| panic!("no test program {}, have {:?}", name, names));
    let opts = WaitcntOptions { force_waitcnt: false, run_checker: true };
    let result = run_waitcnt(&mut program, &opts).unwrap_or_else(|err| {
      print_program(&program, name);
      panic!("insert_waitcnt failed on {}: {}", name, err);
    });
    (program, result)
  }

  /// Also checks that the pass is stable on its own output.
  pub fn check_stable(name: &str) -> (Program, WaitcntResult) {
    let (program, result) = check(name);
    let mut again = program.clone();
    let opts = WaitcntOptions { force_waitcnt: false, run_checker: true };
    let second = run_waitcnt(&mut again, &opts).unwrap();
    assert_eq!(second.num_waits_inserted, 0, "{}", name);
    if let Err(diff) = waitcnt_util::test_framework::compare_programs(&program, &again) {
      panic!("{}: second run changed the program: {}", name, diff);
    }
    (program, result)
  }
}

#[cfg(test)]
mod tests {
  use super::test_utils::*;
  use waitcnt::{DepctrWait, InstrKind, Opcode, WaitImm, WaitType};
  use waitcnt_util::test_framework::{strip_waits, waits_of};

  fn imm(counters: &[(WaitType, u16)]) -> WaitImm {
    let mut imm = WaitImm::new();
    for (ty, value) in counters {
      imm[*ty] = *value;
    }
    imm
  }

  #[test]
  fn straight_line() {
    let (program, result) = check_stable("straight_line");
    assert_eq!(
      waits_of(&program),
      vec![
        (0, 3, imm(&[(WaitType::Vm, 1)])),
        (0, 5, imm(&[(WaitType::Lgkm, 0)])),
        (0, 7, imm(&[(WaitType::Vm, 0)])),
      ]
    );
    assert_eq!(result.num_waits_inserted, 3);
    assert_eq!(result.num_block_visits, 1);
  }

  #[test]
  fn loads_read_in_order() {
    // Each read waits only until its own load has completed. Nothing is
    // inserted between the two loads.
    let (program, result) = check_stable("loads_read_in_order");
    assert_eq!(
      waits_of(&program),
      vec![(0, 2, imm(&[(WaitType::Vm, 1)])), (0, 4, imm(&[(WaitType::Vm, 0)]))]
    );
    assert_eq!(result.num_waits_inserted, 2);
  }

  #[test]
  fn already_waited() {
    let original = waitcnt_util::test_cases::find_program("already_waited").unwrap();
    let (program, result) = check("already_waited");
    assert_eq!(result.num_waits_inserted, 0);
    assert_eq!(program, original);
  }

  #[test]
  fn simple_loop() {
    let (program, _) = check_stable("simple_loop");
    assert_eq!(
      waits_of(&program),
      vec![(1, 0, imm(&[(WaitType::Vm, 0)])), (3, 0, imm(&[(WaitType::Vm, 0)]))]
    );
  }

  #[test]
  fn nested_loops() {
    let (program, result) = check("nested_loops");
    let num_blocks = program.blocks.len();
    assert!(result.num_block_visits <= num_blocks * num_blocks);
  }

  #[test]
  fn divergent_if() {
    let (program, _) = check("divergent_if");
    assert!(waits_of(&program).iter().any(|(block, _, imm)| *block == 6 && imm[WaitType::Vm] == 0));
  }

  #[test]
  fn lds_barrier() {
    let (program, _) = check("lds_barrier");
    let instrs = &program.blocks[0].instructions;
    assert_eq!(instrs[1].kind, InstrKind::Waitcnt(imm(&[(WaitType::Lgkm, 0)])));
    assert_eq!(instrs[2].opcode, Opcode::SBarrier);
    // The pseudo barrier is gone.
    assert!(instrs.iter().all(|instr| instr.opcode != Opcode::PBarrier));
  }

  #[test]
  fn exports() {
    let (program, _) = check_stable("exports");
    assert_eq!(waits_of(&program), vec![(0, 2, imm(&[(WaitType::Exp, 0)]))]);
  }

  #[test]
  fn vgpr_dealloc() {
    // The release message is derived again when the pass sees it.
    let (program, _) = check_stable("vgpr_dealloc");
    let instrs = &program.blocks[0].instructions;
    assert_eq!(instrs.len(), 5);
    assert_eq!(instrs[2].kind, InstrKind::Waitcnt(imm(&[(WaitType::Vs, 1)])));
    assert_eq!(instrs[3].opcode, Opcode::SSendmsg);
    assert_eq!(instrs[4].opcode, Opcode::SEndpgm);
  }

  #[test]
  fn end_with_regs() {
    let (program, _) = check_stable("end_with_regs");
    assert_eq!(
      waits_of(&program),
      vec![(0, 3, imm(&[(WaitType::Vm, 0), (WaitType::Lgkm, 0)]))]
    );
  }

  #[test]
  fn pending_args() {
    let (program, _) = check("pending_args");
    assert_eq!(
      waits_of(&program),
      vec![(0, 0, imm(&[(WaitType::Vm, 0)])), (0, 3, imm(&[(WaitType::Lgkm, 0)]))]
    );
  }

  #[test]
  fn gfx6_store_data() {
    let (program, _) = check("gfx6_store_data");
    assert_eq!(waits_of(&program), vec![(0, 1, imm(&[(WaitType::Exp, 0)]))]);
  }

  #[test]
  fn interp() {
    let (program, _) = check("interp");
    assert!(waits_of(&program).is_empty());
    assert_eq!(program.blocks[0].instructions[1].kind, InstrKind::VinterpInreg { wait_exp: 0 });
  }

  #[test]
  fn flat_lds() {
    let (program, _) = check("flat_lds");
    assert_eq!(
      waits_of(&program),
      vec![(0, 2, imm(&[(WaitType::Lgkm, 0), (WaitType::Vm, 0)]))]
    );
  }

  #[test]
  fn sample_gfx12() {
    let (program, _) = check("sample_gfx12");
    assert_eq!(
      waits_of(&program),
      vec![(0, 2, imm(&[(WaitType::Vm, 0), (WaitType::Sample, 0)]))]
    );
  }

  #[test]
  fn uniform_loop() {
    let (program, _) = check_stable("uniform_loop");
    assert_eq!(
      waits_of(&program),
      vec![(1, 0, imm(&[(WaitType::Vm, 0)])), (3, 0, imm(&[(WaitType::Vm, 0)]))]
    );
  }

  #[test]
  fn depctr_folding() {
    let (program, result) = check("depctr");
    assert_eq!(result.num_waits_inserted, 0);
    let mut expected = DepctrWait::new();
    assert!(expected.set_field("va_vdst", 0));
    assert!(expected.set_field("vm_vsrc", 0));
    let instrs = &program.blocks[0].instructions;
    assert_eq!(instrs.len(), 4);
    assert_eq!(instrs[1].kind, InstrKind::Depctr(expected));
  }

  #[test]
  fn force_waitcnt_drains_before_everything() {
    let _ = pretty_env_logger::try_init();
    let mut program = waitcnt_util::test_cases::find_program("straight_line").unwrap();
    let opts = waitcnt::WaitcntOptions { force_waitcnt: true, run_checker: true };
    waitcnt_util::test_framework::run_waitcnt(&mut program, &opts).unwrap();
    let instrs = &program.blocks[0].instructions;
    // Every memory access is waited for right after it issued.
    for (i, instr) in instrs.iter().enumerate() {
      if instr.definitions.is_empty() || i + 1 == instrs.len() {
        continue;
      }
      if matches!(instr.kind, InstrKind::Vmem(_) | InstrKind::Smem(_)) {
        assert!(matches!(instrs[i + 1].kind, InstrKind::Waitcnt(_)), "after {:?}", instr);
      }
    }
  }

  #[test]
  fn rerun_after_stripping() {
    for name in waitcnt_util::test_cases::all_test_names() {
      let (program, _) = check(&name);
      let mut stripped = program.clone();
      strip_waits(&mut stripped);
      let opts = waitcnt::WaitcntOptions { force_waitcnt: false, run_checker: true };
      if let Err(err) = waitcnt_util::test_framework::run_waitcnt(&mut stripped, &opts) {
        panic!("{} without waits: {}", name, err);
      }
    }
  }
}
