#![no_main]
use libfuzzer_sys::fuzz_target;

use waitcnt_util::fuzzing::FuzzProgram;
use waitcnt_util::parser;
use waitcnt_util::test_framework::print_program;

fuzz_target!(|fuzz: FuzzProgram| {
  print_program(&fuzz.program, "generated program");

  let printed = format!("{:?}", fuzz.program);
  let parsed = match parser::parse_content(&printed) {
    Ok(program) => program,
    Err(err) => panic!("parser error: {}", err.to_string()),
  };
  assert!(parsed == fuzz.program);

  let reprinted = format!("{:?}", parsed);
  assert_eq!(printed, reprinted);
});
