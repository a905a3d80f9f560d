#![no_main]
use libfuzzer_sys::fuzz_target;

use waitcnt::checker;
use waitcnt_util::fuzzing::FuzzProgram;
use waitcnt_util::test_framework::{print_program, strip_waits};
use waitcnt_util::validator::validate;

fuzz_target!(|fuzz: FuzzProgram| {
    let mut program = fuzz.program;
    if let Err(err) = validate(&program) {
        print_program(&program, "generated");
        panic!("generated an invalid program: {}", err);
    }

    // Waiting for everything everywhere is always enough.
    strip_waits(&mut program);
    let opts = waitcnt::WaitcntOptions {
        force_waitcnt: true,
        run_checker: false,
    };
    if let Err(err) = waitcnt::insert_waitcnt_with_opts(&mut program, &opts) {
        panic!("insert_waitcnt failed: {}", err);
    }
    if let Err(errors) = checker::check(&program) {
        print_program(&program, "forced waits");
        panic!("checker rejected forced waits: {:?}", errors);
    }
});
