#![no_main]
use libfuzzer_sys::fuzz_target;

use waitcnt_util::fuzzing::FuzzProgram;
use waitcnt_util::test_framework::{compare_programs, print_program, run_waitcnt};

fuzz_target!(|fuzz: FuzzProgram| {
    let opts = waitcnt::WaitcntOptions {
        force_waitcnt: false,
        run_checker: false,
    };

    let mut once = fuzz.program;
    if let Err(err) = run_waitcnt(&mut once, &opts) {
        panic!("first run failed: {}", err);
    }

    let mut twice = once.clone();
    let result = match run_waitcnt(&mut twice, &opts) {
        Ok(result) => result,
        Err(err) => panic!("second run failed: {}", err),
    };

    if let Err(diff) = compare_programs(&once, &twice) {
        print_program(&once, "after one run");
        print_program(&twice, "after two runs");
        panic!("fuzz_targets/idempotence.rs: {}", diff);
    }
    assert_eq!(result.num_waits_inserted, 0);
});
