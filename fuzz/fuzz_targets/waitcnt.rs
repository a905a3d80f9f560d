#![no_main]
use libfuzzer_sys::fuzz_target;

use waitcnt_util::fuzzing::FuzzProgram;
use waitcnt_util::test_framework::{print_program, run_waitcnt};

static mut COUNTER_GEN: usize = 0;
static mut COUNTER_OK: usize = 0;

fuzz_target!(|fuzz: FuzzProgram| {
    let (num_gen, num_ok) = unsafe {
        COUNTER_GEN += 1;
        (COUNTER_GEN, COUNTER_OK)
    };

    println!(
        "=== status: #ok/#total: {}/{} == {} ",
        num_ok,
        num_gen,
        100.0 * (num_ok as f64) / (num_gen as f64)
    );

    let original = fuzz.program.clone();
    let mut program = fuzz.program;

    let opts = waitcnt::WaitcntOptions {
        force_waitcnt: false,
        run_checker: true,
    };

    match run_waitcnt(&mut program, &opts) {
        Ok(_) => unsafe {
            COUNTER_OK += 1;
        },
        Err(err) => {
            print_program(&original, "input");
            panic!("fuzz_targets/waitcnt.rs: insert_waitcnt failed: {}", err);
        }
    }
});
