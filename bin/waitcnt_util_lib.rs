//! Test harness for the waitcnt pass: a text format for programs, named test
//! cases, a structural validator and fuzzing support.

pub mod fuzzing;
pub mod parser;
pub mod test_cases;
pub mod test_framework;
pub mod validator;
