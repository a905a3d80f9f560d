/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Main file / top-level module for the waitcnt library.
//!
//! The pass inserts `s_waitcnt` instructions into register-allocated GPU
//! machine code, so that no instruction reads or overwrites a register while
//! an asynchronous memory access, export or message involving it may still
//! be in flight.

// Make the checker module public for fuzzing.
#[cfg(feature = "fuzzing")]
pub mod checker;
#[cfg(not(feature = "fuzzing"))]
mod checker;

mod block;
mod context;
mod driver;
mod interface;
mod ir;
mod target;
mod update;
mod wait_imm;

pub use crate::interface::*;
