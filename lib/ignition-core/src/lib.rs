//! Core lifecycle primitives.
//!
//! A [`Runner`] is a unit of background work with an asynchronous `start` and `stop`. Runners are produced by a
//! [`RunnerFactory`], and any number of factories can be combined with [`RunAll`] into a single factory whose runner
//! starts and stops every child concurrently.
#![deny(warnings)]
#![deny(missing_docs)]

mod run_all;
pub use self::run_all::{ChildFailure, Phase, RunAll, RunAllError};

mod runner;
pub use self::runner::{Runner, RunnerFactory};

pub mod task;
