// Copyright (c) The disttrial Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for disttrial, a coordinator that runs test cases across a pool of local
//! worker processes.
//!
//! The basic flow is:
//!
//! 1. A [`runner::DistTrialRunner`] starts a [`pool::WorkerPool`], which locks a working directory
//!    and spawns one [`worker_process::WorkerProcess`] per worker.
//! 2. Each worker process is driven through a [`connection::WorkerConnection`], which speaks the
//!    control [`protocol`] over dedicated pipes.
//! 3. Results reported by workers flow through a [`reporter::DistReporter`], which serializes
//!    interleaved per-test events into the final [`reporter::Reporter`].
//!
//! The worker side of the protocol lives in [`worker`].

pub mod config;
pub mod connection;
pub mod errors;
mod helpers;
pub mod pool;
pub mod protocol;
pub mod reporter;
pub mod runner;
pub mod stream;
mod test_case;
pub mod test_log;
pub mod worker;
pub mod worker_process;

pub use test_case::TestCaseRef;
