// Copyright (c) The disttrial Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runs test cases in parallel across a pool of local worker processes.
//!
//! The heavy lifting is done by [`disttrial_runner`]; this crate provides the command-line
//! interface and the worker entry point.

#![warn(missing_docs)]

mod dispatch;
mod errors;
mod output;
mod worker;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
