// Copyright (c) The disttrial Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests
//!
//! These run the built `disttrial` binary, which spawns copies of itself as workers. Test cases are
//! shell commands, so the tests only run on Unix.

#![cfg(unix)]

mod fixtures;
mod pool;
mod run;
