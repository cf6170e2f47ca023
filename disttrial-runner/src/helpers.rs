// Copyright (c) The disttrial Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! General support code for disttrial-runner.

use std::{fmt, time::Duration};

/// Utilities for pluralizing various words based on count.
pub(crate) mod plural {
    /// Returns "test" if `count` is 1, otherwise "tests".
    pub(crate) fn tests_str(count: usize) -> &'static str {
        if count == 1 { "test" } else { "tests" }
    }

    /// Returns "worker" if `count` is 1, otherwise "workers".
    pub(crate) fn workers_str(count: usize) -> &'static str {
        if count == 1 { "worker" } else { "workers" }
    }
}

/// Returns the name of the environment variable used for searching for
/// dynamic libraries.
pub(crate) fn dylib_path_envvar() -> &'static str {
    if cfg!(windows) {
        "PATH"
    } else if cfg!(target_os = "macos") {
        // DYLD_LIBRARY_PATH is searched before the install path and has a
        // significant performance penalty, so use the fallback variable.
        "DYLD_FALLBACK_LIBRARY_PATH"
    } else {
        "LD_LIBRARY_PATH"
    }
}

#[derive(Debug)]
pub(crate) struct FormattedDuration(pub(crate) Duration);

impl fmt::Display for FormattedDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}s", self.0.as_secs_f64())
    }
}
