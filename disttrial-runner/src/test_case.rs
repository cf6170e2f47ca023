// Copyright (c) The disttrial Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use smol_str::SmolStr;
use std::{borrow::Borrow, fmt};

/// An opaque, stable identifier for one test case.
///
/// Identifiers are produced by test discovery, which lives outside this crate. The coordinator
/// never interprets them: they are only passed to workers, which resolve them into something
/// runnable.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TestCaseRef(SmolStr);

impl TestCaseRef {
    /// The identifier used for errors that belong to the runner itself rather than to any one
    /// test case.
    pub const RUNNER: &'static str = "<runner>";

    /// Creates a new test case identifier.
    pub fn new(id: impl Into<SmolStr>) -> Self {
        Self(id.into())
    }

    /// Returns the placeholder test case that runner-level errors are recorded against.
    pub fn runner() -> Self {
        Self(SmolStr::new_static(Self::RUNNER))
    }

    /// Returns the identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TestCaseRef {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TestCaseRef {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl Borrow<str> for TestCaseRef {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestCaseRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for TestCaseRef {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for TestCaseRef {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
