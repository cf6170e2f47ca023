// Copyright (c) The disttrial Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Aggregates test outcomes reported by workers.
//!
//! Outcomes flow from a [`WorkerConnection`](crate::connection::WorkerConnection) into a
//! [`ResultSink`]. The sink used during a run is a [`DistReporter`], which serializes interleaved
//! events from concurrent workers into one block of calls per test on the final [`Reporter`].

mod dist;
mod summary;

pub use dist::DistReporter;
pub use summary::{RunStats, SummaryReporter};

use crate::{TestCaseRef, errors::ReporterError};
use std::{fmt, io};

/// One entry of a stack trace attached to a failure.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    /// The function name.
    pub function: String,
    /// The file the function is defined in.
    pub file: String,
    /// The line number within the file.
    pub line: u32,
}

/// A structured error or failure: what went wrong, and where.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestFailure {
    /// The type name of the error, e.g. `ExitStatus`.
    pub type_name: String,
    /// The error message.
    pub message: String,
    /// The stack frames, innermost last.
    pub frames: Vec<Frame>,
}

impl TestFailure {
    /// Creates a failure with no stack frames.
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            frames: Vec::new(),
        }
    }

    /// Adds stack frames to the failure.
    pub fn with_frames(mut self, frames: Vec<Frame>) -> Self {
        self.frames = frames;
        self
    }

    /// Creates a failure describing an error, including its chain of sources.
    pub fn from_error(type_name: impl Into<String>, error: &dyn std::error::Error) -> Self {
        let mut message = error.to_string();
        let mut source = error.source();
        while let Some(error) = source {
            message.push_str("\ncaused by: ");
            message.push_str(&error.to_string());
            source = error.source();
        }
        Self::new(type_name, message)
    }
}

impl fmt::Display for TestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.frames.is_empty() {
            writeln!(f, "Traceback (most recent call last):")?;
            for frame in &self.frames {
                writeln!(
                    f,
                    "  File \"{}\", line {}, in {}",
                    frame.file, frame.line, frame.function
                )?;
            }
        }
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

/// The final consumer of test outcomes.
///
/// Reporters are not reentrant: calls for one test arrive as one contiguous block bracketed by
/// `start_test` and `stop_test`.
pub trait Reporter {
    /// A test started.
    fn start_test(&mut self, test: &TestCaseRef);

    /// A test passed.
    fn add_success(&mut self, test: &TestCaseRef);

    /// A test raised an error.
    fn add_error(&mut self, test: &TestCaseRef, error: TestFailure);

    /// A test failed.
    fn add_failure(&mut self, test: &TestCaseRef, failure: TestFailure);

    /// A test was skipped.
    fn add_skip(&mut self, test: &TestCaseRef, reason: String);

    /// A test that is expected to fail did fail.
    fn add_expected_failure(&mut self, test: &TestCaseRef, error: String, todo: String);

    /// A test that is expected to fail passed.
    fn add_unexpected_success(&mut self, test: &TestCaseRef, todo: String);

    /// A test finished.
    fn stop_test(&mut self, test: &TestCaseRef);

    /// Returns true if no test has failed or errored so far.
    fn was_successful(&self) -> bool;

    /// Called once after every test in a pass has finished.
    fn done(&mut self) -> io::Result<()>;
}

/// A sink that can be shared between concurrently driven workers.
pub trait ResultSink {
    /// A test started.
    fn start_test(&self, test: &TestCaseRef) -> Result<(), ReporterError>;

    /// A test passed.
    fn add_success(&self, test: &TestCaseRef) -> Result<(), ReporterError>;

    /// A test raised an error.
    fn add_error(&self, test: &TestCaseRef, error: TestFailure) -> Result<(), ReporterError>;

    /// A test failed.
    fn add_failure(&self, test: &TestCaseRef, failure: TestFailure) -> Result<(), ReporterError>;

    /// A test was skipped.
    fn add_skip(&self, test: &TestCaseRef, reason: String) -> Result<(), ReporterError>;

    /// A test that is expected to fail did fail.
    fn add_expected_failure(
        &self,
        test: &TestCaseRef,
        error: String,
        todo: String,
    ) -> Result<(), ReporterError>;

    /// A test that is expected to fail passed.
    fn add_unexpected_success(&self, test: &TestCaseRef, todo: String)
    -> Result<(), ReporterError>;

    /// A test finished.
    fn stop_test(&self, test: &TestCaseRef) -> Result<(), ReporterError>;
}
