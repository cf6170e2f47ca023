// Copyright (c) The disttrial Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{Reporter, ResultSink, TestFailure};
use crate::{TestCaseRef, errors::ReporterError};
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};
use tracing::debug;

/// Buffers per-test events from concurrent workers and replays each test's events as one block.
///
/// Every call between `start_test` and `stop_test` for a test is queued. `stop_test` replays the
/// queue against the wrapped [`Reporter`] in arrival order, so the reporter never sees two tests'
/// events interleaved.
#[derive(Debug)]
pub struct DistReporter<R> {
    inner: Mutex<Inner<R>>,
}

#[derive(Debug)]
struct Inner<R> {
    reporter: R,
    running: HashMap<TestCaseRef, Vec<PendingCall>>,
}

#[derive(Debug)]
enum PendingCall {
    Start,
    Success,
    Error(TestFailure),
    Failure(TestFailure),
    Skip(String),
    ExpectedFailure { error: String, todo: String },
    UnexpectedSuccess { todo: String },
    Stop,
}

impl PendingCall {
    fn replay<R: Reporter>(self, reporter: &mut R, test: &TestCaseRef) {
        match self {
            Self::Start => reporter.start_test(test),
            Self::Success => reporter.add_success(test),
            Self::Error(error) => reporter.add_error(test, error),
            Self::Failure(failure) => reporter.add_failure(test, failure),
            Self::Skip(reason) => reporter.add_skip(test, reason),
            Self::ExpectedFailure { error, todo } => {
                reporter.add_expected_failure(test, error, todo)
            }
            Self::UnexpectedSuccess { todo } => reporter.add_unexpected_success(test, todo),
            Self::Stop => reporter.stop_test(test),
        }
    }
}

impl<R: Reporter> DistReporter<R> {
    /// Wraps a reporter.
    pub fn new(reporter: R) -> Self {
        Self {
            inner: Mutex::new(Inner {
                reporter,
                running: HashMap::new(),
            }),
        }
    }

    /// Records an error as a test of its own, such as the `<runner>` placeholder or a case the
    /// sink rejected. The error is passed to the wrapped reporter immediately as one
    /// start, error and stop block.
    pub fn add_runner_error(&self, test: &TestCaseRef, error: TestFailure) {
        let mut inner = self.lock();
        debug!(test_case = %test, "recording runner error");
        inner.reporter.start_test(test);
        inner.reporter.add_error(test, error);
        inner.reporter.stop_test(test);
    }

    /// Returns true if the wrapped reporter has seen no failures or errors.
    pub fn was_successful(&self) -> bool {
        self.lock().reporter.was_successful()
    }

    /// Returns the number of tests that are started but not stopped.
    pub fn running_count(&self) -> usize {
        self.lock().running.len()
    }

    /// Consumes `self`, returning the wrapped reporter.
    ///
    /// Events for tests that were never stopped are discarded.
    pub fn into_inner(self) -> R {
        let inner = self.inner.into_inner().unwrap_or_else(PoisonError::into_inner);
        if !inner.running.is_empty() {
            debug!(
                count = inner.running.len(),
                "discarding events for tests that never stopped"
            );
        }
        inner.reporter
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<R>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, test: &TestCaseRef, call: PendingCall) -> Result<(), ReporterError> {
        let mut inner = self.lock();
        let queue = inner
            .running
            .get_mut(test)
            .ok_or_else(|| ReporterError::NotStarted { test: test.clone() })?;
        queue.push(call);
        Ok(())
    }
}

impl<R: Reporter> ResultSink for DistReporter<R> {
    fn start_test(&self, test: &TestCaseRef) -> Result<(), ReporterError> {
        let mut inner = self.lock();
        if inner.running.contains_key(test) {
            return Err(ReporterError::AlreadyStarted { test: test.clone() });
        }
        inner.running.insert(test.clone(), vec![PendingCall::Start]);
        Ok(())
    }

    fn add_success(&self, test: &TestCaseRef) -> Result<(), ReporterError> {
        self.push(test, PendingCall::Success)
    }

    fn add_error(&self, test: &TestCaseRef, error: TestFailure) -> Result<(), ReporterError> {
        self.push(test, PendingCall::Error(error))
    }

    fn add_failure(&self, test: &TestCaseRef, failure: TestFailure) -> Result<(), ReporterError> {
        self.push(test, PendingCall::Failure(failure))
    }

    fn add_skip(&self, test: &TestCaseRef, reason: String) -> Result<(), ReporterError> {
        self.push(test, PendingCall::Skip(reason))
    }

    fn add_expected_failure(
        &self,
        test: &TestCaseRef,
        error: String,
        todo: String,
    ) -> Result<(), ReporterError> {
        self.push(test, PendingCall::ExpectedFailure { error, todo })
    }

    fn add_unexpected_success(
        &self,
        test: &TestCaseRef,
        todo: String,
    ) -> Result<(), ReporterError> {
        self.push(test, PendingCall::UnexpectedSuccess { todo })
    }

    fn stop_test(&self, test: &TestCaseRef) -> Result<(), ReporterError> {
        let mut inner = self.lock();
        let mut queue = inner
            .running
            .remove(test)
            .ok_or_else(|| ReporterError::NotStarted { test: test.clone() })?;
        queue.push(PendingCall::Stop);
        for call in queue {
            call.replay(&mut inner.reporter, test);
        }
        Ok(())
    }
}
