// Copyright (c) The disttrial Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{Reporter, TestFailure};
use crate::{
    TestCaseRef,
    helpers::{FormattedDuration, plural},
};
use owo_colors::{OwoColorize, Style};
use std::{
    io::{self, Write},
    time::Instant,
};

/// Counts of each outcome seen by a [`SummaryReporter`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RunStats {
    /// The number of tests started.
    pub run: usize,
    /// The number of tests that passed.
    pub successes: usize,
    /// The number of tests that failed.
    pub failures: usize,
    /// The number of tests that errored.
    pub errors: usize,
    /// The number of tests that were skipped.
    pub skips: usize,
    /// The number of tests that failed as expected.
    pub expected_failures: usize,
    /// The number of tests that were expected to fail but passed.
    pub unexpected_successes: usize,
}

impl RunStats {
    /// Returns true if no test failed or errored.
    pub fn is_success(&self) -> bool {
        self.failures == 0 && self.errors == 0
    }
}

/// A [`Reporter`] that writes one line per test, then a summary.
#[derive(Debug)]
pub struct SummaryReporter<W> {
    writer: W,
    styles: Styles,
    stats: RunStats,
    failures: Vec<(TestCaseRef, TestFailure)>,
    errors: Vec<(TestCaseRef, TestFailure)>,
    started_at: Instant,
    write_error: Option<io::Error>,
}

impl<W: Write> SummaryReporter<W> {
    /// Creates a reporter writing to `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            styles: Styles::default(),
            stats: RunStats::default(),
            failures: Vec::new(),
            errors: Vec::new(),
            started_at: Instant::now(),
            write_error: None,
        }
    }

    /// Enables ANSI colors in the output.
    pub fn colorize(&mut self) {
        self.styles.colorize();
    }

    /// Returns the counts seen so far.
    pub fn stats(&self) -> RunStats {
        self.stats
    }

    /// Returns the tests that failed, with their failures.
    pub fn failures(&self) -> &[(TestCaseRef, TestFailure)] {
        &self.failures
    }

    /// Returns the tests that errored, with their errors.
    pub fn errors(&self) -> &[(TestCaseRef, TestFailure)] {
        &self.errors
    }

    /// Consumes `self`, returning the writer.
    pub fn into_writer(self) -> W {
        self.writer
    }

    fn write_status(&mut self, test: &TestCaseRef, status: &str, style: Style) {
        let result = writeln!(self.writer, "{test} ... [{}]", status.style(style));
        self.record(result);
    }

    fn record(&mut self, result: io::Result<()>) {
        if let Err(error) = result
            && self.write_error.is_none()
        {
            self.write_error = Some(error);
        }
    }

    fn write_details(&mut self) -> io::Result<()> {
        let separator = "=".repeat(70);
        for (label, items) in [("FAIL", &self.failures), ("ERROR", &self.errors)] {
            for (test, failure) in items {
                writeln!(self.writer, "{separator}")?;
                writeln!(self.writer, "[{}]", label.style(self.styles.fail))?;
                writeln!(self.writer, "{failure}")?;
                writeln!(self.writer)?;
                writeln!(self.writer, "{test}")?;
            }
        }
        Ok(())
    }

    fn write_summary(&mut self) -> io::Result<()> {
        let stats = self.stats;
        writeln!(self.writer, "{}", "-".repeat(70))?;
        writeln!(
            self.writer,
            "Ran {} {} in {}",
            stats.run.style(self.styles.count),
            plural::tests_str(stats.run),
            FormattedDuration(self.started_at.elapsed()),
        )?;
        writeln!(self.writer)?;

        let counts: Vec<_> = [
            ("skips", stats.skips),
            ("expectedFailures", stats.expected_failures),
            ("failures", stats.failures),
            ("errors", stats.errors),
            ("unexpectedSuccesses", stats.unexpected_successes),
            ("successes", stats.successes),
        ]
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(name, count)| format!("{name}={count}"))
        .collect();

        let (verdict, style) = if stats.is_success() {
            ("PASSED", self.styles.pass)
        } else {
            ("FAILED", self.styles.fail)
        };
        write!(self.writer, "{}", verdict.style(style))?;
        if !counts.is_empty() {
            write!(self.writer, " ({})", counts.join(", "))?;
        }
        writeln!(self.writer)?;
        self.writer.flush()
    }
}

impl<W: Write> Reporter for SummaryReporter<W> {
    fn start_test(&mut self, _test: &TestCaseRef) {
        self.stats.run += 1;
    }

    fn add_success(&mut self, test: &TestCaseRef) {
        self.stats.successes += 1;
        self.write_status(test, "OK", self.styles.pass);
    }

    fn add_error(&mut self, test: &TestCaseRef, error: TestFailure) {
        self.stats.errors += 1;
        self.write_status(test, "ERROR", self.styles.fail);
        self.errors.push((test.clone(), error));
    }

    fn add_failure(&mut self, test: &TestCaseRef, failure: TestFailure) {
        self.stats.failures += 1;
        self.write_status(test, "FAIL", self.styles.fail);
        self.failures.push((test.clone(), failure));
    }

    fn add_skip(&mut self, test: &TestCaseRef, reason: String) {
        self.stats.skips += 1;
        self.write_status(test, "SKIPPED", self.styles.skip);
        let result = writeln!(self.writer, "    {reason}");
        self.record(result);
    }

    fn add_expected_failure(&mut self, test: &TestCaseRef, _error: String, todo: String) {
        self.stats.expected_failures += 1;
        self.write_status(test, "TODO", self.styles.skip);
        let result = writeln!(self.writer, "    {todo}");
        self.record(result);
    }

    fn add_unexpected_success(&mut self, test: &TestCaseRef, todo: String) {
        self.stats.unexpected_successes += 1;
        self.write_status(test, "UNEXPECTED SUCCESS", self.styles.skip);
        let result = writeln!(self.writer, "    {todo}");
        self.record(result);
    }

    fn stop_test(&mut self, _test: &TestCaseRef) {}

    fn was_successful(&self) -> bool {
        self.stats.is_success()
    }

    fn done(&mut self) -> io::Result<()> {
        if let Some(error) = self.write_error.take() {
            return Err(error);
        }
        self.write_details()?;
        self.write_summary()
    }
}

#[derive(Clone, Debug, Default)]
struct Styles {
    count: Style,
    pass: Style,
    fail: Style,
    skip: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.count = Style::new().bold();
        self.pass = Style::new().green().bold();
        self.fail = Style::new().red().bold();
        self.skip = Style::new().yellow().bold();
    }
}
