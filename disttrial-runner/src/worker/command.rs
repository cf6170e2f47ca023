// Copyright (c) The disttrial Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{TestExecutor, TestReport};
use crate::{TestCaseRef, reporter::TestFailure};
use camino::{Utf8Path, Utf8PathBuf};
use std::{io, process::Stdio};
use tracing::debug;

/// Test cases with this prefix are expected to fail.
pub const TODO_PREFIX: &str = "todo:";

/// The exit code a command uses to mark itself as skipped.
pub const SKIP_EXIT_CODE: i32 = 77;

/// Runs each test case as a command line.
///
/// The case identifier is split into arguments with shell quoting rules and run in the worker's
/// directory. Standard output is copied into the test log line by line.
///
/// | Result | Outcome |
/// |---|---|
/// | exit code 0 | success |
/// | exit code 77 | skip, with the last line of standard output as the reason |
/// | any other exit code | failure of class `ExitStatus`, with standard error as the message |
/// | killed by a signal | error of class `Signal` |
/// | could not be run | error of class `SpawnError` |
///
/// Cases prefixed with `todo:` are expected to fail: failures and errors are reported as expected
/// failures, and successes as unexpected successes.
///
/// An optional wrapper is prepended to every command line, so `nice -n5` as a wrapper runs the case
/// `true` as `nice -n5 true`.
#[derive(Clone, Debug, Default)]
pub struct CommandExecutor {
    directory: Option<Utf8PathBuf>,
    wrapper: Vec<String>,
}

impl CommandExecutor {
    /// Creates a new executor that runs commands in the current directory until started.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the program and arguments every command line is run under.
    pub fn with_wrapper(mut self, wrapper: Vec<String>) -> Self {
        self.wrapper = wrapper;
        self
    }
}

#[derive(Debug)]
enum Outcome {
    Success,
    Skip(String),
    Failure(TestFailure),
    Error(TestFailure),
}

impl TestExecutor for CommandExecutor {
    fn start(&mut self, directory: &Utf8Path) -> io::Result<()> {
        if !directory.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("`{directory}` is not a directory"),
            ));
        }
        self.directory = Some(directory.to_owned());
        Ok(())
    }

    async fn run(&mut self, case: &TestCaseRef, report: &mut impl TestReport) {
        let (todo, command_line) = match case.as_str().strip_prefix(TODO_PREFIX) {
            Some(rest) => (true, rest),
            None => (false, case.as_str()),
        };

        let outcome = match self.execute(command_line, report).await {
            Ok(outcome) => outcome,
            Err(error) => {
                // The command never ran, so it can't be expected to fail.
                report.add_error(&error).await;
                return;
            }
        };

        match (outcome, todo) {
            (Outcome::Success, false) => report.add_success().await,
            (Outcome::Success, true) => report.add_unexpected_success(None).await,
            (Outcome::Skip(reason), _) => report.add_skip(&reason).await,
            (Outcome::Failure(failure), false) => report.add_failure(&failure).await,
            (Outcome::Error(error), false) => report.add_error(&error).await,
            (Outcome::Failure(error) | Outcome::Error(error), true) => {
                report.add_expected_failure(&error, None).await
            }
        }
    }
}

impl CommandExecutor {
    async fn execute(
        &self,
        command_line: &str,
        report: &mut impl TestReport,
    ) -> Result<Outcome, TestFailure> {
        let argv = shell_words::split(command_line)
            .map_err(|error| TestFailure::from_error("SpawnError", &error))?;
        if argv.is_empty() {
            return Err(TestFailure::new("SpawnError", "empty command line"));
        }
        let argv: Vec<_> = self.wrapper.iter().chain(&argv).collect();
        let (program, args) = (argv[0], &argv[1..]);

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(directory) = &self.directory {
            cmd.current_dir(directory);
        }

        debug!(%program, "running command");
        let output = cmd.output().await.map_err(|error| {
            TestFailure::new("SpawnError", format!("failed to run `{program}`: {error}"))
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            report.test_write(line).await;
        }
        let stderr = String::from_utf8_lossy(&output.stderr);

        Ok(match output.status.code() {
            Some(0) => Outcome::Success,
            Some(SKIP_EXIT_CODE) => Outcome::Skip(
                stdout
                    .lines()
                    .rev()
                    .find(|line| !line.trim().is_empty())
                    .unwrap_or("skipped")
                    .to_owned(),
            ),
            Some(code) => {
                let stderr = stderr.trim_end();
                let message = if stderr.is_empty() {
                    format!("exited with code {code}")
                } else {
                    stderr.to_owned()
                };
                Outcome::Failure(TestFailure::new("ExitStatus", message))
            }
            None => Outcome::Error(TestFailure::new(
                "Signal",
                abnormal_exit_message(&output.status),
            )),
        })
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn abnormal_exit_message(status: &std::process::ExitStatus) -> String {
            use std::os::unix::process::ExitStatusExt;

            match status.signal() {
                Some(signal) => format!("terminated by signal {signal}"),
                None => format!("terminated abnormally: {status}"),
            }
        }
    } else {
        fn abnormal_exit_message(status: &std::process::ExitStatus) -> String {
            format!("terminated abnormally: {status}")
        }
    }
}
