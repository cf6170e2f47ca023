// Copyright (c) The disttrial Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::{NO_HEADING_TARGET, StderrStyles};
use disttrial_runner::errors::{
    ConfigParseError, ProfileNotFound, RunnerError, TestRunnerBuildError, WorkerError,
};
use owo_colors::OwoColorize;
use std::error::Error;
use thiserror::Error;

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

/// Process exit codes returned by disttrial.
#[doc(hidden)]
pub enum DistTrialExitCode {}

impl DistTrialExitCode {
    /// A worker subcommand failed.
    pub const WORKER_ERROR: i32 = 70;

    /// The config file or profile was invalid.
    pub const INVALID_CONFIG: i32 = 94;

    /// The run could not be set up, or was aborted by an infrastructure error.
    pub const SETUP_ERROR: i32 = 96;

    /// One or more tests failed or errored.
    pub const TEST_RUN_FAILED: i32 = 100;
}

// The #[error()] strings are placeholders: errors are expected to be printed with
// display_to_stderr, which colorizes them.

/// An error that disttrial reports to the user before exiting.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("could not determine the current directory")]
    GetCurrentDirFailed { err: std::io::Error },
    #[error("current directory is not valid UTF-8")]
    CurrentDirInvalidUtf8 { path: std::path::PathBuf },
    #[error("could not determine the path to the current executable")]
    GetCurrentExeFailed { err: std::io::Error },
    #[error("current executable path is not valid UTF-8")]
    CurrentExeInvalidUtf8 { path: std::path::PathBuf },
    #[error("config parse error")]
    ConfigParseError {
        #[from]
        err: ConfigParseError,
    },
    #[error("profile not found")]
    ProfileNotFound {
        #[from]
        err: ProfileNotFound,
    },
    #[error("failed to build test runner")]
    TestRunnerBuildError {
        #[from]
        err: TestRunnerBuildError,
    },
    #[error("test run aborted")]
    RunnerError {
        #[from]
        err: RunnerError,
    },
    #[error("test run failed")]
    TestRunFailed,
    #[error("failed to build worker runtime")]
    WorkerRuntimeCreate { err: std::io::Error },
    #[error("failed to open worker control pipes")]
    WorkerControlPipes { err: std::io::Error },
    #[error("worker failed")]
    WorkerFailed { err: WorkerError },
}

impl ExpectedError {
    pub(crate) fn test_run_failed() -> Self {
        Self::TestRunFailed
    }

    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::GetCurrentDirFailed { .. }
            | Self::CurrentDirInvalidUtf8 { .. }
            | Self::GetCurrentExeFailed { .. }
            | Self::CurrentExeInvalidUtf8 { .. }
            | Self::TestRunnerBuildError { .. }
            | Self::RunnerError { .. } => DistTrialExitCode::SETUP_ERROR,
            Self::ConfigParseError { .. } | Self::ProfileNotFound { .. } => {
                DistTrialExitCode::INVALID_CONFIG
            }
            Self::TestRunFailed => DistTrialExitCode::TEST_RUN_FAILED,
            Self::WorkerRuntimeCreate { .. }
            | Self::WorkerControlPipes { .. }
            | Self::WorkerFailed { .. } => DistTrialExitCode::WORKER_ERROR,
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error = match self {
            Self::GetCurrentDirFailed { err } => {
                tracing::error!("could not determine the current directory");
                Some(err as &dyn Error)
            }
            Self::CurrentDirInvalidUtf8 { path } => {
                tracing::error!(
                    "current directory `{}` is not valid UTF-8",
                    path.display().style(styles.bold)
                );
                None
            }
            Self::GetCurrentExeFailed { err } => {
                tracing::error!("could not determine the path to the current executable");
                Some(err as &dyn Error)
            }
            Self::CurrentExeInvalidUtf8 { path } => {
                tracing::error!(
                    "current executable path `{}` is not valid UTF-8",
                    path.display().style(styles.bold)
                );
                None
            }
            Self::ConfigParseError { err } => {
                tracing::error!(
                    "failed to parse disttrial config at `{}`",
                    err.config_file().style(styles.bold)
                );
                Some(err.kind() as &dyn Error)
            }
            Self::ProfileNotFound { err } => {
                tracing::error!("{}", err);
                err.source()
            }
            Self::TestRunnerBuildError { err } => {
                tracing::error!("failed to build test runner");
                Some(err as &dyn Error)
            }
            Self::RunnerError { err } => {
                tracing::error!("test run aborted: {}", err);
                err.source()
            }
            Self::TestRunFailed => {
                tracing::error!("test run failed");
                None
            }
            Self::WorkerRuntimeCreate { err } => {
                tracing::error!("[worker] failed to build Tokio runtime");
                Some(err as &dyn Error)
            }
            Self::WorkerControlPipes { err } => {
                tracing::error!("[worker] failed to open control pipes");
                Some(err as &dyn Error)
            }
            Self::WorkerFailed { err } => {
                tracing::error!("[worker] failed");
                Some(err as &dyn Error)
            }
        };

        while let Some(err) = next_error {
            tracing::error!(target: NO_HEADING_TARGET, "\nCaused by:\n  {}", err);
            next_error = err.source();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn exit_codes_follow_error_kinds() {
        assert_eq!(
            ExpectedError::test_run_failed().process_exit_code(),
            DistTrialExitCode::TEST_RUN_FAILED
        );
        assert_eq!(
            ExpectedError::from(RunnerError::WriteProgress(io::ErrorKind::BrokenPipe.into()))
                .process_exit_code(),
            DistTrialExitCode::SETUP_ERROR
        );
        assert_eq!(
            ExpectedError::WorkerControlPipes {
                err: io::ErrorKind::NotFound.into()
            }
            .process_exit_code(),
            DistTrialExitCode::WORKER_ERROR
        );
    }
}
