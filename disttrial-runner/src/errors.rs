// Copyright (c) The disttrial Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by disttrial.

use crate::{TestCaseRef, protocol::Tag, stream::StreamId};
use camino::Utf8PathBuf;
use config::ConfigError;
use std::{io, process::ExitStatus};
use thiserror::Error;

/// An error that occurred while parsing the config.
#[derive(Debug, Error)]
#[error("failed to parse disttrial config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self {
            config_file: config_file.into(),
            kind,
        }
    }

    /// Returns the config file that failed to parse.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }

    /// Returns the kind of error that occurred.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of error that occurred while parsing a config.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// The layered config could not be built.
    #[error(transparent)]
    BuildError(Box<ConfigError>),

    /// The config could not be deserialized.
    #[error(transparent)]
    DeserializeError(Box<serde_path_to_error::Error<ConfigError>>),
}

/// An error which indicates that a profile was requested but not known to disttrial.
#[derive(Clone, Debug, Error)]
#[error("profile `{profile}` not found (known profiles: {})", .all_profiles.join(", "))]
pub struct ProfileNotFound {
    profile: String,
    all_profiles: Vec<String>,
}

impl ProfileNotFound {
    pub(crate) fn new(
        profile: impl Into<String>,
        all_profiles: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut all_profiles: Vec<_> = all_profiles.into_iter().map(|s| s.into()).collect();
        all_profiles.sort_unstable();
        Self {
            profile: profile.into(),
            all_profiles,
        }
    }
}

/// An error that occurs while parsing a jobs value.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid jobs value `{input}`: {reason}")]
pub struct JobsParseError {
    input: String,
    reason: String,
}

impl JobsParseError {
    pub(crate) fn new(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            reason: reason.into(),
        }
    }
}

/// A stream id was used that was never opened, or that was already finished.
///
/// This always indicates that the two ends of a connection disagree about the protocol state.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("unknown stream {stream_id}")]
pub struct UnknownStream {
    /// The stream id that was not recognized.
    pub stream_id: StreamId,
}

/// An error decoding or encoding a protocol message.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    /// A key was empty or longer than the maximum key length.
    #[error("invalid key length {len} (keys must be 1 to 255 bytes)")]
    InvalidKeyLength {
        /// The length of the key.
        len: usize,
    },

    /// A value was longer than the maximum value length.
    #[error("value for key `{key}` is {len} bytes, longer than the maximum of 65535")]
    ValueTooLong {
        /// The key the value belongs to.
        key: String,
        /// The length of the value.
        len: usize,
    },

    /// A box carried none of `_command`, `_answer` or `_error`.
    #[error("box is neither a command, an answer nor an error")]
    UnroutableBox,

    /// A command was missing a required argument.
    #[error("command `{command}` is missing argument `{argument}`")]
    MissingArgument {
        /// The command name.
        command: &'static str,
        /// The argument name.
        argument: &'static str,
    },

    /// An argument could not be decoded.
    #[error("argument `{argument}` of `{context}` is invalid: {reason}")]
    InvalidArgument {
        /// The command or answer the argument belongs to.
        context: String,
        /// The argument name.
        argument: String,
        /// Why the argument is invalid.
        reason: String,
    },

    /// An answer or error arrived for a request that is not outstanding.
    #[error("received a reply for unknown request {tag}")]
    UnexpectedReply {
        /// The tag of the reply.
        tag: Tag,
    },

    /// A peer sent a command that is not valid in the current state.
    #[error("unexpected command `{command}`")]
    UnexpectedCommand {
        /// The name of the command.
        command: String,
    },
}

/// An error communicating with a worker over its control channel.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// An I/O error occurred on the control channel.
    #[error("I/O error on worker control channel")]
    Io(#[from] io::Error),

    /// The peer closed the control channel while a call was outstanding.
    #[error("worker control channel closed unexpectedly")]
    ConnectionLost,

    /// The peer violated the protocol.
    #[error("worker protocol error")]
    Protocol(#[from] ProtocolError),

    /// The peer answered a call with an error.
    #[error("peer answered with error {code}: {description}")]
    Remote {
        /// The error code.
        code: String,
        /// A description of the error.
        description: String,
    },

    /// The worker is not running.
    #[error("worker is not running")]
    NotRunning,

    /// The result sink rejected a call.
    #[error("result sink rejected a call")]
    Reporter(#[from] ReporterError),
}

impl WorkerError {
    /// Returns a short name describing the kind of error, used as the type name when the error is
    /// recorded in a report.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Io(_) => "WorkerIoError",
            Self::ConnectionLost => "WorkerConnectionLost",
            Self::Protocol(_) => "WorkerProtocolError",
            Self::Remote { .. } => "WorkerRemoteError",
            Self::NotRunning => "WorkerNotRunning",
            Self::Reporter(_) => "ReporterError",
        }
    }
}

/// An error returned by a responder handling a command from a peer.
///
/// These are sent back to the peer as error answers, and logged locally.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ResponderError {
    /// A stream command referenced an unknown stream.
    #[error(transparent)]
    UnknownStream(#[from] UnknownStream),

    /// The result sink rejected the call.
    #[error(transparent)]
    Reporter(#[from] ReporterError),

    /// A command's payload could not be decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Writing to the test log failed.
    #[error("failed to write to the test log")]
    TestLog(#[source] io::Error),

    /// The worker could not start in its directory.
    #[error("failed to start in `{directory}`")]
    Start {
        /// The directory.
        directory: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: io::Error,
    },
}

/// An error returned by a [`ResultSink`](crate::reporter::ResultSink).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReporterError {
    /// A test was started while it was already running.
    #[error("test `{test}` was started while already running")]
    AlreadyStarted {
        /// The test case.
        test: TestCaseRef,
    },

    /// An event arrived for a test that is not running.
    #[error("test `{test}` is not running")]
    NotStarted {
        /// The test case.
        test: TestCaseRef,
    },
}

/// An error that occurred while spawning a worker process.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerSpawnError {
    /// The worker's directory could not be created.
    #[error("failed to create worker directory `{path}`")]
    CreateDirectory {
        /// The directory.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// A worker log file could not be created.
    #[error("failed to create worker log `{path}`")]
    CreateLog {
        /// The log file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The control pipes could not be created.
    #[error("failed to create control pipes")]
    CreatePipes(#[source] io::Error),

    /// The process could not be spawned.
    #[error("failed to spawn worker `{program}`")]
    Spawn {
        /// The program that was spawned.
        program: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },
}

/// An error that occurred while asking a worker process to exit.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerExitError {
    /// The worker is not running: it was never started, or it has already exited.
    #[error("worker {index} is not running")]
    NotRunning {
        /// The worker index.
        index: usize,
    },

    /// Waiting for the worker to exit failed.
    #[error("failed to wait for worker {index} to exit")]
    Wait {
        /// The worker index.
        index: usize,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The worker exited abnormally.
    #[error("worker {index} exited abnormally: {status}")]
    Status {
        /// The worker index.
        index: usize,
        /// The exit status.
        status: ExitStatus,
    },
}

/// An error that occurred while starting a worker pool.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerPoolStartError {
    /// The working directory has no usable file name to derive alternatives from.
    #[error("working directory `{path}` must end in a normal file name")]
    InvalidWorkingDirectory {
        /// The configured working directory.
        path: Utf8PathBuf,
    },

    /// A directory could not be created.
    #[error("failed to create directory `{path}`")]
    CreateDirectory {
        /// The directory.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// A lock file could not be opened or locked.
    #[error("failed to lock `{path}`")]
    Lock {
        /// The lock file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// Every candidate working directory was locked by another process.
    #[error("all {attempts} candidates for working directory `{base}` are in use")]
    WorkingDirectoryBusy {
        /// The configured base directory.
        base: Utf8PathBuf,
        /// The number of candidates tried.
        attempts: usize,
    },

    /// The working directory exists but was not created by disttrial, so it will not be removed.
    #[error("refusing to remove `{path}`: it does not contain a disttrial marker file")]
    UnmarkedWorkingDirectory {
        /// The directory.
        path: Utf8PathBuf,
    },

    /// A previous working directory could not be removed.
    #[error("failed to remove previous working directory `{path}`")]
    RemoveDirectory {
        /// The directory.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The marker file could not be written.
    #[error("failed to write marker file `{path}`")]
    WriteMarker {
        /// The marker file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The combined test log could not be opened.
    #[error("failed to open test log `{path}`")]
    OpenTestLog {
        /// The log file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// A worker process could not be spawned.
    #[error("failed to spawn worker {index}")]
    SpawnWorker {
        /// The worker index.
        index: usize,
        /// The underlying error.
        #[source]
        error: WorkerSpawnError,
    },
}

/// An error that occurred while building a [`DistTrialRunner`](crate::runner::DistTrialRunner).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TestRunnerBuildError {
    /// Creating the Tokio runtime failed.
    #[error("error creating Tokio runtime")]
    TokioRuntimeCreate(#[source] io::Error),
}

/// An error that aborted a run.
///
/// Test failures and worker failures are not errors at this level: they are recorded in the
/// report instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunnerError {
    /// The worker pool could not be started.
    #[error("failed to start worker pool")]
    PoolStart(#[from] WorkerPoolStartError),

    /// Progress output could not be written.
    #[error("failed to write run progress")]
    WriteProgress(#[source] io::Error),

    /// The reporter could not write its results.
    #[error("failed to write test results")]
    WriteResults(#[source] io::Error),
}

/// Displays an error along with its chain of sources, on one line each.
pub struct DisplayErrorChain<E> {
    error: E,
}

impl<E: std::error::Error> DisplayErrorChain<E> {
    /// Creates a new `DisplayErrorChain`.
    pub fn new(error: E) -> Self {
        Self { error }
    }
}

impl<E: std::error::Error> std::fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)?;
        let mut source = self.error.source();
        while let Some(error) = source {
            write!(f, "\n  caused by: {error}")?;
            source = error.source();
        }
        Ok(())
    }
}
