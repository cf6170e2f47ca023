// Copyright (c) The disttrial Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The manager's end of the control connection to one worker.

use crate::{
    TestCaseRef,
    errors::{ProtocolError, ResponderError, WorkerError},
    protocol::{self, AmpBox, Channel, Command, RefuseCommands, Responder, answer},
    reporter::{ResultSink, TestFailure},
    stream::{StreamId, StreamReceiver},
    test_log::TestLog,
};
use camino::Utf8Path;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// The todo reason recorded when a worker reports an expected failure without one.
pub const DEFAULT_TODO: &str = "Test expected to fail";

/// The outcome of a `Run` call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RunResult {
    /// False if the worker could not deliver all of its report calls for the test.
    pub success: bool,
}

/// Something that can run test cases and report their outcomes into a [`ResultSink`].
///
/// Implemented by [`WorkerConnection`] and by the process that owns one. The runner is generic
/// over this trait so that it can be driven by in-process workers in tests.
pub trait Worker {
    /// Runs one test case.
    ///
    /// `sink.start_test` is called before the case is dispatched and `sink.stop_test` after it
    /// completes, whether or not the call succeeds. If the call fails, or the worker could not
    /// deliver its report, the failure is recorded as an error on the case before it is stopped,
    /// so every dispatched case reaches the sink as exactly one test.
    ///
    /// A [`WorkerError::Reporter`] means the sink rejected the case, and nothing was recorded
    /// for it.
    fn run(
        &mut self,
        case: &TestCaseRef,
        sink: &dyn ResultSink,
    ) -> impl Future<Output = Result<RunResult, WorkerError>>;
}

/// Returns the error recorded on a case whose run ended with `result`, if any.
fn run_failure(index: usize, result: &Result<RunResult, WorkerError>) -> Option<TestFailure> {
    match result {
        Ok(RunResult { success: true }) => None,
        Ok(RunResult { success: false }) => Some(TestFailure::new(
            "WorkerReportFailed",
            format!("worker {index} failed to report all results for this test"),
        )),
        Err(error) => Some(TestFailure::from_error(error.kind_name(), error)),
    }
}

/// Records the outcome of a run on `case`, which must be started, and stops it.
///
/// Returns `result`, unless it succeeded and the sink then failed.
pub fn finish_run(
    index: usize,
    case: &TestCaseRef,
    sink: &dyn ResultSink,
    result: Result<RunResult, WorkerError>,
) -> Result<RunResult, WorkerError> {
    StopTestGuard::new(sink, case).finish(index, result)
}

/// A control connection to one worker.
#[derive(Debug)]
pub struct WorkerConnection<R, W> {
    index: usize,
    channel: Channel<R, W>,
    streams: StreamReceiver,
    test_log: TestLog,
}

impl<R, W> WorkerConnection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates a connection over the worker's control pipes.
    ///
    /// `TestWrite` output from the worker is appended to `test_log`.
    pub fn new(index: usize, reader: R, writer: W, test_log: TestLog) -> Self {
        Self {
            index,
            channel: Channel::new(reader, writer),
            streams: StreamReceiver::new(),
            test_log,
        }
    }

    /// Returns the index of the worker within its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns true until [`Self::close`] is called.
    pub fn is_connected(&self) -> bool {
        self.channel.is_open()
    }

    /// Tells the worker to change into `directory`. Returns the worker's `success` answer.
    pub async fn start(&mut self, directory: &Utf8Path) -> Result<bool, WorkerError> {
        let values = self
            .channel
            .call(
                Command::Start {
                    directory: directory.to_owned(),
                },
                &mut RefuseCommands,
            )
            .await?;
        Ok(answer::parse_success("Start", &values)?)
    }

    /// Closes the write side of the connection. A worker exits once it sees end-of-file.
    pub async fn close(&mut self) {
        self.channel.close().await;
    }
}

impl<R, W> Worker for WorkerConnection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn run(
        &mut self,
        case: &TestCaseRef,
        sink: &dyn ResultSink,
    ) -> Result<RunResult, WorkerError> {
        sink.start_test(case)?;
        let guard = StopTestGuard::new(sink, case);

        debug!(worker = self.index, test_case = %case, "dispatching test");
        let mut responders = Responders {
            index: self.index,
            case,
            sink,
            streams: &mut self.streams,
            test_log: &self.test_log,
        };
        let result = self
            .channel
            .call(
                Command::Run {
                    test_case: case.clone(),
                },
                &mut responders,
            )
            .await
            .and_then(|values| {
                let success = answer::parse_success("Run", &values)?;
                Ok(RunResult { success })
            });

        let discarded = self.streams.discard_open();
        if discarded > 0 {
            debug!(
                worker = self.index,
                test_case = %case,
                discarded,
                "dropping streams that were never finished",
            );
        }
        guard.finish(self.index, result)
    }
}

/// Calls `stop_test` when dropped, so that it runs even if the run is cancelled.
struct StopTestGuard<'a> {
    sink: &'a dyn ResultSink,
    case: &'a TestCaseRef,
    armed: bool,
}

impl<'a> StopTestGuard<'a> {
    fn new(sink: &'a dyn ResultSink, case: &'a TestCaseRef) -> Self {
        Self {
            sink,
            case,
            armed: true,
        }
    }

    fn finish(
        mut self,
        index: usize,
        result: Result<RunResult, WorkerError>,
    ) -> Result<RunResult, WorkerError> {
        self.armed = false;
        if let Some(failure) = run_failure(index, &result)
            && let Err(error) = self.sink.add_error(self.case, failure)
        {
            warn!(test_case = %self.case, "failed to record run failure: {error}");
        }
        let stopped = self.sink.stop_test(self.case);
        match (result, stopped) {
            (Ok(run_result), Ok(())) => Ok(run_result),
            (Ok(_), Err(error)) => Err(error.into()),
            (Err(error), stopped) => {
                if let Err(stop_error) = stopped {
                    warn!(test_case = %self.case, "failed to stop test: {stop_error}");
                }
                Err(error)
            }
        }
    }
}

impl Drop for StopTestGuard<'_> {
    fn drop(&mut self) {
        if self.armed
            && let Err(error) = self.sink.stop_test(self.case)
        {
            warn!(test_case = %self.case, "failed to stop test: {error}");
        }
    }
}

/// Handles the worker's report commands for the test that is running.
struct Responders<'a> {
    index: usize,
    case: &'a TestCaseRef,
    sink: &'a dyn ResultSink,
    streams: &'a mut StreamReceiver,
    test_log: &'a TestLog,
}

impl Responders<'_> {
    fn check_name(&self, test_name: &TestCaseRef) {
        if test_name != self.case {
            debug!(
                worker = self.index,
                test_case = %self.case,
                reported = %test_name,
                "worker reported under a different name",
            );
        }
    }

    fn finish_text(&mut self, id: StreamId) -> Result<String, ResponderError> {
        let chunks = self.streams.finish(id)?;
        Ok(String::from_utf8_lossy(&chunks.concat()).into_owned())
    }

    fn finish_failure(
        &mut self,
        class: String,
        message_id: StreamId,
        frames_id: StreamId,
    ) -> Result<TestFailure, ResponderError> {
        let message = self.finish_text(message_id)?;
        let frames = protocol::decode_frames(&self.streams.finish(frames_id)?)?;
        Ok(TestFailure::new(class, message).with_frames(frames))
    }
}

impl Responder for Responders<'_> {
    async fn respond(&mut self, command: Command) -> Result<AmpBox, ResponderError> {
        match command {
            Command::StreamOpen => Ok(answer::stream_id(self.streams.open())),
            Command::StreamWrite { stream_id, data } => {
                self.streams.write(stream_id, data)?;
                Ok(AmpBox::new())
            }
            Command::TestWrite { out } => {
                self.test_log
                    .write_line(&out)
                    .map_err(ResponderError::TestLog)?;
                Ok(answer::success(true))
            }
            Command::AddSuccess { test_name } => {
                self.check_name(&test_name);
                self.sink.add_success(self.case)?;
                Ok(answer::success(true))
            }
            Command::AddError {
                test_name,
                error_class,
                error_stream_id,
                frames_stream_id,
            } => {
                self.check_name(&test_name);
                let error = self.finish_failure(error_class, error_stream_id, frames_stream_id)?;
                self.sink.add_error(self.case, error)?;
                Ok(answer::success(true))
            }
            Command::AddFailure {
                test_name,
                fail_class,
                fail_stream_id,
                frames_stream_id,
            } => {
                self.check_name(&test_name);
                let failure = self.finish_failure(fail_class, fail_stream_id, frames_stream_id)?;
                self.sink.add_failure(self.case, failure)?;
                Ok(answer::success(true))
            }
            Command::AddSkip { test_name, reason } => {
                self.check_name(&test_name);
                self.sink.add_skip(self.case, reason)?;
                Ok(answer::success(true))
            }
            Command::AddExpectedFailure {
                test_name,
                error_stream_id,
                todo,
            } => {
                self.check_name(&test_name);
                let error = self.finish_text(error_stream_id)?;
                let todo = todo.unwrap_or_else(|| DEFAULT_TODO.to_owned());
                self.sink.add_expected_failure(self.case, error, todo)?;
                Ok(answer::success(true))
            }
            Command::AddUnexpectedSuccess { test_name, todo } => {
                self.check_name(&test_name);
                let todo = todo.unwrap_or_else(|| DEFAULT_TODO.to_owned());
                self.sink.add_unexpected_success(self.case, todo)?;
                Ok(answer::success(true))
            }
            command @ (Command::Start { .. } | Command::Run { .. }) => {
                Err(ProtocolError::UnexpectedCommand {
                    command: command.name().to_owned(),
                }
                .into())
            }
        }
    }
}
