// Copyright (c) The disttrial Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The worker's end of the control connection.
//!
//! A worker process reads commands from its control input until end-of-file. Tests are run by a
//! [`TestExecutor`], which reports outcomes through a [`TestReport`]. The reporter implementation
//! used here, [`WorkerReporter`], turns each outcome into commands back to the manager, sending
//! messages and stack frames through streams so that they are never limited by the size of a
//! single value.

mod command;

pub use command::{CommandExecutor, SKIP_EXIT_CODE, TODO_PREFIX};

use crate::{
    TestCaseRef,
    errors::{ProtocolError, ResponderError, WorkerError},
    protocol::{self, Channel, Command, MAX_VALUE_LENGTH, Message, RefuseCommands, answer},
    reporter::TestFailure,
    stream::{self, StreamId},
};
use bytes::Bytes;
use camino::Utf8Path;
use std::{borrow::Cow, future::Future, io, num::NonZeroUsize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

const CHUNK_SIZE: NonZeroUsize = match NonZeroUsize::new(MAX_VALUE_LENGTH) {
    Some(size) => size,
    None => panic!("MAX_VALUE_LENGTH is nonzero"),
};

/// Appended to a skip reason that had to be cut short to fit in one value.
pub const TRUNCATED_MARKER: &str = " [truncated]";

const REASON_SIZE: NonZeroUsize =
    match NonZeroUsize::new(MAX_VALUE_LENGTH - TRUNCATED_MARKER.len()) {
        Some(size) => size,
        None => panic!("MAX_VALUE_LENGTH is longer than the marker"),
    };

/// Shortens `reason` so that it fits in one value.
fn fit_reason(reason: &str) -> Cow<'_, str> {
    if reason.len() <= MAX_VALUE_LENGTH {
        return Cow::Borrowed(reason);
    }
    let head = stream::chunk_str(reason, REASON_SIZE).next().unwrap_or_default();
    Cow::Owned(format!("{head}{TRUNCATED_MARKER}"))
}

/// Receives the outcome of one test as it runs.
pub trait TestReport {
    /// Writes a line to the combined test log.
    ///
    /// A line longer than one protocol value is split across several log lines.
    fn test_write(&mut self, out: &str) -> impl Future<Output = ()>;

    /// The test passed.
    fn add_success(&mut self) -> impl Future<Output = ()>;

    /// The test raised an error.
    fn add_error(&mut self, error: &TestFailure) -> impl Future<Output = ()>;

    /// The test failed.
    fn add_failure(&mut self, failure: &TestFailure) -> impl Future<Output = ()>;

    /// The test was skipped.
    ///
    /// A reason longer than one protocol value is truncated and marked with
    /// [`TRUNCATED_MARKER`].
    fn add_skip(&mut self, reason: &str) -> impl Future<Output = ()>;

    /// A test expected to fail did fail.
    fn add_expected_failure(
        &mut self,
        error: &TestFailure,
        todo: Option<&str>,
    ) -> impl Future<Output = ()>;

    /// A test expected to fail passed.
    fn add_unexpected_success(&mut self, todo: Option<&str>) -> impl Future<Output = ()>;
}

/// Resolves test case identifiers into something runnable, and runs them.
pub trait TestExecutor {
    /// Prepares to run tests in `directory`.
    ///
    /// The default implementation changes the process's current directory.
    fn start(&mut self, directory: &Utf8Path) -> io::Result<()> {
        std::env::set_current_dir(directory)
    }

    /// Runs one test case, reporting its outcome to `report`.
    fn run(
        &mut self,
        case: &TestCaseRef,
        report: &mut impl TestReport,
    ) -> impl Future<Output = ()>;
}

/// Serves the manager's commands on a worker's control connection.
#[derive(Debug)]
pub struct WorkerServer<R, W> {
    channel: Channel<R, W>,
}

impl<R, W> WorkerServer<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates a server over the control connection.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            channel: Channel::new(reader, writer),
        }
    }

    /// Serves commands until the manager closes the connection.
    pub async fn serve<E: TestExecutor>(mut self, executor: &mut E) -> Result<(), WorkerError> {
        while let Some(message) = self.channel.receive().await? {
            match message {
                Message::Command {
                    tag,
                    command: Command::Start { directory },
                } => {
                    debug!(%directory, "starting");
                    let result = executor
                        .start(&directory)
                        .map(|()| answer::success(true))
                        .map_err(|error| ResponderError::Start { directory, error });
                    self.channel.reply(tag, "start", result).await?;
                }
                Message::Command {
                    tag,
                    command: Command::Run { test_case },
                } => {
                    debug!(test_case = %test_case, "running");
                    let mut reporter = WorkerReporter::new(&mut self.channel, &test_case);
                    executor.run(&test_case, &mut reporter).await;
                    let success = !reporter.failed();
                    self.channel
                        .reply(tag, "run", Ok(answer::success(success)))
                        .await?;
                }
                Message::Command { tag, command } => {
                    let name = command.name();
                    let error = ProtocolError::UnexpectedCommand {
                        command: name.to_owned(),
                    };
                    self.channel.reply(tag, name, Err(error.into())).await?;
                }
                Message::UnknownCommand { tag, name } => {
                    self.channel.reply_unknown(tag, name).await?;
                }
                Message::Answer { tag, .. } | Message::Error { tag, .. } => {
                    return Err(ProtocolError::UnexpectedReply { tag }.into());
                }
            }
        }

        debug!("control connection closed");
        self.channel.close().await;
        Ok(())
    }
}

/// Reports one test's outcome to the manager.
///
/// Failed calls are logged and remembered rather than returned: a test keeps running even if its
/// results can't be delivered, and the `Run` answer tells the manager that something was lost.
#[derive(Debug)]
pub struct WorkerReporter<'a, R, W> {
    channel: &'a mut Channel<R, W>,
    case: &'a TestCaseRef,
    failed: bool,
}

impl<'a, R, W> WorkerReporter<'a, R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates a reporter for `case`.
    pub fn new(channel: &'a mut Channel<R, W>, case: &'a TestCaseRef) -> Self {
        Self {
            channel,
            case,
            failed: false,
        }
    }

    /// Returns true if any report call failed.
    pub fn failed(&self) -> bool {
        self.failed
    }

    async fn call(&mut self, command: Command) -> Result<(), WorkerError> {
        let name = command.name();
        let values = self.channel.call(command, &mut RefuseCommands).await?;
        if !answer::parse_success(name, &values)? {
            return Err(WorkerError::Remote {
                code: protocol::UNHANDLED_ERROR_CODE.to_owned(),
                description: format!("manager did not accept {name}"),
            });
        }
        Ok(())
    }

    async fn send_stream(&mut self, data: &[u8]) -> Result<StreamId, WorkerError> {
        let values = self.channel.call(Command::StreamOpen, &mut RefuseCommands).await?;
        let stream_id = answer::parse_stream_id(&values)?;
        for chunk in stream::chunk(data, CHUNK_SIZE) {
            self.channel
                .call(
                    Command::StreamWrite {
                        stream_id,
                        data: Bytes::copy_from_slice(chunk),
                    },
                    &mut RefuseCommands,
                )
                .await?;
        }
        Ok(stream_id)
    }

    async fn send_failure(
        &mut self,
        failure: &TestFailure,
    ) -> Result<(StreamId, StreamId), WorkerError> {
        let message_id = self.send_stream(failure.message.as_bytes()).await?;
        let frames_id = self
            .send_stream(&protocol::encode_frames(&failure.frames))
            .await?;
        Ok((message_id, frames_id))
    }

    fn record(&mut self, what: &str, result: Result<(), WorkerError>) {
        if let Err(error) = result {
            warn!(test_case = %self.case, "failed to report {what}: {error}");
            self.failed = true;
        }
    }
}

impl<R, W> TestReport for WorkerReporter<'_, R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn test_write(&mut self, out: &str) {
        let result = async {
            for piece in stream::chunk_str(out, CHUNK_SIZE) {
                self.call(Command::TestWrite {
                    out: piece.to_owned(),
                })
                .await?;
            }
            Ok(())
        }
        .await;
        self.record("output", result);
    }

    async fn add_success(&mut self) {
        let test_name = self.case.clone();
        let result = self.call(Command::AddSuccess { test_name }).await;
        self.record("success", result);
    }

    async fn add_error(&mut self, error: &TestFailure) {
        let result = async {
            let (error_stream_id, frames_stream_id) = self.send_failure(error).await?;
            self.call(Command::AddError {
                test_name: self.case.clone(),
                error_class: error.type_name.clone(),
                error_stream_id,
                frames_stream_id,
            })
            .await
        }
        .await;
        self.record("error", result);
    }

    async fn add_failure(&mut self, failure: &TestFailure) {
        let result = async {
            let (fail_stream_id, frames_stream_id) = self.send_failure(failure).await?;
            self.call(Command::AddFailure {
                test_name: self.case.clone(),
                fail_class: failure.type_name.clone(),
                fail_stream_id,
                frames_stream_id,
            })
            .await
        }
        .await;
        self.record("failure", result);
    }

    async fn add_skip(&mut self, reason: &str) {
        let test_name = self.case.clone();
        let result = self
            .call(Command::AddSkip {
                test_name,
                reason: fit_reason(reason).into_owned(),
            })
            .await;
        self.record("skip", result);
    }

    async fn add_expected_failure(&mut self, error: &TestFailure, todo: Option<&str>) {
        let result = async {
            let error_stream_id = self.send_stream(error.to_string().as_bytes()).await?;
            self.call(Command::AddExpectedFailure {
                test_name: self.case.clone(),
                error_stream_id,
                todo: todo.map(str::to_owned),
            })
            .await
        }
        .await;
        self.record("expected failure", result);
    }

    async fn add_unexpected_success(&mut self, todo: Option<&str>) {
        let test_name = self.case.clone();
        let result = self
            .call(Command::AddUnexpectedSuccess {
                test_name,
                todo: todo.map(str::to_owned),
            })
            .await;
        self.record("unexpected success", result);
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// The control pipe the worker reads commands from.
        pub type ControlReader = tokio::net::unix::pipe::Receiver;

        /// The control pipe the worker writes commands to.
        pub type ControlWriter = tokio::net::unix::pipe::Sender;

        /// Takes ownership of the control pipes a worker was spawned with.
        ///
        /// The pipes are marked close-on-exec so that processes spawned by tests don't inherit
        /// them. Must be called at most once, from within a Tokio runtime.
        pub fn control_pipes() -> io::Result<(ControlReader, ControlWriter)> {
            use crate::worker_process::{WORKER_READ_FD, WORKER_WRITE_FD};
            use std::{fs::File, os::fd::{FromRawFd, OwnedFd}};

            fn take(fd: i32) -> io::Result<File> {
                // SAFETY: fcntl only inspects the descriptor table.
                let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
                if flags < 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("control fd {fd} is not open: workers must be spawned by disttrial"),
                    ));
                }
                // SAFETY: as above.
                if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
                    return Err(io::Error::last_os_error());
                }
                // SAFETY: the fd is open, and this is its only owner.
                Ok(File::from(unsafe { OwnedFd::from_raw_fd(fd) }))
            }

            let reader = ControlReader::from_file(take(WORKER_READ_FD)?)?;
            let writer = ControlWriter::from_file(take(WORKER_WRITE_FD)?)?;
            Ok((reader, writer))
        }
    } else {
        /// The control pipe the worker reads commands from.
        pub type ControlReader = tokio::io::Empty;

        /// The control pipe the worker writes commands to.
        pub type ControlWriter = tokio::io::Sink;

        /// Takes ownership of the control pipes a worker was spawned with.
        ///
        /// Control pipes are only supported on Unix.
        pub fn control_pipes() -> io::Result<(ControlReader, ControlWriter)> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "worker control pipes are only supported on Unix",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::{DEFAULT_TODO, Worker, WorkerConnection},
        protocol::{Tag, UNHANDLED_ERROR_CODE, UNKNOWN_ERROR_CODE},
        reporter::{
            DistReporter, Frame,
            test_helpers::{Event, RecordingReporter},
        },
        test_log::TestLog,
    };
    use camino::Utf8PathBuf;
    use pretty_assertions::assert_eq;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    type Reader = ReadHalf<DuplexStream>;
    type Writer = WriteHalf<DuplexStream>;

    fn pair() -> (WorkerServer<Reader, Writer>, Channel<Reader, Writer>) {
        let (a, b) = tokio::io::duplex(1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (
            WorkerServer::new(a_read, a_write),
            Channel::new(b_read, b_write),
        )
    }

    /// Reports a fixed outcome based on the test case's name.
    #[derive(Default)]
    struct ScriptedExecutor {
        started_in: Option<Utf8PathBuf>,
    }

    fn big_failure() -> TestFailure {
        TestFailure::new("AssertionError", "x".repeat(MAX_VALUE_LENGTH * 2 + 10)).with_frames(vec![
            Frame {
                function: "test_big".to_owned(),
                file: "tests/big.py".to_owned(),
                line: 12,
            },
        ])
    }

    impl TestExecutor for ScriptedExecutor {
        fn start(&mut self, directory: &Utf8Path) -> io::Result<()> {
            self.started_in = Some(directory.to_owned());
            Ok(())
        }

        async fn run(&mut self, case: &TestCaseRef, report: &mut impl TestReport) {
            report.test_write(&format!("running {case}")).await;
            match case.as_str() {
                "ok" => report.add_success().await,
                "big" => report.add_failure(&big_failure()).await,
                "error" => report.add_error(&TestFailure::new("KeyError", "missing")).await,
                "skip" => report.add_skip("not today").await,
                "todo" => {
                    report
                        .add_expected_failure(&TestFailure::new("ExitStatus", "1"), None)
                        .await
                }
                "lucky" => report.add_unexpected_success(Some("flaky")).await,
                "long" => {
                    report.test_write(&"y".repeat(MAX_VALUE_LENGTH + 10)).await;
                    report.add_skip(&"z".repeat(MAX_VALUE_LENGTH * 2)).await
                }
                other => panic!("unexpected case {other}"),
            }
        }
    }

    #[tokio::test]
    async fn serves_a_connection_end_to_end() {
        let dir = camino_tempfile::Utf8TempDir::new().unwrap();
        let log_path = dir.path().join("test.log");
        let test_log = TestLog::open(&log_path).unwrap();

        let (a, b) = tokio::io::duplex(1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let server = WorkerServer::new(a_read, a_write);
        let mut connection = WorkerConnection::new(0, b_read, b_write, test_log.clone());
        let mut executor = ScriptedExecutor::default();
        let reporter = DistReporter::new(RecordingReporter::default());

        let cases: Vec<TestCaseRef> = ["ok", "big", "error", "skip", "todo", "lucky"]
            .into_iter()
            .map(TestCaseRef::from)
            .collect();
        let (served, ()) = tokio::join!(server.serve(&mut executor), async {
            assert!(connection.start(Utf8Path::new("/work/0")).await.unwrap());
            for case in &cases {
                let result = connection.run(case, &reporter).await.unwrap();
                assert!(result.success, "{case} reported cleanly");
            }
            connection.close().await;
        });
        served.unwrap();
        assert_eq!(executor.started_in.as_deref(), Some(Utf8Path::new("/work/0")));

        let events = reporter.into_inner().events;
        let case = |name: &str| TestCaseRef::from(name);
        let outcomes: Vec<_> = events
            .into_iter()
            .filter(|event| !matches!(event, Event::Start(_) | Event::Stop(_)))
            .collect();
        assert_eq!(
            outcomes,
            vec![
                Event::Success(case("ok")),
                Event::Failure(case("big"), big_failure()),
                Event::Error(case("error"), TestFailure::new("KeyError", "missing")),
                Event::Skip(case("skip"), "not today".to_owned()),
                Event::ExpectedFailure(
                    case("todo"),
                    TestFailure::new("ExitStatus", "1").to_string(),
                    DEFAULT_TODO.to_owned(),
                ),
                Event::UnexpectedSuccess(case("lucky"), "flaky".to_owned()),
            ]
        );

        test_log.close().unwrap();
        let log = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(log.lines().count(), cases.len());
        assert!(log.starts_with("running ok\nrunning big\n"), "log: {log}");
    }

    #[tokio::test]
    async fn long_output_and_skip_reasons_are_delivered() {
        let dir = camino_tempfile::Utf8TempDir::new().unwrap();
        let log_path = dir.path().join("test.log");
        let test_log = TestLog::open(&log_path).unwrap();

        let (a, b) = tokio::io::duplex(1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let server = WorkerServer::new(a_read, a_write);
        let mut connection = WorkerConnection::new(0, b_read, b_write, test_log.clone());
        let mut executor = ScriptedExecutor::default();
        let reporter = DistReporter::new(RecordingReporter::default());
        let case = TestCaseRef::from("long");

        let (served, result) = tokio::join!(server.serve(&mut executor), async {
            let result = connection.run(&case, &reporter).await;
            connection.close().await;
            result
        });
        served.unwrap();
        assert!(result.unwrap().success, "every report call fit");

        let events = reporter.into_inner().events;
        let [Event::Start(_), Event::Skip(_, reason), Event::Stop(_)] = events.as_slice() else {
            panic!("unexpected events: {events:?}");
        };
        assert_eq!(reason.len(), MAX_VALUE_LENGTH);
        assert!(reason.ends_with(TRUNCATED_MARKER));
        assert!(reason.starts_with("zzz"));

        test_log.close().unwrap();
        let log = std::fs::read_to_string(&log_path).unwrap();
        let lines: Vec<_> = log.lines().collect();
        assert_eq!(lines.len(), 3, "the long line is split in two");
        assert_eq!(lines[0], "running long");
        assert_eq!(lines[1].len(), MAX_VALUE_LENGTH);
        assert_eq!(lines[2], "y".repeat(10));
    }

    #[test]
    fn short_reasons_are_kept() {
        assert_eq!(fit_reason("not today"), "not today");
        let exact = "r".repeat(MAX_VALUE_LENGTH);
        assert_eq!(fit_reason(&exact), exact.as_str());
    }

    async fn expect_command(peer: &mut Channel<Reader, Writer>) -> (Option<Tag>, Command) {
        match peer.receive().await.unwrap() {
            Some(Message::Command { tag, command }) => (tag, command),
            other => panic!("expected a command, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_reports_fail_the_run() {
        let (server, mut peer) = pair();
        let mut executor = ScriptedExecutor::default();

        let (served, ()) = tokio::join!(server.serve(&mut executor), async {
            let run_tag = Tag::new(7);
            peer.send(&Message::Command {
                tag: Some(run_tag),
                command: Command::Run {
                    test_case: "ok".into(),
                },
            })
            .await
            .unwrap();

            let (tag, command) = expect_command(&mut peer).await;
            assert!(matches!(command, Command::TestWrite { .. }));
            peer.send(&Message::Answer {
                tag: tag.unwrap(),
                values: answer::success(true),
            })
            .await
            .unwrap();

            let (tag, command) = expect_command(&mut peer).await;
            assert_eq!(command, Command::AddSuccess { test_name: "ok".into() });
            peer.send(&Message::Error {
                tag: tag.unwrap(),
                code: UNHANDLED_ERROR_CODE.to_owned(),
                description: "boom".to_owned(),
            })
            .await
            .unwrap();

            match peer.receive().await.unwrap() {
                Some(Message::Answer { tag, values }) => {
                    assert_eq!(tag, run_tag);
                    assert!(!answer::parse_success("Run", &values).unwrap());
                }
                other => panic!("expected the Run answer, got {other:?}"),
            }
            peer.close().await;
        });
        served.unwrap();
    }

    #[tokio::test]
    async fn unexpected_and_unknown_commands_get_errors() {
        let (server, mut peer) = pair();
        let mut executor = ScriptedExecutor::default();

        let (served, ()) = tokio::join!(server.serve(&mut executor), async {
            let error = peer
                .call(Command::StreamOpen, &mut RefuseCommands)
                .await
                .unwrap_err();
            assert!(
                matches!(&error, WorkerError::Remote { code, .. } if code == UNHANDLED_ERROR_CODE),
                "{error:?}"
            );

            peer.send(&Message::UnknownCommand {
                tag: Some(Tag::new(0x1f)),
                name: "Frobnicate".to_owned(),
            })
            .await
            .unwrap();
            match peer.receive().await.unwrap() {
                Some(Message::Error { tag, code, .. }) => {
                    assert_eq!(tag, Tag::new(0x1f));
                    assert_eq!(code, UNKNOWN_ERROR_CODE);
                }
                other => panic!("expected an error, got {other:?}"),
            }
            peer.close().await;
        });
        served.unwrap();
        assert_eq!(executor.started_in, None);
    }

    #[tokio::test]
    async fn stray_answers_are_protocol_errors() {
        let (server, mut peer) = pair();
        let mut executor = ScriptedExecutor::default();

        let (served, ()) = tokio::join!(server.serve(&mut executor), async {
            peer.send(&Message::Answer {
                tag: Tag::new(3),
                values: answer::success(true),
            })
            .await
            .unwrap();
        });
        assert!(
            matches!(
                served,
                Err(WorkerError::Protocol(ProtocolError::UnexpectedReply { .. }))
            ),
            "{served:?}"
        );
    }

    #[tokio::test]
    async fn lost_connection_marks_reporter_failed() {
        let (a, b) = tokio::io::duplex(64);
        let (a_read, a_write) = tokio::io::split(a);
        drop(b);
        let mut channel = Channel::new(a_read, a_write);
        let case = TestCaseRef::from("ok");
        let mut reporter = WorkerReporter::new(&mut channel, &case);
        reporter.add_success().await;
        reporter.add_skip("later").await;
        assert!(reporter.failed());
    }
}
