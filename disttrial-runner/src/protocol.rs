// Copyright (c) The disttrial Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The control protocol spoken between the coordinator and its workers.
//!
//! Messages are [`AmpBox`]es. A command carries its name under `_command` and, if it expects a
//! reply, a request tag under `_ask`. The peer replies with either an answer box tagged with
//! `_answer` or an error box tagged with `_error`.
//!
//! The manager sends [`Command::Start`] and [`Command::Run`]. While a `Run` is outstanding the
//! worker sends reporting commands back, each of which the manager answers before the worker
//! continues.

mod amp;

pub use amp::{AmpBox, AmpReader, AmpWriter};

use crate::{
    TestCaseRef,
    errors::{DisplayErrorChain, ProtocolError, ResponderError, WorkerError},
    reporter::Frame,
    stream::StreamId,
};
use bytes::Bytes;
use camino::Utf8PathBuf;
use std::{fmt, future::Future, str::FromStr};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error};

/// The maximum length of a key, in bytes.
pub const MAX_KEY_LENGTH: usize = 0xff;

/// The maximum length of a single value, in bytes. Larger payloads are sent as streams.
pub const MAX_VALUE_LENGTH: usize = 0xffff;

/// The error code sent when a responder fails.
pub const UNHANDLED_ERROR_CODE: &str = "UNHANDLED";

/// The error code sent in reply to a command the peer does not know.
pub const UNKNOWN_ERROR_CODE: &str = "UNKNOWN";

const ASK: &str = "_ask";
const COMMAND: &str = "_command";
const ANSWER: &str = "_answer";
const ERROR: &str = "_error";
const ERROR_CODE: &str = "_error_code";
const ERROR_DESCRIPTION: &str = "_error_description";

/// Correlates a reply with the command it answers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Tag(u64);

impl Tag {
    /// Creates a tag.
    pub fn new(tag: u64) -> Self {
        Self(tag)
    }

    fn decode(context: &str, argument: &str, value: &[u8]) -> Result<Self, ProtocolError> {
        let value = decode_str(context, argument, value)?;
        u64::from_str_radix(value, 16)
            .map(Self)
            .map_err(|error| invalid(context, argument, error))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// A command sent by either side.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// Manager to worker: change into `directory` before running tests.
    Start {
        /// The worker's own directory.
        directory: Utf8PathBuf,
    },

    /// Manager to worker: run a test case and report its outcome.
    Run {
        /// The test case.
        test_case: TestCaseRef,
    },

    /// Worker to manager: open a stream for an oversized value.
    StreamOpen,

    /// Worker to manager: append a chunk to a stream. Not answered.
    StreamWrite {
        /// The stream.
        stream_id: StreamId,
        /// The chunk.
        data: Bytes,
    },

    /// Worker to manager: write a line to the combined test log.
    TestWrite {
        /// The line, without a trailing newline.
        out: String,
    },

    /// Worker to manager: the test passed.
    AddSuccess {
        /// The test case.
        test_name: TestCaseRef,
    },

    /// Worker to manager: the test raised an error.
    AddError {
        /// The test case.
        test_name: TestCaseRef,
        /// The type name of the error.
        error_class: String,
        /// The stream holding the error message.
        error_stream_id: StreamId,
        /// The stream holding the encoded stack frames.
        frames_stream_id: StreamId,
    },

    /// Worker to manager: the test failed an assertion.
    AddFailure {
        /// The test case.
        test_name: TestCaseRef,
        /// The type name of the failure.
        fail_class: String,
        /// The stream holding the failure message.
        fail_stream_id: StreamId,
        /// The stream holding the encoded stack frames.
        frames_stream_id: StreamId,
    },

    /// Worker to manager: the test was skipped.
    AddSkip {
        /// The test case.
        test_name: TestCaseRef,
        /// Why the test was skipped.
        reason: String,
    },

    /// Worker to manager: a test marked as expected to fail did fail.
    AddExpectedFailure {
        /// The test case.
        test_name: TestCaseRef,
        /// The stream holding the error text.
        error_stream_id: StreamId,
        /// Why the test is expected to fail.
        todo: Option<String>,
    },

    /// Worker to manager: a test marked as expected to fail passed.
    AddUnexpectedSuccess {
        /// The test case.
        test_name: TestCaseRef,
        /// Why the test was expected to fail.
        todo: Option<String>,
    },
}

impl Command {
    /// Returns the wire name of this command.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "Start",
            Self::Run { .. } => "Run",
            Self::StreamOpen => "StreamOpen",
            Self::StreamWrite { .. } => "StreamWrite",
            Self::TestWrite { .. } => "TestWrite",
            Self::AddSuccess { .. } => "AddSuccess",
            Self::AddError { .. } => "AddError",
            Self::AddFailure { .. } => "AddFailure",
            Self::AddSkip { .. } => "AddSkip",
            Self::AddExpectedFailure { .. } => "AddExpectedFailure",
            Self::AddUnexpectedSuccess { .. } => "AddUnexpectedSuccess",
        }
    }

    /// Returns true if the peer replies to this command.
    pub fn requires_answer(&self) -> bool {
        !matches!(self, Self::StreamWrite { .. })
    }

    fn write_arguments(&self, amp_box: &mut AmpBox) {
        match self {
            Self::Start { directory } => {
                amp_box.insert("directory", directory.to_string());
            }
            Self::Run { test_case } => {
                amp_box.insert("testCase", test_case.to_string());
            }
            Self::StreamOpen => {}
            Self::StreamWrite { stream_id, data } => {
                amp_box.insert("streamId", stream_id.to_string());
                amp_box.insert("data", data.clone());
            }
            Self::TestWrite { out } => {
                amp_box.insert("out", out.clone());
            }
            Self::AddSuccess { test_name } => {
                amp_box.insert("testName", test_name.to_string());
            }
            Self::AddError {
                test_name,
                error_class,
                error_stream_id,
                frames_stream_id,
            } => {
                amp_box.insert("testName", test_name.to_string());
                amp_box.insert("errorClass", error_class.clone());
                amp_box.insert("errorStreamId", error_stream_id.to_string());
                amp_box.insert("framesStreamId", frames_stream_id.to_string());
            }
            Self::AddFailure {
                test_name,
                fail_class,
                fail_stream_id,
                frames_stream_id,
            } => {
                amp_box.insert("testName", test_name.to_string());
                amp_box.insert("failClass", fail_class.clone());
                amp_box.insert("failStreamId", fail_stream_id.to_string());
                amp_box.insert("framesStreamId", frames_stream_id.to_string());
            }
            Self::AddSkip { test_name, reason } => {
                amp_box.insert("testName", test_name.to_string());
                amp_box.insert("reason", reason.clone());
            }
            Self::AddExpectedFailure {
                test_name,
                error_stream_id,
                todo,
            } => {
                amp_box.insert("testName", test_name.to_string());
                amp_box.insert("errorStreamId", error_stream_id.to_string());
                if let Some(todo) = todo {
                    amp_box.insert("todo", todo.clone());
                }
            }
            Self::AddUnexpectedSuccess { test_name, todo } => {
                amp_box.insert("testName", test_name.to_string());
                if let Some(todo) = todo {
                    amp_box.insert("todo", todo.clone());
                }
            }
        }
    }

    /// Decodes a command's arguments. Returns `Ok(None)` if the name is not a known command.
    fn read_arguments(name: &str, amp_box: &AmpBox) -> Result<Option<Self>, ProtocolError> {
        let command = match name {
            "Start" => {
                let args = Arguments::new("Start", amp_box);
                Self::Start {
                    directory: args.string("directory")?.into(),
                }
            }
            "Run" => {
                let args = Arguments::new("Run", amp_box);
                Self::Run {
                    test_case: args.string("testCase")?.into(),
                }
            }
            "StreamOpen" => Self::StreamOpen,
            "StreamWrite" => {
                let args = Arguments::new("StreamWrite", amp_box);
                Self::StreamWrite {
                    stream_id: args.parse("streamId")?,
                    data: args.bytes("data")?.clone(),
                }
            }
            "TestWrite" => {
                let args = Arguments::new("TestWrite", amp_box);
                Self::TestWrite {
                    out: args.string("out")?,
                }
            }
            "AddSuccess" => {
                let args = Arguments::new("AddSuccess", amp_box);
                Self::AddSuccess {
                    test_name: args.string("testName")?.into(),
                }
            }
            "AddError" => {
                let args = Arguments::new("AddError", amp_box);
                Self::AddError {
                    test_name: args.string("testName")?.into(),
                    error_class: args.string("errorClass")?,
                    error_stream_id: args.parse("errorStreamId")?,
                    frames_stream_id: args.parse("framesStreamId")?,
                }
            }
            "AddFailure" => {
                let args = Arguments::new("AddFailure", amp_box);
                Self::AddFailure {
                    test_name: args.string("testName")?.into(),
                    fail_class: args.string("failClass")?,
                    fail_stream_id: args.parse("failStreamId")?,
                    frames_stream_id: args.parse("framesStreamId")?,
                }
            }
            "AddSkip" => {
                let args = Arguments::new("AddSkip", amp_box);
                Self::AddSkip {
                    test_name: args.string("testName")?.into(),
                    reason: args.string("reason")?,
                }
            }
            "AddExpectedFailure" => {
                let args = Arguments::new("AddExpectedFailure", amp_box);
                Self::AddExpectedFailure {
                    test_name: args.string("testName")?.into(),
                    error_stream_id: args.parse("errorStreamId")?,
                    todo: args.optional_string("todo")?,
                }
            }
            "AddUnexpectedSuccess" => {
                let args = Arguments::new("AddUnexpectedSuccess", amp_box);
                Self::AddUnexpectedSuccess {
                    test_name: args.string("testName")?.into(),
                    todo: args.optional_string("todo")?,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(command))
    }
}

/// A decoded box.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    /// A command. `tag` is `None` for commands that are not answered.
    Command {
        /// The request tag.
        tag: Option<Tag>,
        /// The command.
        command: Command,
    },

    /// A command this side does not know.
    UnknownCommand {
        /// The request tag.
        tag: Option<Tag>,
        /// The command name.
        name: String,
    },

    /// A successful reply.
    Answer {
        /// The tag of the command being answered.
        tag: Tag,
        /// The reply's values, with the reserved keys removed.
        values: AmpBox,
    },

    /// A failed reply.
    Error {
        /// The tag of the command being answered.
        tag: Tag,
        /// The error code.
        code: String,
        /// A description of the error.
        description: String,
    },
}

impl Message {
    /// Encodes this message as a box.
    pub fn to_box(&self) -> AmpBox {
        let mut amp_box = AmpBox::new();
        match self {
            Self::Command { tag, command } => {
                if let Some(tag) = tag {
                    amp_box.insert(ASK, tag.to_string());
                }
                amp_box.insert(COMMAND, command.name());
                command.write_arguments(&mut amp_box);
            }
            Self::UnknownCommand { tag, name } => {
                if let Some(tag) = tag {
                    amp_box.insert(ASK, tag.to_string());
                }
                amp_box.insert(COMMAND, name.clone());
            }
            Self::Answer { tag, values } => {
                amp_box.insert(ANSWER, tag.to_string());
                // Reserved keys in the values would corrupt routing on the other end.
                for (key, value) in values.iter().filter(|(key, _)| !key.starts_with('_')) {
                    amp_box.insert(key.clone(), value.clone());
                }
            }
            Self::Error {
                tag,
                code,
                description,
            } => {
                amp_box.insert(ERROR, tag.to_string());
                amp_box.insert(ERROR_CODE, code.clone());
                amp_box.insert(ERROR_DESCRIPTION, description.clone());
            }
        }
        amp_box
    }

    /// Decodes a box.
    pub fn from_box(mut amp_box: AmpBox) -> Result<Self, ProtocolError> {
        if let Some(name) = amp_box.remove(COMMAND) {
            let tag = amp_box
                .remove(ASK)
                .map(|tag| Tag::decode("command", ASK, &tag))
                .transpose()?;
            let name = decode_str("command", COMMAND, &name)?;
            return Ok(match Command::read_arguments(name, &amp_box)? {
                Some(command) => Self::Command { tag, command },
                None => Self::UnknownCommand {
                    tag,
                    name: name.to_owned(),
                },
            });
        }
        if let Some(tag) = amp_box.remove(ANSWER) {
            let tag = Tag::decode("answer", ANSWER, &tag)?;
            return Ok(Self::Answer {
                tag,
                values: amp_box,
            });
        }
        if let Some(tag) = amp_box.remove(ERROR) {
            let tag = Tag::decode("error", ERROR, &tag)?;
            let args = Arguments::new("error", &amp_box);
            return Ok(Self::Error {
                tag,
                code: args.string(ERROR_CODE)?,
                description: args.optional_string(ERROR_DESCRIPTION)?.unwrap_or_default(),
            });
        }
        Err(ProtocolError::UnroutableBox)
    }
}

/// Builds and parses the values of answers.
pub mod answer {
    use super::*;

    /// An answer carrying `success`.
    pub fn success(success: bool) -> AmpBox {
        AmpBox::new().with("success", encode_bool(success))
    }

    /// The answer to [`Command::StreamOpen`].
    pub fn stream_id(id: StreamId) -> AmpBox {
        AmpBox::new().with("streamId", id.to_string())
    }

    /// Parses the `success` value of an answer.
    pub fn parse_success(context: &'static str, values: &AmpBox) -> Result<bool, ProtocolError> {
        let args = Arguments::new(context, values);
        decode_bool(context, "success", args.bytes("success")?)
    }

    /// Parses the `streamId` value of an answer.
    pub fn parse_stream_id(values: &AmpBox) -> Result<StreamId, ProtocolError> {
        Arguments::new("StreamOpen", values).parse("streamId")
    }
}

/// Encodes stack frames for a frames stream: `function\0file\0line\0` per frame.
pub fn encode_frames(frames: &[Frame]) -> Vec<u8> {
    let mut out = Vec::new();
    for frame in frames {
        let line = frame.line.to_string();
        for field in [frame.function.as_bytes(), frame.file.as_bytes(), line.as_bytes()] {
            out.extend_from_slice(field);
            out.push(0);
        }
    }
    out
}

/// Decodes the chunks of a frames stream into frames, taking fields three at a time.
pub fn decode_frames(chunks: &[Bytes]) -> Result<Vec<Frame>, ProtocolError> {
    let data = chunks.concat();
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let Some(data) = data.strip_suffix(b"\0") else {
        return Err(invalid("frames", "framesStreamId", "missing terminator"));
    };
    let fields: Vec<_> = data.split(|&b| b == 0).collect();
    if fields.len() % 3 != 0 {
        return Err(invalid(
            "frames",
            "framesStreamId",
            format_args!("{} fields is not a whole number of frames", fields.len()),
        ));
    }

    fields
        .chunks_exact(3)
        .map(|triple| {
            let function = decode_str("frames", "function", triple[0])?;
            let file = decode_str("frames", "file", triple[1])?;
            let line = decode_str("frames", "line", triple[2])?;
            Ok(Frame {
                function: function.to_owned(),
                file: file.to_owned(),
                line: line
                    .parse()
                    .map_err(|error| invalid("frames", "line", error))?,
            })
        })
        .collect()
}

/// Handles commands received from the peer while this side is waiting for an answer.
pub trait Responder {
    /// Handles one command, returning the values to answer it with.
    fn respond(
        &mut self,
        command: Command,
    ) -> impl Future<Output = Result<AmpBox, ResponderError>>;
}

/// A responder that refuses every command.
#[derive(Debug, Default)]
pub struct RefuseCommands;

impl Responder for RefuseCommands {
    async fn respond(&mut self, command: Command) -> Result<AmpBox, ResponderError> {
        Err(ProtocolError::UnexpectedCommand {
            command: command.name().to_owned(),
        }
        .into())
    }
}

/// One end of a control connection: a box reader, a box writer and a tag counter.
///
/// A channel is driven by its owner: nothing is read unless the owner is waiting for a message,
/// either through [`Self::receive`] or while a [`Self::call`] is outstanding.
#[derive(Debug)]
pub struct Channel<R, W> {
    reader: AmpReader<R>,
    writer: Option<AmpWriter<W>>,
    next_tag: u64,
}

impl<R, W> Channel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates a channel over a reader and a writer.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: AmpReader::new(reader),
            writer: Some(AmpWriter::new(writer)),
            next_tag: 1,
        }
    }

    /// Returns true until [`Self::close`] is called.
    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Shuts down and drops the write side, signaling end-of-file to the peer.
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take()
            && let Err(error) = writer.shutdown().await
        {
            debug!("error shutting down control channel: {error}");
        }
    }

    /// Reads and decodes the next message, or returns `Ok(None)` at end-of-file.
    pub async fn receive(&mut self) -> Result<Option<Message>, WorkerError> {
        match self.reader.read_box().await? {
            Some(amp_box) => Ok(Some(Message::from_box(amp_box)?)),
            None => Ok(None),
        }
    }

    /// Sends a message.
    pub async fn send(&mut self, message: &Message) -> Result<(), WorkerError> {
        let writer = self.writer.as_mut().ok_or(WorkerError::ConnectionLost)?;
        writer.write_box(&message.to_box()).await
    }

    /// Sends a command and waits for its answer.
    ///
    /// Commands the peer sends in the meantime are handed to `responder` and answered. Commands
    /// that are not answered return an empty box immediately after being sent.
    pub async fn call<H: Responder>(
        &mut self,
        command: Command,
        responder: &mut H,
    ) -> Result<AmpBox, WorkerError> {
        let tag = command.requires_answer().then(|| self.allocate_tag());
        self.send(&Message::Command { tag, command }).await?;
        let Some(tag) = tag else {
            return Ok(AmpBox::new());
        };

        loop {
            let Some(message) = self.receive().await? else {
                return Err(WorkerError::ConnectionLost);
            };
            match message {
                Message::Answer {
                    tag: reply_tag,
                    values,
                } if reply_tag == tag => return Ok(values),
                Message::Error {
                    tag: reply_tag,
                    code,
                    description,
                } if reply_tag == tag => {
                    return Err(WorkerError::Remote { code, description });
                }
                Message::Answer { tag, .. } | Message::Error { tag, .. } => {
                    return Err(ProtocolError::UnexpectedReply { tag }.into());
                }
                Message::Command { tag, command } => {
                    self.dispatch(tag, command, responder).await?;
                }
                Message::UnknownCommand { tag, name } => {
                    self.reply_unknown(tag, name).await?;
                }
            }
        }
    }

    /// Hands a received command to `responder` and sends its reply, if the command expects one.
    pub async fn dispatch<H: Responder>(
        &mut self,
        tag: Option<Tag>,
        command: Command,
        responder: &mut H,
    ) -> Result<(), WorkerError> {
        let name = command.name();
        let result = responder.respond(command).await;
        self.reply(tag, name, result).await
    }

    /// Sends the reply to a command, logging a failed result.
    pub async fn reply(
        &mut self,
        tag: Option<Tag>,
        name: &'static str,
        result: Result<AmpBox, ResponderError>,
    ) -> Result<(), WorkerError> {
        let reply = match result {
            Ok(values) => tag.map(|tag| Message::Answer { tag, values }),
            Err(error) => {
                error!(command = name, "{}", DisplayErrorChain::new(&error));
                tag.map(|tag| Message::Error {
                    tag,
                    code: UNHANDLED_ERROR_CODE.to_owned(),
                    description: error.to_string(),
                })
            }
        };
        match reply {
            Some(reply) => self.send(&reply).await,
            None => Ok(()),
        }
    }

    /// Replies to a command this side does not know.
    pub async fn reply_unknown(&mut self, tag: Option<Tag>, name: String) -> Result<(), WorkerError> {
        error!(command = %name, "received unknown command");
        match tag {
            Some(tag) => {
                self.send(&Message::Error {
                    tag,
                    code: UNKNOWN_ERROR_CODE.to_owned(),
                    description: format!("unknown command `{name}`"),
                })
                .await
            }
            None => Ok(()),
        }
    }

    fn allocate_tag(&mut self) -> Tag {
        let tag = Tag(self.next_tag);
        self.next_tag += 1;
        tag
    }
}

/// Typed access to the arguments of a box.
struct Arguments<'a> {
    context: &'static str,
    amp_box: &'a AmpBox,
}

impl<'a> Arguments<'a> {
    fn new(context: &'static str, amp_box: &'a AmpBox) -> Self {
        Self { context, amp_box }
    }

    fn bytes(&self, argument: &'static str) -> Result<&'a Bytes, ProtocolError> {
        self.amp_box
            .get(argument)
            .ok_or(ProtocolError::MissingArgument {
                command: self.context,
                argument,
            })
    }

    fn string(&self, argument: &'static str) -> Result<String, ProtocolError> {
        decode_str(self.context, argument, self.bytes(argument)?).map(str::to_owned)
    }

    fn optional_string(&self, argument: &'static str) -> Result<Option<String>, ProtocolError> {
        self.amp_box
            .get(argument)
            .map(|value| decode_str(self.context, argument, value).map(str::to_owned))
            .transpose()
    }

    fn parse<T>(&self, argument: &'static str) -> Result<T, ProtocolError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        decode_str(self.context, argument, self.bytes(argument)?)?
            .parse()
            .map_err(|error| invalid(self.context, argument, error))
    }
}

fn decode_str<'a>(context: &str, argument: &str, value: &'a [u8]) -> Result<&'a str, ProtocolError> {
    std::str::from_utf8(value).map_err(|error| invalid(context, argument, error))
}

fn encode_bool(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

fn decode_bool(context: &str, argument: &str, value: &[u8]) -> Result<bool, ProtocolError> {
    match value {
        b"True" => Ok(true),
        b"False" => Ok(false),
        _ => Err(invalid(
            context,
            argument,
            format_args!("expected `True` or `False`, got {:?}", String::from_utf8_lossy(value)),
        )),
    }
}

fn invalid(context: &str, argument: &str, reason: impl fmt::Display) -> ProtocolError {
    ProtocolError::InvalidArgument {
        context: context.to_owned(),
        argument: argument.to_owned(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn round_trip(message: Message) {
        let decoded = Message::from_box(message.to_box()).expect("message decodes");
        assert_eq!(decoded, message);
    }

    #[test]
    fn commands_round_trip() {
        round_trip(Message::Command {
            tag: Some(Tag::new(0x1f)),
            command: Command::AddError {
                test_name: "pkg.test_thing".into(),
                error_class: "ValueError".to_owned(),
                error_stream_id: StreamId::new(3),
                frames_stream_id: StreamId::new(4),
            },
        });
        round_trip(Message::Command {
            tag: Some(Tag::new(2)),
            command: Command::AddExpectedFailure {
                test_name: "pkg.test_todo".into(),
                error_stream_id: StreamId::new(0),
                todo: None,
            },
        });
        round_trip(Message::Command {
            tag: None,
            command: Command::StreamWrite {
                stream_id: StreamId::new(7),
                data: Bytes::from_static(b"\0\xffbinary"),
            },
        });
    }

    #[test]
    fn command_box_uses_wire_names() {
        let amp_box = Message::Command {
            tag: Some(Tag::new(26)),
            command: Command::AddSkip {
                test_name: "a.b".into(),
                reason: "no network".to_owned(),
            },
        }
        .to_box();
        assert_eq!(
            amp_box,
            AmpBox::new()
                .with("_ask", "1a")
                .with("_command", "AddSkip")
                .with("testName", "a.b")
                .with("reason", "no network")
        );
    }

    #[test]
    fn stream_write_is_not_answered() {
        let command = Command::StreamWrite {
            stream_id: StreamId::new(0),
            data: Bytes::new(),
        };
        assert!(!command.requires_answer());
        assert!(Command::StreamOpen.requires_answer());
    }

    #[test]
    fn unknown_command_decodes() {
        let amp_box = AmpBox::new().with("_ask", "5").with("_command", "Frobnicate");
        assert_eq!(
            Message::from_box(amp_box).unwrap(),
            Message::UnknownCommand {
                tag: Some(Tag::new(5)),
                name: "Frobnicate".to_owned(),
            }
        );
    }

    #[test]
    fn missing_argument_is_reported() {
        let amp_box = AmpBox::new().with("_ask", "5").with("_command", "AddSkip").with("testName", "t");
        assert_eq!(
            Message::from_box(amp_box),
            Err(ProtocolError::MissingArgument {
                command: "AddSkip",
                argument: "reason",
            })
        );
    }

    #[test]
    fn answers_and_errors_decode() {
        let answer = AmpBox::new().with("_answer", "ff").with("success", "True");
        let Message::Answer { tag, values } = Message::from_box(answer).unwrap() else {
            panic!("expected an answer");
        };
        assert_eq!(tag, Tag::new(255));
        assert!(answer::parse_success("Run", &values).unwrap());

        round_trip(Message::Error {
            tag: Tag::new(1),
            code: UNHANDLED_ERROR_CODE.to_owned(),
            description: "boom".to_owned(),
        });
        assert_eq!(
            Message::from_box(AmpBox::new().with("success", "True")),
            Err(ProtocolError::UnroutableBox)
        );
    }

    #[test_case(b"True", Some(true); "true")]
    #[test_case(b"False", Some(false); "false")]
    #[test_case(b"true", None; "lowercase is invalid")]
    #[test_case(b"1", None; "integer is invalid")]
    fn success_values(value: &'static [u8], expected: Option<bool>) {
        let values = AmpBox::new().with("success", value);
        assert_eq!(answer::parse_success("Run", &values).ok(), expected);
    }

    #[test]
    fn frames_split_by_stride_of_three() {
        let frames = vec![
            Frame {
                function: "test_one".to_owned(),
                file: "tests/one.py".to_owned(),
                line: 12,
            },
            Frame {
                function: "helper".to_owned(),
                file: "lib.py".to_owned(),
                line: 3,
            },
        ];
        let encoded = encode_frames(&frames);
        assert_eq!(&encoded[..], b"test_one\0tests/one.py\012\0helper\0lib.py\03\0");

        // Chunk boundaries do not matter.
        let (a, b) = encoded.split_at(5);
        let chunks = [Bytes::copy_from_slice(a), Bytes::copy_from_slice(b)];
        assert_eq!(decode_frames(&chunks).unwrap(), frames);
        assert_eq!(decode_frames(&[]).unwrap(), vec![]);
    }

    #[test]
    fn incomplete_frames_are_rejected() {
        let chunks = [Bytes::from_static(b"f\0file\0")];
        assert!(decode_frames(&chunks).is_err());
        let chunks = [Bytes::from_static(b"f\0file\0notanumber\0")];
        assert!(decode_frames(&chunks).is_err());
    }

    #[tokio::test]
    async fn call_services_peer_commands() {
        struct Echo(Vec<Command>);

        impl Responder for Echo {
            async fn respond(&mut self, command: Command) -> Result<AmpBox, ResponderError> {
                self.0.push(command);
                Ok(answer::success(true))
            }
        }

        let (a, b) = tokio::io::duplex(1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let mut caller = Channel::new(a_read, a_write);
        let mut peer = Channel::new(b_read, b_write);

        let peer_side = async {
            let Some(Message::Command { tag, command }) = peer.receive().await.unwrap() else {
                panic!("expected a command");
            };
            assert_eq!(command, Command::Run { test_case: "t".into() });
            let values = peer
                .call(Command::AddSuccess { test_name: "t".into() }, &mut RefuseCommands)
                .await
                .unwrap();
            assert!(answer::parse_success("AddSuccess", &values).unwrap());
            peer.reply(tag, "Run", Ok(answer::success(true))).await.unwrap();
        };

        let mut echo = Echo(Vec::new());
        let (values, ()) = tokio::join!(
            caller.call(Command::Run { test_case: "t".into() }, &mut echo),
            peer_side,
        );
        assert!(answer::parse_success("Run", &values.unwrap()).unwrap());
        assert_eq!(echo.0, vec![Command::AddSuccess { test_name: "t".into() }]);
    }
}
