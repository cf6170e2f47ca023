// Copyright (c) The disttrial Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Box framing for the control protocol.
//!
//! A box is a sequence of key/value pairs. Each key is written as a big-endian `u16` length
//! followed by the key bytes, and each value as a big-endian `u16` length followed by the value
//! bytes. A zero-length key terminates the box.

use super::{MAX_KEY_LENGTH, MAX_VALUE_LENGTH};
use crate::errors::{ProtocolError, WorkerError};
use bytes::{BufMut, Bytes, BytesMut};
use indexmap::IndexMap;
use smol_str::SmolStr;
use std::io;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

/// An ordered set of key/value pairs: the unit of the control protocol.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AmpBox {
    fields: IndexMap<SmolStr, Bytes>,
}

impl AmpBox {
    /// Creates an empty box.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, replacing any previous value for the key.
    pub fn insert(&mut self, key: impl Into<SmolStr>, value: impl Into<Bytes>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Builder-style [`Self::insert`].
    pub fn with(mut self, key: impl Into<SmolStr>, value: impl Into<Bytes>) -> Self {
        self.insert(key, value);
        self
    }

    /// Returns the value for a key.
    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.fields.get(key)
    }

    /// Removes and returns the value for a key, preserving the order of the remaining fields.
    pub fn remove(&mut self, key: &str) -> Option<Bytes> {
        self.fields.shift_remove(key)
    }

    /// Returns true if the box has a value for the key.
    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Iterates over the fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&SmolStr, &Bytes)> {
        self.fields.iter()
    }

    /// Returns the number of fields in the box.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if the box has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Appends the wire encoding of this box to `buf`.
    ///
    /// Nothing is written if any key or value exceeds the protocol limits.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        for (key, value) in &self.fields {
            if key.is_empty() || key.len() > MAX_KEY_LENGTH {
                return Err(ProtocolError::InvalidKeyLength { len: key.len() });
            }
            if value.len() > MAX_VALUE_LENGTH {
                return Err(ProtocolError::ValueTooLong {
                    key: key.to_string(),
                    len: value.len(),
                });
            }
        }

        let len = self
            .fields
            .iter()
            .map(|(key, value)| 4 + key.len() + value.len())
            .sum::<usize>();
        buf.reserve(len + 2);
        // Lengths were checked above.
        for (key, value) in &self.fields {
            buf.put_u16(key.len() as u16);
            buf.put_slice(key.as_bytes());
            buf.put_u16(value.len() as u16);
            buf.put_slice(value);
        }
        buf.put_u16(0);
        Ok(())
    }
}

/// Reads boxes from a byte stream.
#[derive(Debug)]
pub struct AmpReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> AmpReader<R> {
    /// Creates a new reader.
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    /// Reads the next box.
    ///
    /// Returns `Ok(None)` if the stream ends cleanly between boxes. A stream that ends in the
    /// middle of a box fails with [`WorkerError::ConnectionLost`].
    pub async fn read_box(&mut self) -> Result<Option<AmpBox>, WorkerError> {
        if self.inner.fill_buf().await?.is_empty() {
            return Ok(None);
        }

        let mut amp_box = AmpBox::new();
        loop {
            let key_len = usize::from(self.read_u16().await?);
            if key_len == 0 {
                return Ok(Some(amp_box));
            }
            if key_len > MAX_KEY_LENGTH {
                return Err(ProtocolError::InvalidKeyLength { len: key_len }.into());
            }
            let key = self.read_exact(key_len).await?;
            let key = std::str::from_utf8(&key).map_err(|error| ProtocolError::InvalidArgument {
                context: "box".to_owned(),
                argument: "key".to_owned(),
                reason: error.to_string(),
            })?;
            let key = SmolStr::new(key);

            let value_len = usize::from(self.read_u16().await?);
            let value = self.read_exact(value_len).await?;
            amp_box.insert(key, value);
        }
    }

    async fn read_u16(&mut self) -> Result<u16, WorkerError> {
        self.inner.read_u16().await.map_err(eof_to_lost)
    }

    async fn read_exact(&mut self, len: usize) -> Result<Bytes, WorkerError> {
        let mut buf = vec![0; len];
        self.inner.read_exact(&mut buf).await.map_err(eof_to_lost)?;
        Ok(Bytes::from(buf))
    }
}

/// Writes boxes to a byte stream.
#[derive(Debug)]
pub struct AmpWriter<W> {
    inner: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> AmpWriter<W> {
    /// Creates a new writer.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
        }
    }

    /// Encodes and writes a box, then flushes the stream.
    pub async fn write_box(&mut self, amp_box: &AmpBox) -> Result<(), WorkerError> {
        self.buf.clear();
        amp_box.encode(&mut self.buf)?;
        self.inner
            .write_all(&self.buf)
            .await
            .map_err(broken_pipe_to_lost)?;
        self.inner.flush().await.map_err(broken_pipe_to_lost)?;
        Ok(())
    }

    /// Shuts down the write side of the stream, signaling end-of-file to the peer.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

fn eof_to_lost(error: io::Error) -> WorkerError {
    if error.kind() == io::ErrorKind::UnexpectedEof {
        WorkerError::ConnectionLost
    } else {
        WorkerError::Io(error)
    }
}

fn broken_pipe_to_lost(error: io::Error) -> WorkerError {
    if error.kind() == io::ErrorKind::BrokenPipe {
        WorkerError::ConnectionLost
    } else {
        WorkerError::Io(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn encode_layout() {
        let amp_box = AmpBox::new()
            .with("_command", "Run")
            .with("testCase", "a.b");
        let mut buf = BytesMut::new();
        amp_box.encode(&mut buf).unwrap();
        assert_eq!(
            &buf[..],
            b"\x00\x08_command\x00\x03Run\x00\x08testCase\x00\x03a.b\x00\x00"
        );
    }

    #[test]
    fn encode_rejects_oversized_fields() {
        let mut buf = BytesMut::new();
        let long_key = "k".repeat(MAX_KEY_LENGTH + 1);
        assert_eq!(
            AmpBox::new().with(long_key, "v").encode(&mut buf),
            Err(ProtocolError::InvalidKeyLength {
                len: MAX_KEY_LENGTH + 1
            })
        );
        assert_eq!(
            AmpBox::new().with("", "v").encode(&mut buf),
            Err(ProtocolError::InvalidKeyLength { len: 0 })
        );

        let long_value = vec![0u8; MAX_VALUE_LENGTH + 1];
        assert_eq!(
            AmpBox::new().with("data", long_value).encode(&mut buf),
            Err(ProtocolError::ValueTooLong {
                key: "data".to_owned(),
                len: MAX_VALUE_LENGTH + 1,
            })
        );
        assert!(buf.is_empty(), "nothing written on error");

        let max_value = vec![0u8; MAX_VALUE_LENGTH];
        AmpBox::new()
            .with("data", max_value)
            .encode(&mut buf)
            .expect("maximum value length is accepted");
    }

    #[tokio::test]
    async fn read_boxes_then_clean_eof() {
        let first = AmpBox::new().with("_ask", "1").with("_command", "StreamOpen");
        let second = AmpBox::new().with("_answer", "1").with("streamId", "0");
        let empty = AmpBox::new().with("data", Bytes::new());

        let mut buf = BytesMut::new();
        first.encode(&mut buf).unwrap();
        second.encode(&mut buf).unwrap();
        empty.encode(&mut buf).unwrap();

        let mut reader = AmpReader::new(&buf[..]);
        assert_eq!(reader.read_box().await.unwrap(), Some(first));
        assert_eq!(reader.read_box().await.unwrap(), Some(second));
        assert_eq!(reader.read_box().await.unwrap(), Some(empty));
        assert_eq!(reader.read_box().await.unwrap(), None);
    }

    #[tokio::test]
    async fn eof_mid_box_is_connection_lost() {
        let mut buf = BytesMut::new();
        AmpBox::new()
            .with("_command", "Run")
            .encode(&mut buf)
            .unwrap();
        let truncated = &buf[..buf.len() - 3];

        let mut reader = AmpReader::new(truncated);
        let error = reader.read_box().await.unwrap_err();
        assert!(
            matches!(error, WorkerError::ConnectionLost),
            "unexpected error: {error:?}"
        );
    }

    #[tokio::test]
    async fn oversized_key_length_is_rejected() {
        let mut reader = AmpReader::new(&b"\x01\x00"[..]);
        let error = reader.read_box().await.unwrap_err();
        assert!(
            matches!(
                error,
                WorkerError::Protocol(ProtocolError::InvalidKeyLength { len: 256 })
            ),
            "unexpected error: {error:?}"
        );
    }

    #[tokio::test]
    async fn writer_round_trips_through_duplex() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = AmpWriter::new(client);
        let mut reader = AmpReader::new(server);

        // Larger than the duplex buffer, so the write and read must interleave.
        let amp_box = AmpBox::new().with("data", vec![7u8; 1000]);
        let (written, read) = tokio::join!(writer.write_box(&amp_box), reader.read_box());
        written.unwrap();
        assert_eq!(read.unwrap(), Some(amp_box));

        writer.shutdown().await.unwrap();
        drop(writer);
        assert_eq!(reader.read_box().await.unwrap(), None);
    }
}
