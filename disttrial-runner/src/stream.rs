// Copyright (c) The disttrial Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Chunked byte streams multiplexed over a control connection.
//!
//! A single protocol value is limited to [`MAX_VALUE_LENGTH`](crate::protocol::MAX_VALUE_LENGTH)
//! bytes. Larger payloads, such as error messages and stack frames, are split with [`chunk`], sent
//! as a `StreamOpen` followed by one `StreamWrite` per chunk, and reassembled by a
//! [`StreamReceiver`] on the other end.

use crate::errors::UnknownStream;
use bytes::Bytes;
use std::{collections::HashMap, fmt, num::NonZeroUsize, str::FromStr};

/// Identifies one stream opened on a [`StreamReceiver`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    /// Creates a stream id from its wire representation.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the wire representation of this id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StreamId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Buffers chunks written to any number of open streams until they are finished.
#[derive(Debug, Default)]
pub struct StreamReceiver {
    counter: u64,
    streams: HashMap<StreamId, Vec<Bytes>>,
}

impl StreamReceiver {
    /// Creates a new receiver with no open streams.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new stream and returns its id.
    ///
    /// Ids are never reused over the lifetime of the receiver.
    pub fn open(&mut self) -> StreamId {
        let id = StreamId(self.counter);
        self.counter += 1;
        self.streams.insert(id, Vec::new());
        id
    }

    /// Appends a chunk to an open stream.
    pub fn write(&mut self, id: StreamId, chunk: Bytes) -> Result<(), UnknownStream> {
        self.streams
            .get_mut(&id)
            .ok_or(UnknownStream { stream_id: id })?
            .push(chunk);
        Ok(())
    }

    /// Closes a stream, returning every chunk written to it in write order.
    pub fn finish(&mut self, id: StreamId) -> Result<Vec<Bytes>, UnknownStream> {
        self.streams
            .remove(&id)
            .ok_or(UnknownStream { stream_id: id })
    }

    /// Returns the number of streams that are open.
    pub fn open_count(&self) -> usize {
        self.streams.len()
    }

    /// Drops every stream that was opened but never finished, returning how many were dropped.
    pub fn discard_open(&mut self) -> usize {
        let count = self.streams.len();
        self.streams.clear();
        count
    }
}

/// Splits `data` into consecutive slices of at most `size` bytes.
///
/// Concatenating the slices yields `data` again. An empty input yields no chunks.
pub fn chunk(data: &[u8], size: NonZeroUsize) -> std::slice::Chunks<'_, u8> {
    data.chunks(size.get())
}

/// Splits `text` into consecutive slices of at most `size` bytes, breaking only at character
/// boundaries.
///
/// An empty input yields a single empty slice. A character wider than `size` is yielded on its
/// own.
pub fn chunk_str(text: &str, size: NonZeroUsize) -> impl Iterator<Item = &str> {
    let mut rest = Some(text);
    std::iter::from_fn(move || {
        let current = rest?;
        if current.len() <= size.get() {
            rest = None;
            return Some(current);
        }
        let mut end = size.get();
        while !current.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = current.chars().next().map_or(current.len(), char::len_utf8);
        }
        let (head, tail) = current.split_at(end);
        rest = Some(tail);
        Some(head)
    })
}
