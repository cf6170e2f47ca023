// Copyright (c) The disttrial Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The combined test log that every worker's `TestWrite` output is appended to.

use camino::{Utf8Path, Utf8PathBuf};
use std::{
    fs::File,
    io::{self, BufWriter, Write},
    sync::{Arc, Mutex, PoisonError},
};
use tracing::debug;

/// A shared handle to the combined test log.
///
/// Clones refer to the same log. Lines from different workers never interleave mid-line.
#[derive(Clone)]
pub struct TestLog {
    path: Option<Utf8PathBuf>,
    inner: Arc<Mutex<Option<Box<dyn Write + Send>>>>,
}

impl TestLog {
    /// Creates (or truncates) the log file at `path`, creating parent directories as needed.
    pub fn open(path: impl Into<Utf8PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        Ok(Self {
            path: Some(path),
            inner: Arc::new(Mutex::new(Some(Box::new(BufWriter::new(file))))),
        })
    }

    /// Creates a log backed by an arbitrary writer.
    pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            path: None,
            inner: Arc::new(Mutex::new(Some(Box::new(writer)))),
        }
    }

    /// Creates a log that discards everything written to it.
    pub fn discard() -> Self {
        Self::from_writer(io::sink())
    }

    /// Returns the path of the log file, if it is backed by one.
    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    /// Appends `line` and a newline, then flushes.
    ///
    /// Lines written after [`Self::close`] are dropped.
    pub fn write_line(&self, line: &str) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.as_mut() {
            Some(writer) => {
                writer.write_all(line.as_bytes())?;
                writer.write_all(b"\n")?;
                writer.flush()
            }
            None => {
                debug!(line, "dropping test log line written after close");
                Ok(())
            }
        }
    }

    /// Flushes and closes the log. Every clone observes the close.
    pub fn close(&self) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.take() {
            Some(mut writer) => writer.flush(),
            None => Ok(()),
        }
    }

    /// Returns true if the log has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl std::fmt::Debug for TestLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestLog")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    #[test]
    fn lines_are_flushed_and_close_is_shared() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("nested/dir/test.log");
        let log = TestLog::open(&path).unwrap();
        let clone = log.clone();

        log.write_line("first").unwrap();
        clone.write_line("second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");

        clone.close().unwrap();
        assert!(log.is_closed());
        log.write_line("dropped").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
        assert_eq!(log.path(), Some(path.as_path()));
    }

    #[test]
    fn open_truncates() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("test.log");
        std::fs::write(&path, "stale contents\n").unwrap();
        let log = TestLog::open(&path).unwrap();
        log.close().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }
}
