//! Captured-output buffers and stream redirection.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use super::plain_text;
use crate::error::ExecError;
use crate::Result;

#[derive(Debug, Default)]
struct Cursors {
    data: Vec<u8>,
    read_pos: usize,
}

/// Append-only byte buffer shared by one writer and any number of readers.
///
/// The write cursor is the end of the data and only moves forward through
/// [`StreamBuffer::write`]. The read cursor moves through [`StreamBuffer::read`]
/// and [`StreamBuffer::read_line`] and never passes the write cursor, so bytes
/// read while the command is still running are neither lost nor returned
/// twice.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    inner: Mutex<Cursors>,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Cursors> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append bytes at the write cursor.
    pub fn write(&self, bytes: &[u8]) {
        self.lock().data.extend_from_slice(bytes);
    }

    /// Consume up to `max` unread bytes (all of them when `None`).
    pub fn read(&self, max: Option<usize>) -> Vec<u8> {
        let mut cursors = self.lock();
        let start = cursors.read_pos;
        let available = cursors.data.len() - start;
        let end = start + max.map_or(available, |m| m.min(available));
        cursors.read_pos = end;
        cursors.data[start..end].to_vec()
    }

    /// Consume one complete unread line, including its `\n`.
    pub fn read_line(&self) -> Option<Vec<u8>> {
        let mut cursors = self.lock();
        let start = cursors.read_pos;
        let newline = cursors.data[start..].iter().position(|b| *b == b'\n')?;
        let end = start + newline + 1;
        cursors.read_pos = end;
        Some(cursors.data[start..end].to_vec())
    }

    /// Everything written so far, regardless of the read cursor.
    pub fn contents(&self) -> Vec<u8> {
        self.lock().data.clone()
    }

    /// Everything written so far as plain text.
    pub fn text(&self) -> String {
        plain_text(&self.lock().data)
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes written but not yet read.
    pub fn unread(&self) -> usize {
        let cursors = self.lock();
        cursors.data.len() - cursors.read_pos
    }
}

/// Where a child's output stream goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Redirect {
    /// Share the calling process's stream.
    #[default]
    Inherit,
    /// Discard.
    Null,
    /// Capture into a [`StreamBuffer`].
    Capture,
    /// Send stderr wherever stdout goes. Only valid for stderr.
    Merge,
}

/// Resolved destination for bytes read from one output stream.
#[derive(Debug, Clone)]
pub enum OutputSink {
    Stdout,
    Stderr,
    Captured(Arc<StreamBuffer>),
    Discard,
}

impl OutputSink {
    /// Resolve the stdout/stderr redirection pair into sinks.
    ///
    /// A merged stderr shares the stdout sink, including its buffer.
    pub fn resolve(stdout: Redirect, stderr: Redirect) -> Result<(OutputSink, OutputSink)> {
        let out = match stdout {
            Redirect::Inherit => OutputSink::Stdout,
            Redirect::Null => OutputSink::Discard,
            Redirect::Capture => OutputSink::Captured(Arc::new(StreamBuffer::new())),
            Redirect::Merge => {
                return Err(ExecError::InvalidArgument(
                    "stdout cannot be merged into itself".into(),
                ))
            }
        };
        let err = match stderr {
            Redirect::Inherit => OutputSink::Stderr,
            Redirect::Null => OutputSink::Discard,
            Redirect::Capture => OutputSink::Captured(Arc::new(StreamBuffer::new())),
            Redirect::Merge => out.clone(),
        };
        Ok((out, err))
    }

    /// Deliver `bytes` to the sink.
    pub fn write(&self, bytes: &[u8]) -> io::Result<()> {
        match self {
            OutputSink::Stdout => {
                let mut stdout = io::stdout().lock();
                stdout.write_all(bytes)?;
                stdout.flush()
            }
            OutputSink::Stderr => io::stderr().lock().write_all(bytes),
            OutputSink::Captured(buffer) => {
                buffer.write(bytes);
                Ok(())
            }
            OutputSink::Discard => Ok(()),
        }
    }

    /// The capture buffer, when output is captured.
    pub fn buffer(&self) -> Option<&Arc<StreamBuffer>> {
        match self {
            OutputSink::Captured(buffer) => Some(buffer),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_advances_cursor() {
        let buffer = StreamBuffer::new();
        buffer.write(b"hello ");
        assert_eq!(buffer.read(Some(3)), b"hel");
        buffer.write(b"world");
        assert_eq!(buffer.unread(), 8);
        assert_eq!(buffer.read(None), b"lo world");
        assert!(buffer.read(None).is_empty());
        assert_eq!(buffer.contents(), b"hello world");
    }

    #[test]
    fn test_read_line_waits_for_newline() {
        let buffer = StreamBuffer::new();
        buffer.write(b"first\nsec");
        assert_eq!(buffer.read_line().unwrap(), b"first\n");
        assert!(buffer.read_line().is_none());
        buffer.write(b"ond\n");
        assert_eq!(buffer.read_line().unwrap(), b"second\n");
    }

    #[test]
    fn test_concurrent_reader_sees_every_byte_once() {
        let buffer = Arc::new(StreamBuffer::new());
        let writer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                for i in 0..2000u32 {
                    buffer.write(&i.to_le_bytes());
                }
            })
        };
        let mut seen = Vec::new();
        while seen.len() < 8000 {
            seen.extend(buffer.read(Some(7)));
        }
        writer.join().unwrap();
        assert_eq!(seen, buffer.contents());
    }

    #[test]
    fn test_text_strips_terminal_codes() {
        let buffer = StreamBuffer::new();
        buffer.write(b"\x1b[31mfail\x1b[0m\r\n");
        assert_eq!(buffer.text(), "fail\n");
    }

    #[test]
    fn test_resolve_merge_shares_buffer() {
        let (out, err) = OutputSink::resolve(Redirect::Capture, Redirect::Merge).unwrap();
        err.write(b"e").unwrap();
        out.write(b"o").unwrap();
        assert_eq!(out.buffer().unwrap().contents(), b"eo");
        assert!(Arc::ptr_eq(out.buffer().unwrap(), err.buffer().unwrap()));
    }

    #[test]
    fn test_resolve_rejects_stdout_merge() {
        assert!(OutputSink::resolve(Redirect::Merge, Redirect::Inherit).is_err());
        let (out, err) = OutputSink::resolve(Redirect::Null, Redirect::Merge).unwrap();
        assert!(matches!(out, OutputSink::Discard));
        assert!(matches!(err, OutputSink::Discard));
    }
}
