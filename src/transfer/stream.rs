//! Blocking byte streams the transfer engines run over.

use std::time::{Duration, Instant};

use tracing::debug;

use super::TransferState;
use crate::error::ExecError;
use crate::remote::{Channel, StreamRead};
use crate::supervisor::CancelToken;
use crate::Result;

const IO_PAUSE: Duration = Duration::from_millis(5);
const EXIT_WAIT: Duration = Duration::from_secs(10);
const READ_CHUNK: usize = 32 * 1024;

/// A reliable, ordered, blocking byte stream.
pub trait ByteStream {
    /// Send every byte of `data`.
    fn send_all(&mut self, data: &[u8]) -> Result<()>;

    /// Receive up to `buf.len()` bytes. Returns 0 at end of stream.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Read one byte, `None` at end of stream.
pub(crate) fn read_byte<S: ByteStream + ?Sized>(stream: &mut S) -> Result<Option<u8>> {
    let mut byte = [0u8; 1];
    match stream.recv(&mut byte)? {
        0 => Ok(None),
        _ => Ok(Some(byte[0])),
    }
}

/// Read one `\n`-terminated line without the terminator. `None` when the
/// stream ends before the first byte.
pub(crate) fn read_line<S: ByteStream + ?Sized>(stream: &mut S) -> Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    loop {
        match read_byte(stream)? {
            Some(b'\n') => return Ok(Some(line)),
            Some(byte) => line.push(byte),
            None if line.is_empty() => return Ok(None),
            None => {
                return Err(ExecError::ProtocolError(format!(
                    "stream ended inside line {:?}",
                    String::from_utf8_lossy(&line)
                )))
            }
        }
    }
}

/// Read a status byte and fail unless it is `\0`.
pub(crate) fn expect_ack<S: ByteStream + ?Sized>(stream: &mut S) -> Result<()> {
    match read_byte(stream)? {
        Some(0) => Ok(()),
        Some(1) | Some(2) => {
            let message = read_line(stream)?.unwrap_or_default();
            Err(ExecError::ProtocolError(
                String::from_utf8_lossy(&message).trim().to_string(),
            ))
        }
        Some(other) => Err(ExecError::ProtocolError(format!(
            "unexpected status byte {other:#04x}"
        ))),
        None => Err(ExecError::ProtocolError(
            "peer closed the stream before confirming".into(),
        )),
    }
}

/// [`ByteStream`] over a session channel's stdin/stdout.
///
/// Waiting for the peer is a cancellation point: the transfer's abort flag
/// and the worker's token are checked on every pause. Stderr is drained and
/// kept for diagnostics.
pub struct ChannelStream<'a, Ch: Channel> {
    channel: &'a mut Ch,
    state: &'a TransferState,
    token: &'a CancelToken,
    pending: Vec<u8>,
    stderr: Vec<u8>,
}

impl<'a, Ch: Channel> ChannelStream<'a, Ch> {
    pub fn new(channel: &'a mut Ch, state: &'a TransferState, token: &'a CancelToken) -> Self {
        Self {
            channel,
            state,
            token,
            pending: Vec::new(),
            stderr: Vec::new(),
        }
    }

    /// What the peer wrote to stderr so far.
    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    fn pause(&self) -> Result<()> {
        self.state.check_abort()?;
        self.token
            .sleep(IO_PAUSE)
            .map_err(|_| self.state.aborted())
    }

    fn drain_stderr(&mut self) -> Result<bool> {
        match self.channel.read_stderr(READ_CHUNK)? {
            StreamRead::Data(bytes) => {
                debug!(stderr = %String::from_utf8_lossy(&bytes).trim(), "transfer peer stderr");
                self.stderr.extend_from_slice(&bytes);
                Ok(true)
            }
            StreamRead::Pending | StreamRead::Closed => Ok(false),
        }
    }

    /// Send EOF and wait for the peer's exit status.
    pub fn finish(&mut self) -> Result<i32> {
        self.channel.send_eof()?;
        let until = Instant::now() + EXIT_WAIT;
        loop {
            let mut busy = self.drain_stderr()?;
            if let StreamRead::Data(bytes) = self.channel.read_stdout(READ_CHUNK)? {
                debug!(len = bytes.len(), "discarding trailing transfer output");
                busy = true;
            }
            if self.channel.exit_status_ready()? {
                return self.channel.exit_status();
            }
            if Instant::now() > until {
                return Err(ExecError::ProtocolError(
                    "peer did not exit after the transfer".into(),
                ));
            }
            if !busy {
                self.pause()?;
            }
        }
    }
}

impl<Ch: Channel> ByteStream for ChannelStream<'_, Ch> {
    fn send_all(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            self.state.check_abort()?;
            let written = self.channel.write_stdin(data)?;
            data = &data[written..];
            if written == 0 {
                self.drain_stderr()?;
                self.pause()?;
            }
        }
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if !self.pending.is_empty() {
                let n = buf.len().min(self.pending.len());
                buf[..n].copy_from_slice(&self.pending[..n]);
                self.pending.drain(..n);
                return Ok(n);
            }
            match self.channel.read_stdout(READ_CHUNK)? {
                StreamRead::Data(bytes) => self.pending = bytes,
                StreamRead::Closed => return Ok(0),
                StreamRead::Pending => {
                    if !self.drain_stderr()? {
                        self.pause()?;
                    }
                }
            }
        }
    }
}
