//! SCP source and sink engines.
//!
//! The source sends files, the sink receives them. Each control line is
//! confirmed by the receiving side with a single status byte: `\0` for OK,
//! `\x01` followed by a message line for an error, `\x02` for a fatal error.
//!
//! ```text
//! T<mtime> 0 <atime> 0     times of the next entry
//! C<mode> <size> <name>    file header, followed by <size> bytes and \0
//! D<mode> 0 <name>         enter directory
//! E                        leave directory
//! ```

use std::fs::{self, File, FileTimes, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

use super::stream::{expect_ack, read_byte, read_line, ByteStream};
use super::TransferState;
use crate::error::ExecError;
use crate::Result;

/// Size of data chunks on the wire.
pub const CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Times {
    mtime: u64,
    atime: u64,
}

impl Times {
    fn of(meta: &fs::Metadata) -> Self {
        let secs = |t: std::io::Result<SystemTime>| {
            t.ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |d| d.as_secs())
        };
        Self {
            mtime: secs(meta.modified()),
            atime: secs(meta.accessed()),
        }
    }

    fn parse(rest: &str) -> Result<Self> {
        let fields: Vec<&str> = rest.split(' ').collect();
        let parsed = match fields.as_slice() {
            [mtime, _, atime, _] => mtime.parse().ok().zip(atime.parse().ok()),
            _ => None,
        };
        parsed
            .map(|(mtime, atime)| Self { mtime, atime })
            .ok_or_else(|| ExecError::ProtocolError(format!("bad times line: T{rest}")))
    }

    fn line(&self) -> String {
        format!("T{} 0 {} 0\n", self.mtime, self.atime)
    }

    fn apply(&self, file: &File) -> Result<()> {
        let times = FileTimes::new()
            .set_modified(UNIX_EPOCH + Duration::from_secs(self.mtime))
            .set_accessed(UNIX_EPOCH + Duration::from_secs(self.atime));
        file.set_times(times)?;
        Ok(())
    }
}

/// Logs progress when a new tenth of the file is done.
struct Progress<'a> {
    name: &'a str,
    total: u64,
    done: u64,
    decile: u64,
}

impl<'a> Progress<'a> {
    fn new(name: &'a str, total: u64) -> Self {
        Self {
            name,
            total,
            done: 0,
            decile: 0,
        }
    }

    fn advance(&mut self, n: u64) {
        self.done += n;
        let decile = (self.done * 10).checked_div(self.total).unwrap_or(10);
        if decile > self.decile {
            self.decile = decile;
            debug!(file = self.name, percent = decile * 10, bytes = self.done, "transfer progress");
        }
    }
}

#[cfg(unix)]
fn mode_of(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

fn quote_name(name: &str) -> String {
    name.replace('\n', "\\^J")
}

fn unquote_name(name: &str) -> String {
    name.replace("\\^J", "\n")
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| ExecError::InvalidArgument(format!("{} has no file name", path.display())))
}

/// Parse `<mode> <size> <name>` after a `C` or `D`.
fn parse_entry(rest: &str) -> Result<(u32, u64, String)> {
    let bad = || ExecError::ProtocolError(format!("bad entry header: {rest}"));
    let mut fields = rest.splitn(3, ' ');
    let mode = fields
        .next()
        .and_then(|m| u32::from_str_radix(m, 8).ok())
        .ok_or_else(bad)?;
    let size = fields.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
    let name = unquote_name(fields.next().ok_or_else(bad)?);
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(ExecError::ProtocolError(format!("unsafe entry name {name:?}")));
    }
    Ok((mode, size, name))
}

/// Tell the peer an entry failed, then hand the error back.
fn refuse<S: ByteStream + ?Sized>(stream: &mut S, error: ExecError) -> Result<ExecError> {
    let message = format!("\x01scp: {error}\n");
    stream.send_all(message.as_bytes())?;
    Ok(error)
}

/// Sending side.
pub struct Source<'a> {
    state: &'a TransferState,
    recursive: bool,
    preserve_times: bool,
}

impl<'a> Source<'a> {
    pub fn new(state: &'a TransferState, recursive: bool, preserve_times: bool) -> Self {
        Self {
            state,
            recursive,
            preserve_times,
        }
    }

    /// Send `paths` after the sink signals readiness.
    pub fn run<S: ByteStream + ?Sized>(&self, stream: &mut S, paths: &[PathBuf]) -> Result<()> {
        expect_ack(stream)?;
        for path in paths {
            let meta = match fs::metadata(path) {
                Ok(meta) => meta,
                Err(e) => {
                    let error = ExecError::InvalidArgument(format!("{}: {e}", path.display()));
                    return Err(refuse(stream, error)?);
                }
            };
            if meta.is_dir() {
                if !self.recursive {
                    let error =
                        ExecError::InvalidArgument(format!("{}: is a directory", path.display()));
                    return Err(refuse(stream, error)?);
                }
                self.send_dir(stream, path, &meta)?;
            } else {
                self.send_file(stream, path, &meta)?;
            }
        }
        Ok(())
    }

    fn send_times<S: ByteStream + ?Sized>(&self, stream: &mut S, meta: &fs::Metadata) -> Result<()> {
        if self.preserve_times {
            stream.send_all(Times::of(meta).line().as_bytes())?;
            expect_ack(stream)?;
        }
        Ok(())
    }

    fn send_file<S: ByteStream + ?Sized>(
        &self,
        stream: &mut S,
        path: &Path,
        meta: &fs::Metadata,
    ) -> Result<()> {
        let name = file_name(path)?;
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                let error = ExecError::InvalidArgument(format!("{}: {e}", path.display()));
                return Err(refuse(stream, error)?);
            }
        };
        let size = meta.len();

        self.send_times(stream, meta)?;
        let header = format!("C{:04o} {} {}\n", mode_of(meta), size, quote_name(&name));
        stream.send_all(header.as_bytes())?;
        expect_ack(stream)?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut left = size;
        let mut progress = Progress::new(&name, size);
        while left > 0 {
            self.state.check_abort()?;
            let want = buf.len().min(usize::try_from(left).unwrap_or(usize::MAX));
            let n = file.read(&mut buf[..want])?;
            if n == 0 {
                return Err(ExecError::ProtocolError(format!(
                    "{} shrank during transfer",
                    path.display()
                )));
            }
            stream.send_all(&buf[..n])?;
            left -= n as u64;
            self.state.add_bytes(n as u64);
            progress.advance(n as u64);
        }

        stream.send_all(b"\0")?;
        expect_ack(stream)
    }

    fn send_dir<S: ByteStream + ?Sized>(
        &self,
        stream: &mut S,
        path: &Path,
        meta: &fs::Metadata,
    ) -> Result<()> {
        let name = file_name(path)?;
        self.send_times(stream, meta)?;
        let header = format!("D{:04o} 0 {}\n", mode_of(meta), quote_name(&name));
        stream.send_all(header.as_bytes())?;
        expect_ack(stream)?;

        let mut entries = fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort();
        for entry in entries {
            self.state.check_abort()?;
            let meta = fs::metadata(&entry)?;
            if meta.is_dir() {
                self.send_dir(stream, &entry, &meta)?;
            } else if meta.is_file() {
                self.send_file(stream, &entry, &meta)?;
            }
        }

        stream.send_all(b"E\n")?;
        expect_ack(stream)
    }
}

/// Receiving side.
pub struct Sink<'a> {
    state: &'a TransferState,
    destination: PathBuf,
    into_dir: bool,
}

impl<'a> Sink<'a> {
    /// Receive into `destination`: inside it when it is an existing
    /// directory, as it otherwise.
    pub fn new(state: &'a TransferState, destination: impl Into<PathBuf>) -> Self {
        let destination = destination.into();
        let into_dir = destination.is_dir();
        Self {
            state,
            destination,
            into_dir,
        }
    }

    /// Receive entries until the source closes the stream.
    pub fn run<S: ByteStream + ?Sized>(&self, stream: &mut S) -> Result<()> {
        let mut dirs: Vec<(PathBuf, Option<Times>)> = Vec::new();
        let mut times = None;

        loop {
            stream.send_all(b"\0")?;
            let Some(line) = read_line(stream)? else {
                break;
            };
            let Some((&kind, rest)) = line.split_first() else {
                let error = ExecError::ProtocolError("empty control line".into());
                return Err(refuse(stream, error)?);
            };
            let rest = String::from_utf8_lossy(rest).into_owned();

            match kind {
                b'T' => match Times::parse(&rest) {
                    Ok(t) => times = Some(t),
                    Err(e) => return Err(refuse(stream, e)?),
                },
                b'C' => {
                    let parent = dirs.last().map(|(dir, _)| dir.as_path());
                    self.receive_file(stream, &rest, parent, times.take())?;
                }
                b'D' => {
                    let (mode, _, name) = match parse_entry(&rest) {
                        Ok(entry) => entry,
                        Err(e) => return Err(refuse(stream, e)?),
                    };
                    let path = self.entry_path(dirs.last().map(|(dir, _)| dir.as_path()), &name);
                    if let Err(e) = Self::make_dir(&path, mode) {
                        return Err(refuse(stream, e)?);
                    }
                    debug!(path = %path.display(), "entered directory");
                    dirs.push((path, times.take()));
                }
                b'E' => {
                    let Some((dir, dir_times)) = dirs.pop() else {
                        let error = ExecError::ProtocolError("unbalanced E line".into());
                        return Err(refuse(stream, error)?);
                    };
                    if let Some(t) = dir_times {
                        t.apply(&File::open(&dir)?)?;
                    }
                }
                1 | 2 => return Err(ExecError::ProtocolError(rest.trim().to_string())),
                _ => {
                    let error = ExecError::ProtocolError(format!(
                        "unexpected control line {:?}",
                        String::from_utf8_lossy(&line)
                    ));
                    return Err(refuse(stream, error)?);
                }
            }
        }

        if !dirs.is_empty() {
            return Err(ExecError::ProtocolError(
                "stream ended inside a directory".into(),
            ));
        }
        Ok(())
    }

    fn entry_path(&self, parent: Option<&Path>, name: &str) -> PathBuf {
        match parent {
            Some(dir) => dir.join(name),
            None if self.into_dir => self.destination.join(name),
            None => self.destination.clone(),
        }
    }

    fn make_dir(path: &Path, mode: u32) -> Result<()> {
        if path.is_dir() {
            return Ok(());
        }
        if path.exists() {
            return Err(ExecError::InvalidDestination(format!(
                "{} exists and is not a directory",
                path.display()
            )));
        }
        fs::create_dir(path)?;
        set_mode(path, mode | 0o700)
    }

    fn receive_file<S: ByteStream + ?Sized>(
        &self,
        stream: &mut S,
        header: &str,
        parent: Option<&Path>,
        times: Option<Times>,
    ) -> Result<()> {
        let (mode, size, name) = match parse_entry(header) {
            Ok(entry) => entry,
            Err(e) => return Err(refuse(stream, e)?),
        };
        let path = self.entry_path(parent, &name);
        let mut file = match OpenOptions::new().write(true).create(true).truncate(false).open(&path) {
            Ok(file) => file,
            Err(e) => {
                let error = ExecError::InvalidDestination(format!("{}: {e}", path.display()));
                return Err(refuse(stream, error)?);
            }
        };
        stream.send_all(b"\0")?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut left = size;
        let mut progress = Progress::new(&name, size);
        while left > 0 {
            self.state.check_abort()?;
            // Never read into the next entry's header.
            let want = buf.len().min(usize::try_from(left).unwrap_or(usize::MAX));
            let n = stream.recv(&mut buf[..want])?;
            if n == 0 {
                return Err(ExecError::ProtocolError(format!(
                    "stream ended with {left} bytes of {name} outstanding"
                )));
            }
            file.write_all(&buf[..n])?;
            left -= n as u64;
            self.state.add_bytes(n as u64);
            progress.advance(n as u64);
        }

        match read_byte(stream)? {
            Some(0) => {}
            Some(1) | Some(2) => {
                let message = read_line(stream)?.unwrap_or_default();
                return Err(ExecError::ProtocolError(
                    String::from_utf8_lossy(&message).trim().to_string(),
                ));
            }
            Some(other) => {
                return Err(ExecError::ProtocolError(format!(
                    "unexpected status byte {other:#04x} after {name}"
                )))
            }
            None => {
                return Err(ExecError::ProtocolError(format!(
                    "stream ended before the status of {name}"
                )))
            }
        }

        file.set_len(size)?;
        set_mode(&path, mode)?;
        if let Some(t) = times {
            t.apply(&file)?;
        }
        debug!(path = %path.display(), size, "received file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::stream::tests::ScriptedStream;
    use crate::transfer::Direction;

    fn state() -> TransferState {
        TransferState::new(Direction::Pull, vec!["src".into()], "dst".into())
    }

    #[test]
    fn test_parse_entry() {
        assert_eq!(
            parse_entry("0644 12 notes.txt").unwrap(),
            (0o644, 12, "notes.txt".to_string())
        );
        assert_eq!(parse_entry("0600 0 two words").unwrap().2, "two words");
        assert_eq!(parse_entry("0600 0 a\\^Jb").unwrap().2, "a\nb");
        assert!(parse_entry("0644 x name").is_err());
        assert!(parse_entry("0644 1 ../etc/passwd").is_err());
        assert!(parse_entry("0644 1").is_err());
    }

    #[test]
    fn test_times_line() {
        let t = Times::parse("1700000000 0 1700000100 0").unwrap();
        assert_eq!(t.mtime, 1_700_000_000);
        assert_eq!(t.line(), "T1700000000 0 1700000100 0\n");
        assert!(Times::parse("1 0 2").is_err());
    }

    #[test]
    fn test_source_file_wire_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        fs::write(&path, b"hello").unwrap();
        #[cfg(unix)]
        set_mode(&path, 0o640).unwrap();

        let state = state();
        let mut stream = ScriptedStream::new(b"\0\0\0");
        Source::new(&state, false, false)
            .run(&mut stream, &[path])
            .unwrap();

        #[cfg(unix)]
        assert_eq!(stream.output, b"C0640 5 hello.txt\nhello\0");
        assert_eq!(state.bytes_transferred(), 5);
    }

    #[test]
    fn test_source_rejects_directory_without_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let state = state();
        let mut stream = ScriptedStream::new(b"\0");
        let err = Source::new(&state, false, false)
            .run(&mut stream, &[dir.path().to_path_buf()])
            .unwrap_err();
        assert!(matches!(err, ExecError::InvalidArgument(_)));
        assert_eq!(stream.output.first(), Some(&1u8));
    }

    #[test]
    fn test_sink_receives_file() {
        let dir = tempfile::tempdir().unwrap();
        let state = state();
        let mut stream = ScriptedStream::new(b"T1600000000 0 1600000000 0\nC0600 5 data.bin\nabcde\0");
        Sink::new(&state, dir.path()).run(&mut stream).unwrap();

        let path = dir.path().join("data.bin");
        assert_eq!(fs::read(&path).unwrap(), b"abcde");
        let modified = fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(modified, UNIX_EPOCH + Duration::from_secs(1_600_000_000));
        // Ready, times ack, header ack, file ack.
        assert_eq!(stream.output, b"\0\0\0\0");
    }

    #[test]
    fn test_sink_truncates_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"much longer old content").unwrap();
        let state = state();
        let mut stream = ScriptedStream::new(b"C0644 3 f\nnew\0");
        Sink::new(&state, &path).run(&mut stream).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn test_sink_reports_error_status() {
        let dir = tempfile::tempdir().unwrap();
        let state = state();
        let mut stream = ScriptedStream::new(b"C0644 3 f\nabc\x01read failed\n");
        let err = Sink::new(&state, dir.path()).run(&mut stream).unwrap_err();
        assert!(matches!(err, ExecError::ProtocolError(ref m) if m == "read failed"));
    }

    #[test]
    fn test_sink_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let state = state();
        let mut stream = ScriptedStream::new(b"Xnonsense\n");
        let err = Sink::new(&state, dir.path()).run(&mut stream).unwrap_err();
        assert!(matches!(err, ExecError::ProtocolError(_)));
        assert!(stream.output.ends_with(b"\n"));
        assert_eq!(stream.output[1], 1);
    }

    #[test]
    fn test_sink_directory_tree() {
        let dir = tempfile::tempdir().unwrap();
        let state = state();
        let mut stream =
            ScriptedStream::new(b"D0755 0 tree\nC0644 2 a\nhi\0D0700 0 sub\nC0644 0 empty\n\0E\nE\n");
        Sink::new(&state, dir.path()).run(&mut stream).unwrap();
        assert_eq!(fs::read(dir.path().join("tree/a")).unwrap(), b"hi");
        assert!(dir.path().join("tree/sub/empty").is_file());
    }

    #[test]
    fn test_sink_aborts_between_reads() {
        let dir = tempfile::tempdir().unwrap();
        let state = state();
        state.request_abort();
        let mut stream = ScriptedStream::new(b"C0644 5 f\nabcde\0");
        let err = Sink::new(&state, dir.path()).run(&mut stream).unwrap_err();
        assert!(matches!(err, ExecError::Aborted { .. }));
    }
}
