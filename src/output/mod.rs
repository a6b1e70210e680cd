//! Output capture.
//!
//! - [`StreamBuffer`]: shared capture buffer with independent read cursor
//! - [`Redirect`] / [`OutputSink`]: where a child's stdout and stderr go
//! - [`plain_text`]: terminal-code stripping for pty output
//!
//! # Example
//!
//! ```
//! use shell_exec::output::{OutputSink, Redirect};
//!
//! let (out, err) = OutputSink::resolve(Redirect::Capture, Redirect::Merge).unwrap();
//! out.write(b"\x1b[32mok\x1b[0m\r\n").unwrap();
//! err.write(b"warning\n").unwrap();
//! assert_eq!(out.buffer().unwrap().text(), "ok\nwarning\n");
//! ```

mod buffer;
mod sanitizer;

pub use buffer::{OutputSink, Redirect, StreamBuffer};
pub use sanitizer::plain_text;
