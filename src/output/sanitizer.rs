//! Terminal-code stripping for captured command output.
//!
//! Output captured through a pseudo-terminal carries colour codes, cursor
//! movement, window-title sequences and `\r\n` line endings. [`plain_text`]
//! reduces it to what a reader of a log file expects.

use vte::{Params, Parser, Perform};

/// Decode `input` as UTF-8 text with terminal escape sequences removed and
/// `\r\n` folded to `\n`.
pub fn plain_text(input: &[u8]) -> String {
    let mut text = PlainText::default();
    let mut parser = Parser::new();
    parser.advance(&mut text, input);
    text.finish()
}

#[derive(Default)]
struct PlainText {
    output: Vec<u8>,
    pending_cr: bool,
}

impl PlainText {
    fn flush_cr(&mut self) {
        if std::mem::take(&mut self.pending_cr) {
            self.output.push(b'\r');
        }
    }

    fn finish(mut self) -> String {
        self.flush_cr();
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

impl Perform for PlainText {
    fn print(&mut self, c: char) {
        self.flush_cr();
        let mut buf = [0u8; 4];
        self.output
            .extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\r' => {
                self.flush_cr();
                self.pending_cr = true;
            }
            b'\n' => {
                self.pending_cr = false;
                self.output.push(b'\n');
            }
            b'\t' => {
                self.flush_cr();
                self.output.push(b'\t');
            }
            // Backspace erases what the terminal echoed last.
            0x08 => {
                self.flush_cr();
                if self.output.last().is_some_and(|b| b.is_ascii() && *b != b'\n') {
                    self.output.pop();
                }
            }
            _ => {}
        }
    }

    fn hook(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _action: char) {}

    fn put(&mut self, _byte: u8) {}

    fn unhook(&mut self) {}

    fn osc_dispatch(&mut self, _params: &[&[u8]], _bell_terminated: bool) {}

    fn csi_dispatch(
        &mut self,
        _params: &Params,
        _intermediates: &[u8],
        _ignore: bool,
        _action: char,
    ) {
    }

    fn esc_dispatch(&mut self, _intermediates: &[u8], _ignore: bool, _byte: u8) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_bytes_pass_through() {
        assert_eq!(plain_text(b"uptime 3 days\n"), "uptime 3 days\n");
        assert_eq!(plain_text(b""), "");
    }

    #[test]
    fn test_strip_colour_and_cursor() {
        let input = b"\x1b[2J\x1b[H\x1b[32m\x1b[1mok\x1b[0m done";
        assert_eq!(plain_text(input), "ok done");
    }

    #[test]
    fn test_strip_window_title() {
        assert_eq!(plain_text(b"\x1b]0;root@db1: ~\x07$ ls"), "$ ls");
    }

    #[test]
    fn test_pty_line_endings_fold() {
        assert_eq!(plain_text(b"one\r\ntwo\r\n"), "one\ntwo\n");
    }

    #[test]
    fn test_lone_carriage_return_kept() {
        assert_eq!(plain_text(b" 10%\r 20%"), " 10%\r 20%");
        assert_eq!(plain_text(b"end\r"), "end\r");
    }

    #[test]
    fn test_backspace_erases() {
        assert_eq!(plain_text(b"pas\x08\x08ath"), "path");
    }

    #[test]
    fn test_tabs_preserved() {
        assert_eq!(plain_text(b"pid\tcmd"), "pid\tcmd");
    }
}
