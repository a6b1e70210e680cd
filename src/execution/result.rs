//! Execution result types.

use std::time::Duration;

use crate::output::plain_text;

/// Outcome of one command run through the executor.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    /// Raw captured stdout.
    pub stdout: Vec<u8>,
    /// Raw captured stderr, empty when merged into stdout.
    pub stderr: Vec<u8>,
    /// Stdout with terminal control sequences stripped.
    pub text_output: String,
    /// Exit code, `None` when the command timed out.
    pub exit_code: Option<i32>,
    /// Wall time from start to completion.
    pub duration: Duration,
    /// Whether the command was killed at its deadline.
    pub timed_out: bool,
}

impl ExecutionResult {
    /// Create a result for a command that exited with `code`.
    pub fn new(stdout: Vec<u8>, stderr: Vec<u8>, code: i32, duration: Duration) -> Self {
        Self {
            text_output: plain_text(&stdout),
            stdout,
            stderr,
            exit_code: Some(code),
            duration,
            timed_out: false,
        }
    }

    /// Create a result indicating timeout, with whatever output arrived.
    pub fn timeout(stdout: Vec<u8>, stderr: Vec<u8>, duration: Duration) -> Self {
        Self {
            text_output: plain_text(&stdout),
            stdout,
            stderr,
            exit_code: None,
            duration,
            timed_out: true,
        }
    }

    /// Check if command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Check if command failed (non-zero exit code or timeout).
    pub fn failed(&self) -> bool {
        self.timed_out || matches!(self.exit_code, Some(c) if c != 0)
    }

    /// Get output as string, trimmed.
    pub fn output_trimmed(&self) -> &str {
        self.text_output.trim()
    }

    /// Get output lines.
    pub fn output_lines(&self) -> impl Iterator<Item = &str> {
        self.text_output.lines()
    }

    /// Stderr decoded lossily.
    pub fn error_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_result_new() {
        let result = ExecutionResult::new(
            b"\x1b[1mhello\x1b[0m\r\n".to_vec(),
            Vec::new(),
            0,
            Duration::from_millis(100),
        );

        assert_eq!(result.text_output, "hello\n");
        assert_eq!(result.duration, Duration::from_millis(100));
        assert!(!result.timed_out);
        assert!(result.success());
    }

    #[test]
    fn test_execution_result_failed() {
        let result = ExecutionResult::new(vec![], b"boom".to_vec(), 1, Duration::ZERO);
        assert!(!result.success());
        assert!(result.failed());
        assert_eq!(result.error_text(), "boom");
    }

    #[test]
    fn test_execution_result_timeout() {
        let result = ExecutionResult::timeout(b"partial".to_vec(), vec![], Duration::from_secs(30));
        assert!(result.timed_out);
        assert!(result.failed());
        assert!(result.exit_code.is_none());
        assert_eq!(result.output_trimmed(), "partial");
    }

    #[test]
    fn test_output_lines() {
        let result =
            ExecutionResult::new(b"line1\nline2\nline3".to_vec(), vec![], 0, Duration::ZERO);
        let lines: Vec<_> = result.output_lines().collect();
        assert_eq!(lines, vec!["line1", "line2", "line3"]);
    }
}
