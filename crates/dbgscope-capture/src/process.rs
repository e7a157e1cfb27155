use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use dbgscope_types::{Clock, SourceType};

use crate::error::{CaptureError, Result};
use crate::line_buffer::LineBuffer;
use crate::pipe::PipeReader;
use crate::source::LogSource;

/// Runs a child process and captures its stdout and stderr
pub struct ProcessReader {
    description: String,
    child: Child,
    buffer: Arc<LineBuffer>,
    readers: Vec<PipeReader>,
}

impl ProcessReader {
    pub fn new(
        clock: Clock,
        buffer: Arc<LineBuffer>,
        program: &str,
        args: &[String],
        poll_interval: Duration,
    ) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CaptureError::io(program, e))?;

        let pid = child.id();
        let name = Path::new(program)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.to_string());

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(PipeReader::new(clock, Arc::clone(&buffer), stdout, pid, &name, poll_interval)?);
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(PipeReader::new(clock, Arc::clone(&buffer), stderr, pid, &name, poll_interval)?);
        }

        let description = if args.is_empty() {
            program.to_string()
        } else {
            format!("{program} {}", args.join(" "))
        };
        tracing::info!(pid, "started {description}");

        Ok(Self {
            description,
            child,
            buffer,
            readers,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }
}

impl LogSource for ProcessReader {
    fn source_type(&self) -> SourceType {
        SourceType::Process
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    /// Ended once both output pipes are closed
    fn at_end(&self) -> bool {
        self.readers.iter().all(|r| r.at_end())
    }

    fn stop(&mut self) {
        if !self.at_end() {
            // Already exited is fine
            let _ = self.child.kill();
        }
        for reader in &mut self.readers {
            reader.stop();
        }
        match self.child.wait() {
            Ok(status) => tracing::debug!(pid = self.child.id(), %status, "process reaped"),
            Err(e) => tracing::warn!(pid = self.child.id(), "failed to reap process: {e}"),
        }
    }

    fn buffer(&self) -> &LineBuffer {
        &self.buffer
    }
}

impl Drop for ProcessReader {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn drain_until_end(reader: &ProcessReader) -> Vec<String> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut texts = Vec::new();
        while !reader.at_end() && Instant::now() < deadline {
            texts.extend(reader.take_lines().into_iter().map(|l| l.text));
            std::thread::sleep(Duration::from_millis(5));
        }
        texts.extend(reader.take_lines().into_iter().map(|l| l.text));
        texts
    }

    #[test]
    fn test_captures_stdout_and_stderr() {
        let reader = ProcessReader::new(
            Clock::new(),
            Arc::new(LineBuffer::new()),
            "sh",
            &["-c".to_string(), "echo out; echo err 1>&2".to_string()],
            Duration::from_millis(5),
        )
        .unwrap();

        let mut texts = drain_until_end(&reader);
        texts.sort();
        assert_eq!(texts, vec!["err", "out"]);
        assert!(reader.at_end());
    }

    #[test]
    fn test_lines_carry_child_pid_and_name() {
        let reader = ProcessReader::new(
            Clock::new(),
            Arc::new(LineBuffer::new()),
            "sh",
            &["-c".to_string(), "echo hi".to_string()],
            Duration::from_millis(5),
        )
        .unwrap();
        let pid = reader.pid();

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut lines = Vec::new();
        while lines.is_empty() && Instant::now() < deadline {
            lines.extend(reader.take_lines());
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(lines[0].pid, pid);
        assert_eq!(lines[0].process_name, "sh");
    }

    #[test]
    fn test_stop_kills_running_child() {
        let mut reader = ProcessReader::new(
            Clock::new(),
            Arc::new(LineBuffer::new()),
            "sleep",
            &["30".to_string()],
            Duration::from_millis(5),
        )
        .unwrap();
        let started = Instant::now();
        reader.stop();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(reader.at_end());
    }

    #[test]
    fn test_missing_program_reports_path() {
        let result = ProcessReader::new(
            Clock::new(),
            Arc::new(LineBuffer::new()),
            "/definitely/not/here",
            &[],
            Duration::from_millis(5),
        );
        assert!(matches!(result, Err(CaptureError::Io { .. })));
    }
}
