use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

use dbgscope_types::{Clock, SourceType};

use crate::error::Result;
use crate::line_buffer::LineBuffer;
use crate::source::{LineSplitter, LogSource, make_lines};
use crate::thread::{ReaderThread, StopToken};

/// A readable pipe end that can be polled for available data
pub trait Pipe: Read + Send + 'static {
    /// Wait up to `timeout` for data (or end-of-stream) to become readable
    fn wait_readable(&self, timeout: Duration) -> io::Result<bool>;
}

#[cfg(unix)]
fn poll_readable(fd: std::os::fd::BorrowedFd<'_>, timeout: Duration) -> io::Result<bool> {
    use std::os::fd::AsRawFd;

    let mut pollfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
    // SAFETY: pollfd points to one valid entry for the duration of the call
    let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    match ready {
        n if n > 0 => Ok(true),
        0 => Ok(false),
        _ => {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                Ok(false)
            } else {
                Err(err)
            }
        }
    }
}

macro_rules! impl_pipe {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Pipe for $ty {
                #[cfg(unix)]
                fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
                    use std::os::fd::AsFd;
                    poll_readable(self.as_fd(), timeout)
                }

                #[cfg(not(unix))]
                fn wait_readable(&self, _timeout: Duration) -> io::Result<bool> {
                    Ok(true)
                }
            }
        )*
    };
}

// `Stdin` is left out on purpose: it reads through its own buffer, which a
// readiness poll on fd 0 cannot see. Use [`stdin_pipe`] instead.
impl_pipe!(
    std::fs::File,
    std::process::ChildStdout,
    std::process::ChildStderr,
);

/// Standard input as an unbuffered pipe end
#[cfg(unix)]
pub fn stdin_pipe() -> io::Result<std::fs::File> {
    use std::os::fd::AsFd;
    Ok(std::fs::File::from(io::stdin().as_fd().try_clone_to_owned()?))
}

/// Standard input as an unbuffered pipe end
#[cfg(windows)]
pub fn stdin_pipe() -> io::Result<std::fs::File> {
    use std::os::windows::io::AsHandle;
    Ok(std::fs::File::from(io::stdin().as_handle().try_clone_to_owned()?))
}

#[cfg(unix)]
impl_pipe!(std::os::unix::net::UnixStream);

/// Reads lines from a pipe connected to another process's output
pub struct PipeReader {
    description: String,
    buffer: Arc<LineBuffer>,
    thread: ReaderThread,
}

impl PipeReader {
    /// Start reading `pipe`, attributing every line to `pid` / `process_name`
    pub fn new<P: Pipe>(
        clock: Clock,
        buffer: Arc<LineBuffer>,
        pipe: P,
        pid: u32,
        process_name: &str,
        poll_interval: Duration,
    ) -> Result<Self> {
        let thread = {
            let buffer = Arc::clone(&buffer);
            let process_name = process_name.to_string();
            ReaderThread::spawn("pipe-reader", move |stop| {
                read_loop(&stop, pipe, &clock, &buffer, pid, &process_name, poll_interval);
            })?
        };

        Ok(Self {
            description: format!("Pipe from {process_name} ({pid})"),
            buffer,
            thread,
        })
    }
}

fn read_loop<P: Pipe>(
    stop: &StopToken,
    mut pipe: P,
    clock: &Clock,
    buffer: &LineBuffer,
    pid: u32,
    process_name: &str,
    poll_interval: Duration,
) {
    let mut splitter = LineSplitter::new();
    let mut chunk = [0u8; 4096];

    while !stop.is_stopped() {
        match pipe.wait_readable(poll_interval) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                tracing::warn!(pid, "pipe poll failed: {e}");
                break;
            }
        }

        match pipe.read(&mut chunk) {
            // Writer closed its end
            Ok(0) => break,
            Ok(n) => buffer.add_all(make_lines(clock, pid, process_name, splitter.push(&chunk[..n]))),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(pid, "pipe read failed: {e}");
                break;
            }
        }
    }

    if let Some(tail) = splitter.finish() {
        buffer.add_all(make_lines(clock, pid, process_name, vec![tail]));
    }
    tracing::debug!(pid, process_name, "pipe closed");
}

impl LogSource for PipeReader {
    fn source_type(&self) -> SourceType {
        SourceType::Pipe
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn at_end(&self) -> bool {
        self.thread.at_end()
    }

    fn stop(&mut self) {
        self.thread.stop();
    }

    fn buffer(&self) -> &LineBuffer {
        &self.buffer
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_partial_fragment_waits_for_newline() {
        let (mut writer, pipe) = UnixStream::pair().unwrap();
        let buffer = Arc::new(LineBuffer::new());
        let reader = PipeReader::new(
            Clock::new(),
            Arc::clone(&buffer),
            pipe,
            77,
            "child",
            Duration::from_millis(5),
        )
        .unwrap();

        writer.write_all(b"complete\npart").unwrap();
        let mut lines = Vec::new();
        wait_until(|| {
            lines.extend(buffer.get_lines());
            !lines.is_empty()
        });
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "complete");
        assert_eq!(lines[0].pid, 77);
        assert_eq!(lines[0].process_name, "child");

        writer.write_all(b"ial\n").unwrap();
        let mut more = Vec::new();
        wait_until(|| {
            more.extend(buffer.get_lines());
            !more.is_empty()
        });
        assert_eq!(more[0].text, "partial");
        assert!(!reader.at_end());
    }

    #[test]
    fn test_close_flushes_tail_and_ends() {
        let (mut writer, pipe) = UnixStream::pair().unwrap();
        let buffer = Arc::new(LineBuffer::new());
        let reader = PipeReader::new(
            Clock::new(),
            Arc::clone(&buffer),
            pipe,
            1,
            "child",
            Duration::from_millis(5),
        )
        .unwrap();

        writer.write_all(b"last words").unwrap();
        drop(writer);

        wait_until(|| reader.at_end());
        assert!(reader.at_end());
        let texts: Vec<_> = buffer.get_lines().into_iter().map(|l| l.text).collect();
        assert_eq!(texts, vec!["last words"]);
    }

    #[test]
    fn test_burst_larger_than_one_read_is_emitted_while_open() {
        let (mut writer, pipe) = UnixStream::pair().unwrap();
        let buffer = Arc::new(LineBuffer::new());
        let _reader = PipeReader::new(
            Clock::new(),
            Arc::clone(&buffer),
            pipe,
            3,
            "burst",
            Duration::from_millis(5),
        )
        .unwrap();

        let burst: String = (0..222).map(|n| format!("burst line {n:>12}\n")).collect();
        assert!(burst.len() > 4096 && burst.len() < 8192);
        writer.write_all(burst.as_bytes()).unwrap();

        // Writer stays open: every complete line must arrive without more input
        let mut lines = Vec::new();
        wait_until(|| {
            lines.extend(buffer.get_lines());
            lines.len() >= 222
        });
        assert_eq!(lines.len(), 222);
        assert_eq!(lines[221].text, format!("burst line {:>12}", 221));
    }

    #[test]
    fn test_stdin_pipe_is_pollable() {
        let stdin = stdin_pipe().unwrap();
        stdin.wait_readable(Duration::ZERO).unwrap();
    }

    #[test]
    fn test_stop_returns_while_pipe_is_open() {
        let (_writer, pipe) = UnixStream::pair().unwrap();
        let mut reader = PipeReader::new(
            Clock::new(),
            Arc::new(LineBuffer::new()),
            pipe,
            1,
            "idle",
            Duration::from_millis(5),
        )
        .unwrap();
        reader.stop();
        assert!(reader.at_end());
    }
}
