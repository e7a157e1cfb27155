use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use dbgscope_types::{Clock, NO_PID, SourceType};

use crate::error::{CaptureError, Result};
use crate::line_buffer::LineBuffer;
use crate::source::{LineSplitter, LogSource, make_lines};
use crate::thread::{ReaderThread, StopToken};

/// Largest datagram accepted by the UDP reader
const MAX_DATAGRAM: usize = 65_536;

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Receives log text sent as UDP datagrams
///
/// Each datagram is one raw write; the registry's newline normalization
/// decides how it maps onto messages.
pub struct UdpReader {
    local_addr: SocketAddr,
    buffer: Arc<LineBuffer>,
    thread: ReaderThread,
}

impl UdpReader {
    /// Listen on `port` on all interfaces; port 0 picks a free port
    pub fn new(clock: Clock, buffer: Arc<LineBuffer>, port: u16, poll_interval: Duration) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).map_err(|e| CaptureError::os("bind udp socket", e))?;
        socket
            .set_read_timeout(Some(poll_interval))
            .map_err(|e| CaptureError::os("set udp read timeout", e))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| CaptureError::os("udp local address", e))?;

        let thread = {
            let buffer = Arc::clone(&buffer);
            ReaderThread::spawn("udp-reader", move |stop| udp_loop(&stop, &socket, &clock, &buffer))?
        };

        tracing::info!(%local_addr, "listening for udp log messages");
        Ok(Self {
            local_addr,
            buffer,
            thread,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

fn udp_loop(stop: &StopToken, socket: &UdpSocket, clock: &Clock, buffer: &LineBuffer) {
    let mut datagram = vec![0u8; MAX_DATAGRAM];
    while !stop.is_stopped() {
        match socket.recv_from(&mut datagram) {
            Ok((n, from)) => {
                let text = String::from_utf8_lossy(&datagram[..n]).into_owned();
                buffer.add(dbgscope_types::Line::new(clock, NO_PID, from.ip().to_string(), text));
            }
            Err(e) if is_timeout(&e) || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::warn!("udp receive failed: {e}");
                break;
            }
        }
    }
}

impl LogSource for UdpReader {
    fn source_type(&self) -> SourceType {
        SourceType::Udp
    }

    fn description(&self) -> String {
        format!("UDP port {}", self.local_addr.port())
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

/// Reads newline-delimited log text from a TCP server
pub struct TcpReader {
    peer: SocketAddr,
    buffer: Arc<LineBuffer>,
    thread: ReaderThread,
}

impl TcpReader {
    /// Connect to `host:port`
    pub fn new(
        clock: Clock,
        buffer: Arc<LineBuffer>,
        host: &str,
        port: u16,
        poll_interval: Duration,
    ) -> Result<Self> {
        let peer = (host, port)
            .to_socket_addrs()
            .map_err(|e| CaptureError::os("resolve tcp address", e))?
            .next()
            .ok_or_else(|| {
                CaptureError::os(
                    "resolve tcp address",
                    io::Error::new(io::ErrorKind::NotFound, format!("{host}:{port}")),
                )
            })?;
        let stream = TcpStream::connect_timeout(&peer, Duration::from_secs(5))
            .map_err(|e| CaptureError::os("connect tcp", e))?;
        stream
            .set_read_timeout(Some(poll_interval))
            .map_err(|e| CaptureError::os("set tcp read timeout", e))?;

        let thread = {
            let buffer = Arc::clone(&buffer);
            ReaderThread::spawn("tcp-reader", move |stop| tcp_loop(&stop, stream, peer, &clock, &buffer))?
        };

        tracing::info!(%peer, "connected to tcp log source");
        Ok(Self {
            peer,
            buffer,
            thread,
        })
    }
}

fn tcp_loop(stop: &StopToken, mut stream: TcpStream, peer: SocketAddr, clock: &Clock, buffer: &LineBuffer) {
    let name = peer.ip().to_string();
    let mut splitter = LineSplitter::new();
    let mut chunk = [0u8; 4096];

    while !stop.is_stopped() {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => buffer.add_all(make_lines(clock, NO_PID, &name, splitter.push(&chunk[..n]))),
            Err(e) if is_timeout(&e) || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::warn!(%peer, "tcp read failed: {e}");
                break;
            }
        }
    }

    if let Some(tail) = splitter.finish() {
        buffer.add_all(make_lines(clock, NO_PID, &name, vec![tail]));
    }
    tracing::debug!(%peer, "tcp source closed");
}

impl LogSource for TcpReader {
    fn source_type(&self) -> SourceType {
        SourceType::Tcp
    }

    fn description(&self) -> String {
        format!("TCP {}", self.peer)
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::time::Instant;

    fn collect(buffer: &LineBuffer, count: usize) -> Vec<dbgscope_types::Line> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut lines = Vec::new();
        while lines.len() < count && Instant::now() < deadline {
            lines.extend(buffer.get_lines());
            std::thread::sleep(Duration::from_millis(5));
        }
        lines
    }

    #[test]
    fn test_udp_datagrams_become_lines() {
        let buffer = Arc::new(LineBuffer::new());
        let reader = UdpReader::new(Clock::new(), Arc::clone(&buffer), 0, Duration::from_millis(10)).unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = ("127.0.0.1", reader.local_addr().port());
        sender.send_to(b"hello udp\n", target).unwrap();

        let lines = collect(&buffer, 1);
        assert_eq!(lines[0].text, "hello udp\n");
        assert_eq!(lines[0].process_name, "127.0.0.1");
        assert_eq!(lines[0].pid, NO_PID);
    }

    #[test]
    fn test_tcp_lines_and_end_of_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(b"one\ntwo\nthr").unwrap();
        });

        let buffer = Arc::new(LineBuffer::new());
        let reader =
            TcpReader::new(Clock::new(), Arc::clone(&buffer), "127.0.0.1", port, Duration::from_millis(10)).unwrap();
        server.join().unwrap();

        let lines = collect(&buffer, 3);
        let texts: Vec<_> = lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two", "thr"]);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !reader.at_end() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(reader.at_end());
    }

    #[test]
    fn test_tcp_connect_failure_is_reported() {
        // Bind then drop to find a port nobody listens on
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let result = TcpReader::new(
            Clock::new(),
            Arc::new(LineBuffer::new()),
            "127.0.0.1",
            port,
            Duration::from_millis(10),
        );
        assert!(matches!(result, Err(CaptureError::Os { .. })));
    }
}
