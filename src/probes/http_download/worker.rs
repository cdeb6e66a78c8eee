//! One download stream: its own TCP socket, request and read loop.
//!
//! A worker owns its trace exclusively and hands it back exactly once, when
//! it reaches a terminal state.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::aggregate::{ReadSample, WorkerTrace};

pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const READ_BUFFER_LEN: usize = 64 * 1024;
const MAX_HEADER_LEN: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("tcp connect timed out")]
    ConnectTimeout,

    #[error("tcp connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("unexpected response: {0}")]
    Status(String),

    #[error("malformed response header")]
    MalformedResponse,

    #[error("chunked transfer encoding is not supported")]
    UnsupportedEncoding,

    #[error("socket error: {0}")]
    Io(#[source] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Inactive,
    ConnectingTcp,
    ConnectedTcp,
    AwaitingFirstByte,
    DownloadInProgress,
    FinishedSuccess,
    FinishedError,
}

/// Read-only inputs shared with the other workers of a run.
#[derive(Debug, Clone)]
pub struct WorkerJob {
    pub id: usize,
    pub addr: SocketAddr,
    /// `Host` header value.
    pub host: String,
    /// Request target, query included.
    pub path: String,
    /// Stop reading this long after the anchor.
    pub duration: Duration,
}

impl WorkerJob {
    fn request(&self) -> String {
        format!(
            "GET {} HTTP/1.0\r\nHost: {}\r\nUser-Agent: netmeter/{}\r\nAccept: */*\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n",
            self.path,
            self.host,
            env!("CARGO_PKG_VERSION")
        )
    }
}

pub struct Worker {
    job: WorkerJob,
    state: WorkerState,
    trace: WorkerTrace,
}

impl Worker {
    pub fn new(job: WorkerJob) -> Self {
        Self {
            job,
            state: WorkerState::Inactive,
            trace: WorkerTrace::default(),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn transition(&mut self, next: WorkerState) {
        trace!(worker = self.job.id, from = ?self.state, to = ?next, "worker state");
        self.state = next;
    }

    fn fail(&mut self, error: WorkerError) -> WorkerError {
        self.transition(WorkerState::FinishedError);
        debug!(worker = self.job.id, error = %error, "download worker failed");
        error
    }

    /// Connect, request and read until the deadline or EOF.
    pub async fn run(
        mut self,
        anchor: Instant,
        token: CancellationToken,
    ) -> Result<WorkerTrace, WorkerError> {
        let elapsed_ns = || anchor.elapsed().as_nanos() as u64;
        let deadline = anchor + self.job.duration;

        self.transition(WorkerState::ConnectingTcp);
        let connect = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(self.fail(WorkerError::Cancelled)),
            r = tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(self.job.addr)) => r,
        };
        let mut stream = match connect {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(self.fail(WorkerError::Connect(e))),
            Err(_) => return Err(self.fail(WorkerError::ConnectTimeout)),
        };
        self.trace.connected_ns = Some(elapsed_ns());
        self.transition(WorkerState::ConnectedTcp);
        if let Err(e) = stream.set_nodelay(true) {
            debug!(worker = self.job.id, error = %e, "unable to disable nagle");
        }

        if let Err(e) = stream.write_all(self.job.request().as_bytes()).await {
            return Err(self.fail(WorkerError::Io(e)));
        }
        self.transition(WorkerState::AwaitingFirstByte);

        let mut buf = vec![0u8; READ_BUFFER_LEN];
        let mut header: Vec<u8> = Vec::with_capacity(1024);
        let mut received: u64 = 0;
        self.trace.samples.reserve(4096);

        let finished_ns = loop {
            let read = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(self.fail(WorkerError::Cancelled)),
                _ = tokio::time::sleep_until(deadline) => break self.job.duration.as_nanos() as u64,
                r = stream.read(&mut buf) => r,
            };
            let n = match read {
                Ok(0) => {
                    if self.state != WorkerState::DownloadInProgress {
                        return Err(self.fail(WorkerError::MalformedResponse));
                    }
                    break elapsed_ns();
                }
                Ok(n) => n,
                Err(e) => return Err(self.fail(WorkerError::Io(e))),
            };
            let at_ns = elapsed_ns();

            let body = if self.state == WorkerState::DownloadInProgress {
                n as u64
            } else {
                if self.trace.first_byte_ns.is_none() {
                    self.trace.first_byte_ns = Some(at_ns);
                }
                header.extend_from_slice(&buf[..n]);
                match find_header_end(&header) {
                    Some(end) => {
                        if let Err(e) = check_header(&header[..end]) {
                            return Err(self.fail(e));
                        }
                        self.transition(WorkerState::DownloadInProgress);
                        (header.len() - end - 4) as u64
                    }
                    None if header.len() > MAX_HEADER_LEN => {
                        return Err(self.fail(WorkerError::MalformedResponse));
                    }
                    None => continue,
                }
            };

            if body > 0 {
                self.trace.samples.push(ReadSample { bytes: body, at_ns });
                received += body;
            }
        };

        self.trace.finished_ns = finished_ns;
        self.transition(WorkerState::FinishedSuccess);
        debug!(
            worker = self.job.id,
            bytes = received,
            reads = self.trace.samples.len(),
            "download worker finished"
        );
        Ok(self.trace)
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Accept `HTTP/1.x 2xx` responses with an identity-coded body only.
///
/// Everything after the header is counted as payload, so a chunked body
/// would inflate the byte count with framing.
fn check_header(header: &[u8]) -> Result<(), WorkerError> {
    let text = String::from_utf8_lossy(header);
    let mut lines = text.lines();
    let line = lines.next().unwrap_or_default();
    let mut parts = line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    let code = parts.next().and_then(|c| c.parse::<u16>().ok());
    match code {
        Some(code) if version.starts_with("HTTP/1.") && (200..300).contains(&code) => {}
        _ => return Err(WorkerError::Status(line.to_string())),
    }

    let chunked = lines.any(|l| {
        l.split_once(':').is_some_and(|(name, value)| {
            name.trim().eq_ignore_ascii_case("transfer-encoding")
                && value.to_ascii_lowercase().contains("chunked")
        })
    });
    if chunked {
        return Err(WorkerError::UnsupportedEncoding);
    }
    Ok(())
}
