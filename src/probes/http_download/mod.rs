//! Multi-stream HTTP download bandwidth probe.
//!
//! `threads` workers download from the same server in parallel for the
//! target time.  Each worker's average after the ramp-up interval is summed
//! into one figure, and the run is discarded when the trust check fails.

pub mod aggregate;
pub mod worker;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use self::aggregate::{WorkerTrace, MAX_TARGET_TIME, MAX_THREADS, MIN_SLOT_LENGTH, MIN_TARGET_TIME, MIN_THREADS};
use self::worker::{Worker, WorkerError, WorkerJob};
use super::{check_budget, parse_parameters, Completion, ProbeError, ProbeEvent, ProbeStatus, Sample};
use crate::network::{ConnectRequest, Connection, ConnectionProvider, TcpEndpoint, TransportKind};
use crate::scheduler::TestDefinition;

const PURPOSE: &str = "http_download";
const CACHE_BUST_PARAM: &str = "nmcb";

/// Parameter payload of a download test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadDefinition {
    pub url: String,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default = "default_target_time_ms")]
    pub target_time_ms: u64,
    /// Repeatable run against a cacheable target: skip URL randomisation.
    #[serde(default)]
    pub cache_test: bool,
    #[serde(default = "default_slot_length_ms")]
    pub slot_length_ms: u64,
    /// Traffic reserved from the budget at prepare time.  The run itself is
    /// bounded by `target_time_ms` only.
    #[serde(default = "default_traffic_bytes")]
    pub traffic_bytes: u64,
}

fn default_threads() -> usize {
    4
}

fn default_target_time_ms() -> u64 {
    10_000
}

fn default_slot_length_ms() -> u64 {
    500
}

fn default_traffic_bytes() -> u64 {
    64 * 1024 * 1024
}

/// Where the workers connect and what they request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTarget {
    /// `host:port` for the connection provider.
    pub authority: String,
    /// `Host` header value.
    pub host: String,
    pub path: String,
    pub has_query: bool,
}

impl DownloadDefinition {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            threads: default_threads(),
            target_time_ms: default_target_time_ms(),
            cache_test: false,
            slot_length_ms: default_slot_length_ms(),
            traffic_bytes: default_traffic_bytes(),
        }
    }

    pub fn target_time(&self) -> Duration {
        Duration::from_millis(self.target_time_ms)
    }

    pub fn slot_length(&self) -> Duration {
        Duration::from_millis(self.slot_length_ms)
    }

    pub fn ramp_up(&self) -> Duration {
        aggregate::ramp_up_for(self.target_time())
    }

    /// Range-check every field and parse the URL.
    pub fn validate(&self) -> Result<HttpTarget, ProbeError> {
        let invalid = |msg: String| Err(ProbeError::InvalidDefinition(msg));

        if !(MIN_THREADS..=MAX_THREADS).contains(&self.threads) {
            return invalid(format!(
                "threads {} outside [{}, {}]",
                self.threads, MIN_THREADS, MAX_THREADS
            ));
        }
        if self.target_time() < MIN_TARGET_TIME || self.target_time() > MAX_TARGET_TIME {
            return invalid(format!(
                "targetTimeMs {} outside [{}, {}]",
                self.target_time_ms,
                MIN_TARGET_TIME.as_millis(),
                MAX_TARGET_TIME.as_millis()
            ));
        }
        if self.slot_length() < MIN_SLOT_LENGTH {
            return invalid(format!(
                "slotLengthMs {} below {}",
                self.slot_length_ms,
                MIN_SLOT_LENGTH.as_millis()
            ));
        }
        if self.traffic_bytes == 0 {
            return invalid("trafficBytes must be positive".into());
        }

        let url = Url::parse(&self.url)
            .map_err(|e| ProbeError::InvalidDefinition(format!("url {:?}: {}", self.url, e)))?;
        if url.scheme() != "http" {
            return invalid(format!("unsupported url scheme {:?}", url.scheme()));
        }
        let Some(host) = url.host_str() else {
            return invalid(format!("url {:?} has no host", self.url));
        };
        let port = url.port_or_known_default().unwrap_or(80);
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(HttpTarget {
            authority: format!("{}:{}", host, port),
            host: match url.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            },
            path,
            has_query: url.query().is_some(),
        })
    }
}

/// Request target for one worker, randomised unless this is a cache test.
fn worker_path(target: &HttpTarget, cache_test: bool) -> String {
    if cache_test {
        return target.path.clone();
    }
    let separator = if target.has_query { '&' } else { '?' };
    format!(
        "{}{}{}={:016x}",
        target.path,
        separator,
        CACHE_BUST_PARAM,
        rand::random::<u64>()
    )
}

/// Reported measurement of one download run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadSample {
    pub url: String,
    pub threads: usize,
    pub successful_workers: usize,
    /// Sum of the per-worker post-ramp-up averages, bits per second.
    pub bandwidth_bps: f64,
    pub per_worker_bps: Vec<Option<f64>>,
    pub connect_ms: Vec<Option<f64>>,
    pub time_to_first_byte_ms: Vec<Option<f64>>,
    pub ramp_up_ms: u64,
    pub elapsed_ms: u64,
    pub bytes_received: u64,
    pub slot_length_ms: u64,
    pub slots_bps: Vec<f64>,
}

#[derive(Debug)]
pub struct DownloadEvent {
    pub worker: usize,
    pub outcome: Result<WorkerTrace, WorkerError>,
}

struct ActiveRun {
    definition: DownloadDefinition,
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    outcomes: Vec<Option<Result<WorkerTrace, WorkerError>>>,
}

enum Stage {
    Idle,
    Prepared {
        definition: DownloadDefinition,
        target: HttpTarget,
        endpoint: TcpEndpoint,
    },
    Running(ActiveRun),
    Done,
}

pub struct HttpDownloadProbe {
    stage: Stage,
    status: ProbeStatus,
    samples: Vec<Sample>,
}

impl Default for HttpDownloadProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpDownloadProbe {
    pub fn new() -> Self {
        Self {
            stage: Stage::Idle,
            status: ProbeStatus::Unknown,
            samples: Vec::new(),
        }
    }

    pub fn status(&self) -> ProbeStatus {
        self.status
    }

    pub async fn prepare(
        &mut self,
        provider: &dyn ConnectionProvider,
        test: &TestDefinition,
    ) -> Result<(), ProbeError> {
        let definition: DownloadDefinition = parse_parameters(test)?;
        let target = definition.validate()?;
        check_budget(provider, definition.traffic_bytes)?;

        let request = ConnectRequest {
            target: &target.authority,
            purpose: PURPOSE,
            parameters: &test.parameters,
            transport: TransportKind::Tcp,
            traffic_bytes: definition.traffic_bytes,
        };
        let endpoint = match provider.establish(request).await {
            Some(Connection::Tcp(endpoint)) => endpoint,
            Some(other) => {
                warn!(target = %target.authority, ?other, "provider returned a non-tcp connection");
                return Err(ProbeError::Unreachable {
                    target: target.authority,
                });
            }
            None => {
                return Err(ProbeError::Unreachable {
                    target: target.authority,
                })
            }
        };

        self.stage = Stage::Prepared {
            definition,
            target,
            endpoint,
        };
        Ok(())
    }

    pub fn start(&mut self, events: mpsc::UnboundedSender<ProbeEvent>) -> Result<(), ProbeError> {
        let (definition, target, endpoint) = match std::mem::replace(&mut self.stage, Stage::Idle) {
            Stage::Prepared {
                definition,
                target,
                endpoint,
            } => (definition, target, endpoint),
            other => {
                self.stage = other;
                return Err(ProbeError::InvalidState("start"));
            }
        };

        let token = CancellationToken::new();
        let anchor = tokio::time::Instant::now();

        info!(
            url = %definition.url,
            addr = %endpoint.addr,
            threads = definition.threads,
            target_time_ms = definition.target_time_ms,
            cache_test = definition.cache_test,
            "starting download"
        );

        let handles = (0..definition.threads)
            .map(|id| {
                let job = WorkerJob {
                    id,
                    addr: endpoint.addr,
                    host: target.host.clone(),
                    path: worker_path(&target, definition.cache_test),
                    duration: definition.target_time(),
                };
                let token = token.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    let outcome = Worker::new(job).run(anchor, token).await;
                    let _ = events.send(ProbeEvent::Download(DownloadEvent {
                        worker: id,
                        outcome,
                    }));
                })
            })
            .collect();

        let outcomes = (0..definition.threads).map(|_| None).collect();
        self.stage = Stage::Running(ActiveRun {
            definition,
            token,
            handles,
            outcomes,
        });
        self.status = ProbeStatus::Running;
        Ok(())
    }

    /// Abort every worker and discard partial traces.
    pub fn stop(&mut self) -> bool {
        match std::mem::replace(&mut self.stage, Stage::Done) {
            Stage::Running(run) => {
                run.token.cancel();
                for handle in &run.handles {
                    handle.abort();
                }
                self.status = ProbeStatus::Error;
                info!(url = %run.definition.url, "download stopped");
                true
            }
            Stage::Prepared { .. } => true,
            Stage::Idle => {
                self.stage = Stage::Idle;
                false
            }
            Stage::Done => false,
        }
    }

    pub fn handle_event(&mut self, event: DownloadEvent) -> Option<Completion> {
        let Stage::Running(run) = &mut self.stage else {
            return None;
        };
        match &event.outcome {
            Ok(trace) => debug!(worker = event.worker, bytes = trace.total_bytes(), "worker finished"),
            Err(e) => warn!(worker = event.worker, error = %e, "worker finished in error"),
        }
        match run.outcomes.get_mut(event.worker) {
            Some(slot) => *slot = Some(event.outcome),
            None => return None,
        }
        if run.outcomes.iter().any(Option::is_none) {
            return None;
        }

        let Stage::Running(run) = std::mem::replace(&mut self.stage, Stage::Done) else {
            return None;
        };
        let outcomes: Vec<_> = run.outcomes.into_iter().flatten().collect();
        Some(self.finish(&run.definition, &outcomes))
    }

    fn finish(
        &mut self,
        definition: &DownloadDefinition,
        outcomes: &[Result<WorkerTrace, WorkerError>],
    ) -> Completion {
        let ramp_up = definition.ramp_up();
        match aggregate::aggregate(outcomes, ramp_up, definition.slot_length()) {
            Ok(agg) => {
                let ms = |d: Duration| d.as_secs_f64() * 1000.0;
                let traces = || outcomes.iter().map(|o| o.as_ref().ok());
                let sample = DownloadSample {
                    url: definition.url.clone(),
                    threads: definition.threads,
                    successful_workers: agg.successful_workers,
                    bandwidth_bps: agg.bandwidth_bps,
                    per_worker_bps: agg.per_worker_bps,
                    connect_ms: traces()
                        .map(|t| t.and_then(|t| t.connected_ns).map(|ns| ms(Duration::from_nanos(ns))))
                        .collect(),
                    time_to_first_byte_ms: traces()
                        .map(|t| t.and_then(|t| t.time_to_first_byte()).map(ms))
                        .collect(),
                    ramp_up_ms: ramp_up.as_millis() as u64,
                    elapsed_ms: agg.elapsed.as_millis() as u64,
                    bytes_received: agg.bytes_received,
                    slot_length_ms: definition.slot_length_ms,
                    slots_bps: agg.slots_bps,
                };
                info!(
                    url = %definition.url,
                    bandwidth_mbps = sample.bandwidth_bps / 1e6,
                    workers = sample.successful_workers,
                    elapsed_ms = sample.elapsed_ms,
                    "download finished"
                );
                self.samples = vec![Sample::Download(sample)];
                self.status = ProbeStatus::Finished;
                Completion::Finished
            }
            Err(e) => {
                warn!(url = %definition.url, error = %e, "download rejected");
                self.status = ProbeStatus::Error;
                Completion::Failed(e)
            }
        }
    }

    pub fn result(&mut self) -> Vec<Sample> {
        std::mem::take(&mut self.samples)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// HTTP server that answers every request with a 200 header and then
    /// stays silent until the client hangs up.
    pub(crate) struct StallingServer {
        pub addr: SocketAddr,
        pub served: Arc<AtomicUsize>,
        pub closed: Arc<AtomicUsize>,
    }

    impl StallingServer {
        pub(crate) async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let served = Arc::new(AtomicUsize::new(0));
            let closed = Arc::new(AtomicUsize::new(0));
            let (served_count, closed_count) = (served.clone(), closed.clone());
            tokio::spawn(async move {
                while let Ok((mut socket, _)) = listener.accept().await {
                    let served = served_count.clone();
                    let closed = closed_count.clone();
                    tokio::spawn(async move {
                        let mut request = Vec::new();
                        let mut buf = [0u8; 1024];
                        // Reachability checks connect and leave without a request.
                        loop {
                            match socket.read(&mut buf).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => request.extend_from_slice(&buf[..n]),
                            }
                            if request.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                        if socket.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await.is_err() {
                            return;
                        }
                        served.fetch_add(1, Ordering::SeqCst);
                        while let Ok(n) = socket.read(&mut buf).await {
                            if n == 0 {
                                break;
                            }
                        }
                        closed.fetch_add(1, Ordering::SeqCst);
                    });
                }
            });
            Self {
                addr,
                served,
                closed,
            }
        }

        pub(crate) fn url(&self) -> String {
            format!("http://{}/blob", self.addr)
        }
    }

    /// Poll `counter` until it reaches `n`; false on timeout.
    pub(crate) async fn wait_for(counter: &AtomicUsize, n: usize, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while counter.load(Ordering::SeqCst) < n {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}
