//! Task executor: drives one probe at a time through
//! `Idle -> Preparing -> Running -> {Finished, Failed}`.
//!
//! Lifecycle changes and outcomes are published as [`ExecutorEvent`]s on a
//! channel owned by whoever constructed the executor (normally the agent
//! loop).  A run ends early when the stop token is cancelled (shutdown) or
//! the per-run timeout expires; both go through the probe's `stop`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::network::ConnectionProvider;
use crate::probes::{Completion, Probe, ProbeError};
use crate::report::MeasurementResult;
use crate::scheduler::TestDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Preparing,
    Running,
    Finished,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Finished | RunState::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Preparing => "preparing",
            RunState::Running => "running",
            RunState::Finished => "finished",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorEvent {
    StateChanged { test_id: Uuid, state: RunState },
    Finished { test_id: Uuid, result: MeasurementResult },
    Failed { test_id: Uuid, error: ProbeError },
}

impl ExecutorEvent {
    pub fn test_id(&self) -> Uuid {
        match self {
            ExecutorEvent::StateChanged { test_id, .. }
            | ExecutorEvent::Finished { test_id, .. }
            | ExecutorEvent::Failed { test_id, .. } => *test_id,
        }
    }
}

pub struct TaskExecutor {
    provider: Arc<dyn ConnectionProvider>,
    run_timeout: Duration,
    state: RunState,
    events: mpsc::UnboundedSender<ExecutorEvent>,
    stop: CancellationToken,
}

impl TaskExecutor {
    pub fn new(
        provider: Arc<dyn ConnectionProvider>,
        run_timeout: Duration,
        events: mpsc::UnboundedSender<ExecutorEvent>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            provider,
            run_timeout,
            state: RunState::Idle,
            events,
            stop,
        }
    }

    /// State of the current or most recent run.
    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.state, RunState::Preparing | RunState::Running)
    }

    /// Cancelling this token stops the running probe and fails the run.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    fn transition(&mut self, test_id: Uuid, state: RunState) {
        debug!(test_id = %test_id, from = %self.state, to = %state, "run state");
        self.state = state;
        self.emit(ExecutorEvent::StateChanged { test_id, state });
    }

    fn emit(&self, event: ExecutorEvent) {
        if self.events.send(event).is_err() {
            debug!("executor event receiver dropped");
        }
    }

    fn fail(&mut self, test_id: Uuid, error: ProbeError) -> RunState {
        warn!(test_id = %test_id, error = %error, "run failed");
        self.transition(test_id, RunState::Failed);
        self.emit(ExecutorEvent::Failed { test_id, error });
        RunState::Failed
    }

    /// Run one definition to a terminal state and return it.  `&mut self`
    /// keeps runs strictly sequential.
    pub async fn execute(&mut self, definition: &TestDefinition) -> RunState {
        let test_id = definition.id;
        self.state = RunState::Idle;

        if self.stop.is_cancelled() {
            return self.fail(test_id, ProbeError::Cancelled);
        }

        let mut probe = Probe::new(definition.probe);
        self.transition(test_id, RunState::Preparing);

        let provider = self.provider.clone();
        let prepared = tokio::select! {
            biased;
            _ = self.stop.cancelled() => Err(ProbeError::Cancelled),
            r = probe.prepare(provider.as_ref(), definition) => r,
        };
        if let Err(e) = prepared {
            probe.stop();
            return self.fail(test_id, e);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let start = Utc::now();
        if let Err(e) = probe.start(tx) {
            probe.stop();
            return self.fail(test_id, e);
        }
        self.transition(test_id, RunState::Running);
        info!(test_id = %test_id, probe = %definition.probe, "run started");

        let timeout = tokio::time::sleep(self.run_timeout);
        tokio::pin!(timeout);

        let completion = loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    probe.stop();
                    break Completion::Failed(ProbeError::Cancelled);
                }
                _ = &mut timeout => {
                    probe.stop();
                    break Completion::Failed(ProbeError::TimedOut(self.run_timeout));
                }
                event = rx.recv() => match event {
                    Some(event) => {
                        if let Some(completion) = probe.handle_event(event) {
                            break completion;
                        }
                    }
                    None => {
                        probe.stop();
                        break Completion::Failed(ProbeError::Abandoned);
                    }
                },
            }
        };

        match completion {
            Completion::Finished | Completion::Detached => {
                let result = MeasurementResult {
                    start,
                    end: Utc::now(),
                    samples: probe.result(),
                };
                info!(
                    test_id = %test_id,
                    probe = %definition.probe,
                    status = ?probe.status(),
                    samples = result.samples.len(),
                    duration_ms = result.duration().num_milliseconds(),
                    "run finished"
                );
                self.transition(test_id, RunState::Finished);
                self.emit(ExecutorEvent::Finished { test_id, result });
                RunState::Finished
            }
            Completion::Failed(e) => self.fail(test_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ConnectRequest, Connection};
    use crate::probes::ProbeKind;
    use crate::network::{SocketProvider, TrafficBudget};
    use crate::probes::http_download::test_support::{wait_for, StallingServer};
    use crate::probes::http_download::DownloadDefinition;
    use crate::scheduler::{Parameters, Timing};
    use async_trait::async_trait;

    /// Provider handing out loopback UDP sockets without a budget.
    struct LoopbackUdp;

    #[async_trait]
    impl ConnectionProvider for LoopbackUdp {
        fn available_traffic(&self) -> u64 {
            u64::MAX
        }

        async fn establish(&self, request: ConnectRequest<'_>) -> Option<Connection> {
            let socket = std::net::UdpSocket::bind("127.0.0.1:0").ok()?;
            socket.connect(request.target).ok()?;
            Some(Connection::Udp(socket))
        }
    }

    fn trains(port: u16, iterations: u16) -> TestDefinition {
        let mut p = Parameters::new();
        p.insert("host".into(), "127.0.0.1".into());
        p.insert("port".into(), port.into());
        p.insert("packetSizeBytes".into(), 64.into());
        p.insert("trainLength".into(), 2.into());
        p.insert("iterationCount".into(), iterations.into());
        TestDefinition::new(ProbeKind::PacketTrains, Timing::Immediate, p)
    }

    fn executor(timeout: Duration) -> (TaskExecutor, mpsc::UnboundedReceiver<ExecutorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let exec = TaskExecutor::new(Arc::new(LoopbackUdp), timeout, tx, CancellationToken::new());
        (exec, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ExecutorEvent>) -> Vec<ExecutorEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn states(events: &[ExecutorEvent]) -> Vec<RunState> {
        events
            .iter()
            .filter_map(|e| match e {
                ExecutorEvent::StateChanged { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_successful_run_walks_every_state() {
        let server = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let def = trains(server.local_addr().unwrap().port(), 2);
        let (mut exec, mut rx) = executor(Duration::from_secs(10));

        assert_eq!(exec.execute(&def).await, RunState::Finished);
        let events = drain(&mut rx);
        assert_eq!(
            states(&events),
            vec![RunState::Preparing, RunState::Running, RunState::Finished]
        );
        match events.last().unwrap() {
            ExecutorEvent::Finished { test_id, result } => {
                assert_eq!(*test_id, def.id);
                assert!(result.end >= result.start);
                assert!(result.samples.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_prepare_failure_never_enters_running() {
        let mut def = trains(9, 1);
        def.parameters.remove("host");
        let (mut exec, mut rx) = executor(Duration::from_secs(10));

        assert_eq!(exec.execute(&def).await, RunState::Failed);
        let events = drain(&mut rx);
        assert_eq!(states(&events), vec![RunState::Preparing, RunState::Failed]);
        assert!(matches!(
            events.last(),
            Some(ExecutorEvent::Failed { error: ProbeError::InvalidDefinition(_), .. })
        ));
    }

    #[tokio::test]
    async fn test_timeout_stops_run() {
        let server = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let def = trains(server.local_addr().unwrap().port(), 500);
        let (mut exec, mut rx) = executor(Duration::from_millis(300));

        assert_eq!(exec.execute(&def).await, RunState::Failed);
        let events = drain(&mut rx);
        assert!(matches!(
            events.last(),
            Some(ExecutorEvent::Failed { error: ProbeError::TimedOut(_), .. })
        ));
        assert!(!exec.is_busy());
    }

    #[tokio::test]
    async fn test_stop_token_cancels_run() {
        let server = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let def = trains(server.local_addr().unwrap().port(), 500);
        let (mut exec, mut rx) = executor(Duration::from_secs(60));
        let stop = exec.stop_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            stop.cancel();
        });

        assert_eq!(exec.execute(&def).await, RunState::Failed);
        assert!(matches!(
            drain(&mut rx).last(),
            Some(ExecutorEvent::Failed { error: ProbeError::Cancelled, .. })
        ));

        // Once stopped, later runs fail without preparing.
        assert_eq!(exec.execute(&def).await, RunState::Failed);
        assert_eq!(states(&drain(&mut rx)), vec![RunState::Failed]);
    }

    fn download_on(
        budget: u64,
        traffic: &crate::config::TrafficConfig,
        timeout: Duration,
    ) -> (TaskExecutor, Arc<TrafficBudget>, mpsc::UnboundedReceiver<ExecutorEvent>) {
        let budget = Arc::new(TrafficBudget::new(budget));
        let provider = SocketProvider::new(budget.clone(), traffic);
        let (tx, rx) = mpsc::unbounded_channel();
        let exec = TaskExecutor::new(Arc::new(provider), timeout, tx, CancellationToken::new());
        (exec, budget, rx)
    }

    #[tokio::test]
    async fn test_stop_token_cancels_download_workers() {
        let server = StallingServer::start().await;
        let def = DownloadDefinition {
            threads: 3,
            target_time_ms: 45_000,
            ..DownloadDefinition::new(server.url())
        };
        let test = TestDefinition::new(
            ProbeKind::HttpDownload,
            Timing::Immediate,
            TestDefinition::parameters_from(&def),
        );
        let (mut exec, _budget, mut rx) =
            download_on(u64::MAX, &Default::default(), Duration::from_secs(60));
        let stop = exec.stop_token();
        let served = server.served.clone();
        tokio::spawn(async move {
            wait_for(&served, 3, Duration::from_secs(5)).await;
            stop.cancel();
        });

        assert_eq!(exec.execute(&test).await, RunState::Failed);
        let events = drain(&mut rx);
        assert_eq!(
            states(&events),
            vec![RunState::Preparing, RunState::Running, RunState::Failed]
        );
        assert!(matches!(
            events.last(),
            Some(ExecutorEvent::Failed { error: ProbeError::Cancelled, .. })
        ));
        assert!(wait_for(&server.closed, 3, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_shutdown_during_connect_retries_refunds_budget() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let def = DownloadDefinition::new(format!("http://127.0.0.1:{}/blob", port));
        let test = TestDefinition::new(
            ProbeKind::HttpDownload,
            Timing::Immediate,
            TestDefinition::parameters_from(&def),
        );
        let traffic = crate::config::TrafficConfig {
            available_bytes: 0,
            connect_attempts: 3,
            retry_backoff_ms: 10_000,
        };
        let initial = def.traffic_bytes * 4;
        let (mut exec, budget, mut rx) = download_on(initial, &traffic, Duration::from_secs(60));
        let stop = exec.stop_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            stop.cancel();
        });

        assert_eq!(exec.execute(&test).await, RunState::Failed);
        let events = drain(&mut rx);
        assert_eq!(states(&events), vec![RunState::Preparing, RunState::Failed]);
        assert!(matches!(
            events.last(),
            Some(ExecutorEvent::Failed { error: ProbeError::Cancelled, .. })
        ));
        assert_eq!(budget.available(), initial);
    }
}
