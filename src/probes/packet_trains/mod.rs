//! Packet-train dispersion prober.
//!
//! Sends trains of equal-sized UDP datagrams at linearly increasing offered
//! rates.  The receiving server infers available bandwidth from the arrival
//! spacing; this side only generates traffic, so the probe never produces a
//! local result and its status stays `Unknown`.

pub mod sender;
pub mod wire;

use std::net::UdpSocket;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use self::sender::{SendSummary, TrainPlan};
use super::{check_budget, parse_parameters, Completion, ProbeError, ProbeEvent, ProbeStatus, Sample};
use crate::network::{ConnectRequest, Connection, ConnectionProvider, TransportKind};
use crate::scheduler::TestDefinition;

const PURPOSE: &str = "packet_trains";

/// Parameter payload of a packet-train test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketTrainDefinition {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_packet_size")]
    pub packet_size_bytes: usize,
    #[serde(default = "default_train_length")]
    pub train_length: u16,
    #[serde(default = "default_iteration_count")]
    pub iteration_count: u16,
}

fn default_packet_size() -> usize {
    1000
}

fn default_train_length() -> u16 {
    48
}

fn default_iteration_count() -> u16 {
    10
}

impl PacketTrainDefinition {
    pub fn validate(&self) -> Result<(), ProbeError> {
        let invalid = |msg: String| Err(ProbeError::InvalidDefinition(msg));
        if self.host.trim().is_empty() {
            return invalid("host must not be empty".into());
        }
        if self.port == 0 {
            return invalid("port must be non-zero".into());
        }
        if !(wire::MEASUREMENT_HEADER_LEN..=wire::MAX_DATAGRAM_LEN).contains(&self.packet_size_bytes) {
            return invalid(format!(
                "packetSizeBytes {} outside [{}, {}]",
                self.packet_size_bytes,
                wire::MEASUREMENT_HEADER_LEN,
                wire::MAX_DATAGRAM_LEN
            ));
        }
        if self.train_length == 0 {
            return invalid("trainLength must be at least 1".into());
        }
        if self.iteration_count == 0 {
            return invalid("iterationCount must be at least 1".into());
        }
        Ok(())
    }

    pub fn target(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn plan(&self) -> TrainPlan {
        TrainPlan {
            iteration_count: self.iteration_count,
            train_length: self.train_length,
            packet_size: self.packet_size_bytes,
        }
    }
}

#[derive(Debug)]
pub enum SenderEvent {
    Finished(SendSummary),
}

enum Stage {
    Idle,
    Prepared {
        definition: PacketTrainDefinition,
        socket: UdpSocket,
    },
    Sending {
        target: String,
        token: CancellationToken,
    },
    Done,
}

pub struct PacketTrainProbe {
    stage: Stage,
}

impl Default for PacketTrainProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketTrainProbe {
    pub fn new() -> Self {
        Self { stage: Stage::Idle }
    }

    /// Always `Unknown`: the measured value lives on the server.
    pub fn status(&self) -> ProbeStatus {
        ProbeStatus::Unknown
    }

    pub async fn prepare(
        &mut self,
        provider: &dyn ConnectionProvider,
        test: &TestDefinition,
    ) -> Result<(), ProbeError> {
        let definition: PacketTrainDefinition = parse_parameters(test)?;
        definition.validate()?;

        let traffic = definition.plan().traffic_bytes();
        check_budget(provider, traffic)?;

        let target = definition.target();
        let request = ConnectRequest {
            target: &target,
            purpose: PURPOSE,
            parameters: &test.parameters,
            transport: TransportKind::Udp,
            traffic_bytes: traffic,
        };
        let socket = match provider.establish(request).await {
            Some(Connection::Udp(socket)) => socket,
            Some(other) => {
                warn!(target = %target, ?other, "provider returned a non-udp connection");
                return Err(ProbeError::Unreachable { target });
            }
            None => return Err(ProbeError::Unreachable { target }),
        };

        self.stage = Stage::Prepared { definition, socket };
        Ok(())
    }

    pub fn start(&mut self, events: mpsc::UnboundedSender<ProbeEvent>) -> Result<(), ProbeError> {
        let (definition, socket) = match std::mem::replace(&mut self.stage, Stage::Idle) {
            Stage::Prepared { definition, socket } => (definition, socket),
            other => {
                self.stage = other;
                return Err(ProbeError::InvalidState("start"));
            }
        };

        let plan = definition.plan();
        let target = definition.target();
        let token = CancellationToken::new();
        let anchor = Instant::now();

        info!(
            target = %target,
            iterations = plan.iteration_count,
            train_length = plan.train_length,
            packet_size = plan.packet_size,
            "sending packet trains"
        );

        let thread_token = token.clone();
        tokio::task::spawn_blocking(move || {
            let summary = sender::run(&socket, &plan, anchor, &thread_token);
            drop(socket);
            let _ = events.send(ProbeEvent::PacketTrains(SenderEvent::Finished(summary)));
        });

        self.stage = Stage::Sending { target, token };
        Ok(())
    }

    pub fn stop(&mut self) -> bool {
        match std::mem::replace(&mut self.stage, Stage::Done) {
            Stage::Sending { token, .. } => {
                token.cancel();
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

    pub fn handle_event(&mut self, event: SenderEvent) -> Option<Completion> {
        let SenderEvent::Finished(summary) = event;
        let target = match std::mem::replace(&mut self.stage, Stage::Done) {
            Stage::Sending { target, .. } => target,
            other => {
                self.stage = other;
                return None;
            }
        };

        if let Some(error) = &summary.first_error {
            warn!(target = %target, error = %error, count = summary.send_errors, "send errors during packet trains");
        }
        info!(
            target = %target,
            sent = summary.packets_sent,
            errors = summary.send_errors,
            refused = summary.refused,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "packet trains sent"
        );

        if summary.cancelled {
            Some(Completion::Failed(ProbeError::Cancelled))
        } else {
            Some(Completion::Detached)
        }
    }

    /// Nothing is measured locally.
    pub fn result(&mut self) -> Vec<Sample> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{SocketProvider, TrafficBudget};
    use crate::probes::ProbeKind;
    use crate::scheduler::{Parameters, Timing};
    use std::sync::Arc;
    use std::time::Duration;

    fn params(host: &str, port: u16) -> Parameters {
        let def = PacketTrainDefinition {
            host: host.to_string(),
            port,
            packet_size_bytes: 200,
            train_length: 4,
            iteration_count: 2,
        };
        TestDefinition::parameters_from(&def)
    }

    fn provider(bytes: u64) -> SocketProvider {
        SocketProvider::new(Arc::new(TrafficBudget::new(bytes)), &Default::default())
    }

    #[test]
    fn test_definition_defaults_and_ranges() {
        let mut p = Parameters::new();
        p.insert("host".into(), "192.0.2.1".into());
        p.insert("port".into(), 5106.into());
        let test = TestDefinition::new(ProbeKind::PacketTrains, Timing::Immediate, p);
        let def: PacketTrainDefinition = parse_parameters(&test).unwrap();
        assert_eq!(def.packet_size_bytes, 1000);
        assert!(def.validate().is_ok());

        let too_small = PacketTrainDefinition {
            packet_size_bytes: wire::MEASUREMENT_HEADER_LEN - 1,
            ..def.clone()
        };
        assert!(matches!(too_small.validate(), Err(ProbeError::InvalidDefinition(_))));
        let no_trains = PacketTrainDefinition {
            iteration_count: 0,
            ..def.clone()
        };
        assert!(no_trains.validate().is_err());
        let no_port = PacketTrainDefinition { port: 0, ..def };
        assert!(no_port.validate().is_err());
    }

    #[test]
    fn test_ipv6_target_is_bracketed() {
        let def = PacketTrainDefinition {
            host: "::1".into(),
            port: 9,
            packet_size_bytes: 100,
            train_length: 1,
            iteration_count: 1,
        };
        assert_eq!(def.target(), "[::1]:9");
    }

    #[tokio::test]
    async fn test_missing_host_fails_prepare() {
        let mut p = Parameters::new();
        p.insert("port".into(), 5106.into());
        let test = TestDefinition::new(ProbeKind::PacketTrains, Timing::Immediate, p);
        let mut probe = PacketTrainProbe::new();
        let err = probe.prepare(&provider(1 << 20), &test).await.unwrap_err();
        assert!(matches!(err, ProbeError::InvalidDefinition(_)));
    }

    #[tokio::test]
    async fn test_quota_checked_before_traffic() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();
        let test = TestDefinition::new(ProbeKind::PacketTrains, Timing::Immediate, params("127.0.0.1", port));
        let mut probe = PacketTrainProbe::new();

        let err = probe.prepare(&provider(100), &test).await.unwrap_err();
        assert!(matches!(err, ProbeError::QuotaExhausted { requested, available: 100 } if requested == 1500 + 1600));
    }

    #[tokio::test]
    async fn test_run_is_detached_and_status_unknown() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let port = server.local_addr().unwrap().port();
        let test = TestDefinition::new(ProbeKind::PacketTrains, Timing::Immediate, params("127.0.0.1", port));

        let mut probe = PacketTrainProbe::new();
        probe.prepare(&provider(1 << 20), &test).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        probe.start(tx).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let ProbeEvent::PacketTrains(event) = event else {
            panic!("unexpected event");
        };
        assert_eq!(probe.handle_event(event), Some(Completion::Detached));
        assert_eq!(probe.status(), ProbeStatus::Unknown);
        assert!(probe.result().is_empty());

        let mut buf = [0u8; 2048];
        assert_eq!(server.recv(&mut buf).unwrap(), wire::CONTROL_DATAGRAM_LEN);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();
        let mut p = params("127.0.0.1", port);
        p.insert("iterationCount".into(), 2000.into());
        let test = TestDefinition::new(ProbeKind::PacketTrains, Timing::Immediate, p);

        let mut probe = PacketTrainProbe::new();
        probe.prepare(&provider(1 << 30), &test).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        probe.start(tx).unwrap();

        assert!(probe.stop());
        assert!(!probe.stop());

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let ProbeEvent::PacketTrains(SenderEvent::Finished(summary)) = event else {
            panic!("unexpected event");
        };
        assert!(summary.cancelled);
    }
}
