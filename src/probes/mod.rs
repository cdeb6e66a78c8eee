//! Measurement probes.
//!
//! [`Probe`] is a closed set of variants driven by the task executor through
//! five operations: `status`, `prepare`, `start`, `stop` and `result`.
//! Background work (download workers, the packet-train sender) reports back
//! with [`ProbeEvent`] messages which the executor feeds into
//! [`Probe::handle_event`] on its own task; probes never share mutable state
//! with their workers.

pub mod http_download;
pub mod packet_trains;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use self::http_download::{DownloadEvent, DownloadSample, HttpDownloadProbe};
use self::packet_trains::{PacketTrainProbe, SenderEvent};
use crate::network::ConnectionProvider;
use crate::scheduler::TestDefinition;

/// Probe-type tag carried by every test definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    HttpDownload,
    PacketTrains,
}

impl ProbeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::HttpDownload => "http_download",
            ProbeKind::PacketTrains => "packet_trains",
        }
    }
}

impl std::fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProbeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http_download" | "http-download" | "download" => Ok(ProbeKind::HttpDownload),
            "packet_trains" | "packet-trains" => Ok(ProbeKind::PacketTrains),
            other => Err(format!("unknown probe kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Unknown,
    Running,
    Finished,
    Error,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProbeError {
    #[error("invalid test definition: {0}")]
    InvalidDefinition(String),

    #[error("traffic budget exhausted: {requested} bytes requested, {available} available")]
    QuotaExhausted { requested: u64, available: u64 },

    #[error("no connection to {target}")]
    Unreachable { target: String },

    #[error("measurement rejected: {0}")]
    Untrustworthy(String),

    #[error("probe is not in a state to {0}")]
    InvalidState(&'static str),

    #[error("run cancelled")]
    Cancelled,

    #[error("run timed out after {0:?}")]
    TimedOut(Duration),

    #[error("probe event channel closed before completion")]
    Abandoned,
}

/// Typed sample value carried in a measurement result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Sample {
    Download(DownloadSample),
}

/// Message from a probe's background work to the executor.
#[derive(Debug)]
pub enum ProbeEvent {
    Download(DownloadEvent),
    PacketTrains(SenderEvent),
}

/// How a run ended, as decided by the probe.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// Measurement complete; `result()` holds the samples.
    Finished,
    /// Traffic was generated for a remote analyser; there is nothing to
    /// report locally and the probe keeps its `Unknown` status.
    Detached,
    Failed(ProbeError),
}

pub enum Probe {
    HttpDownload(HttpDownloadProbe),
    PacketTrains(PacketTrainProbe),
}

impl Probe {
    pub fn new(kind: ProbeKind) -> Self {
        match kind {
            ProbeKind::HttpDownload => Probe::HttpDownload(HttpDownloadProbe::new()),
            ProbeKind::PacketTrains => Probe::PacketTrains(PacketTrainProbe::new()),
        }
    }

    pub fn kind(&self) -> ProbeKind {
        match self {
            Probe::HttpDownload(_) => ProbeKind::HttpDownload,
            Probe::PacketTrains(_) => ProbeKind::PacketTrains,
        }
    }

    pub fn status(&self) -> ProbeStatus {
        match self {
            Probe::HttpDownload(p) => p.status(),
            Probe::PacketTrains(p) => p.status(),
        }
    }

    /// Validate parameters and obtain a connection.  No measurement traffic
    /// is generated before this succeeds.
    pub async fn prepare(
        &mut self,
        provider: &dyn ConnectionProvider,
        definition: &TestDefinition,
    ) -> Result<(), ProbeError> {
        match self {
            Probe::HttpDownload(p) => p.prepare(provider, definition).await,
            Probe::PacketTrains(p) => p.prepare(provider, definition).await,
        }
    }

    /// Launch background work.  Completion arrives later on `events`.
    pub fn start(&mut self, events: mpsc::UnboundedSender<ProbeEvent>) -> Result<(), ProbeError> {
        match self {
            Probe::HttpDownload(p) => p.start(events),
            Probe::PacketTrains(p) => p.start(events),
        }
    }

    /// Cancel background work and release sockets.  Idempotent; returns
    /// whether anything was running.
    pub fn stop(&mut self) -> bool {
        match self {
            Probe::HttpDownload(p) => p.stop(),
            Probe::PacketTrains(p) => p.stop(),
        }
    }

    pub fn handle_event(&mut self, event: ProbeEvent) -> Option<Completion> {
        match (self, event) {
            (Probe::HttpDownload(p), ProbeEvent::Download(ev)) => p.handle_event(ev),
            (Probe::PacketTrains(p), ProbeEvent::PacketTrains(ev)) => p.handle_event(ev),
            (probe, event) => {
                tracing::warn!(probe = %probe.kind(), ?event, "ignoring event for another probe kind");
                None
            }
        }
    }

    /// Samples collected by the run.  Taken out of the probe, so a second
    /// call yields nothing.
    pub fn result(&mut self) -> Vec<Sample> {
        match self {
            Probe::HttpDownload(p) => p.result(),
            Probe::PacketTrains(p) => p.result(),
        }
    }
}

/// Type- and range-check a definition's parameters without touching the
/// network.
pub fn validate_parameters(definition: &TestDefinition) -> Result<(), ProbeError> {
    match definition.probe {
        ProbeKind::HttpDownload => {
            parse_parameters::<http_download::DownloadDefinition>(definition)?.validate()?;
        }
        ProbeKind::PacketTrains => {
            parse_parameters::<packet_trains::PacketTrainDefinition>(definition)?.validate()?;
        }
    }
    Ok(())
}

/// Deserialize a parameter payload into a probe's typed definition.
pub(crate) fn parse_parameters<T: serde::de::DeserializeOwned>(
    definition: &TestDefinition,
) -> Result<T, ProbeError> {
    serde_json::from_value(serde_json::Value::Object(definition.parameters.clone()))
        .map_err(|e| ProbeError::InvalidDefinition(e.to_string()))
}

/// Fail with [`ProbeError::QuotaExhausted`] when the provider cannot cover
/// `bytes`.
pub(crate) fn check_budget(provider: &dyn ConnectionProvider, bytes: u64) -> Result<(), ProbeError> {
    let available = provider.available_traffic();
    if available < bytes {
        return Err(ProbeError::QuotaExhausted {
            requested: bytes,
            available,
        });
    }
    Ok(())
}
