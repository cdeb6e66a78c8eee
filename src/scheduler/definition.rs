//! Test definitions: what to run, with which parameters, and when.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::timing::Timing;
use crate::probes::ProbeKind;

/// Opaque, probe-specific parameter payload.
///
/// Each probe validates and type-checks its own keys at prepare time.
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// A scheduled measurement.
///
/// Immutable once enqueued; the scheduler only derives due instants from the
/// attached [`Timing`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDefinition {
    pub id: Uuid,
    pub probe: ProbeKind,
    pub timing: Timing,
    #[serde(default)]
    pub parameters: Parameters,
}

impl TestDefinition {
    pub fn new(probe: ProbeKind, timing: Timing, parameters: Parameters) -> Self {
        Self {
            id: Uuid::new_v4(),
            probe,
            timing,
            parameters,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Build a parameter payload from any serializable value.
    ///
    /// Non-object values yield an empty payload.
    pub fn parameters_from<T: Serialize>(value: &T) -> Parameters {
        match serde_json::to_value(value) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => Parameters::new(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
