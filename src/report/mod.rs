//! Measurement results and the per-test reports they accumulate into.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::probes::Sample;

/// Outcome of one successful run.  Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementResult {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub samples: Vec<Sample>,
}

impl MeasurementResult {
    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }
}

/// Every result reported for one test identity, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub test_id: Uuid,
    /// When the latest result was added.
    pub timestamp: DateTime<Utc>,
    pub results: Vec<MeasurementResult>,
}

impl Report {
    pub fn new(test_id: Uuid) -> Self {
        Self {
            test_id,
            timestamp: Utc::now(),
            results: Vec::new(),
        }
    }
}

/// Receives finished results keyed by test identity.
pub trait ReportSink: Send {
    fn submit(&mut self, test_id: Uuid, result: MeasurementResult);
}

/// Report sink keeping one report per identity, optionally mirrored to one
/// JSON file per identity.
#[derive(Debug, Default)]
pub struct ReportStore {
    reports: HashMap<Uuid, Report>,
    dir: Option<PathBuf>,
}

impl ReportStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a directory-backed store and load the reports already in it.
    /// Malformed files are skipped with a logged error.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create report directory: {}", dir.display()))?;

        let mut reports = HashMap::new();
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("failed to scan report directory: {}", dir.display()))?;
        for path in entries.filter_map(|e| e.ok()).map(|e| e.path()) {
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_report(&path) {
                Ok(report) => {
                    reports.insert(report.test_id, report);
                }
                Err(e) => error!(path = %path.display(), error = %e, "skipping unreadable report"),
            }
        }

        info!(dir = %dir.display(), count = reports.len(), "report store opened");
        Ok(Self {
            reports,
            dir: Some(dir),
        })
    }

    pub fn get(&self, test_id: &Uuid) -> Option<&Report> {
        self.reports.get(test_id)
    }

    pub fn reports(&self) -> impl Iterator<Item = &Report> {
        self.reports.values()
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    fn path_for(dir: &Path, test_id: &Uuid) -> PathBuf {
        dir.join(format!("{}.json", test_id))
    }

    fn persist(&self, report: &Report) {
        let Some(dir) = &self.dir else {
            return;
        };
        let path = Self::path_for(dir, &report.test_id);
        if let Err(e) = write_report(&path, report) {
            warn!(path = %path.display(), error = %e, "failed to persist report");
        }
    }
}

impl ReportSink for ReportStore {
    fn submit(&mut self, test_id: Uuid, result: MeasurementResult) {
        let report = self
            .reports
            .entry(test_id)
            .or_insert_with(|| Report::new(test_id));
        report.results.push(result);
        report.timestamp = Utc::now();
        debug!(test_id = %test_id, results = report.results.len(), "result added to report");

        let report = report.clone();
        self.persist(&report);
    }
}

fn read_report(path: &Path) -> Result<Report> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

fn write_report(path: &Path, report: &Report) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let json = serde_json::to_string_pretty(report).context("failed to serialize report")?;
    std::fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("failed to rename {}", tmp.display()))?;
    Ok(())
}
