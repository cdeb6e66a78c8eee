//! Throughput aggregation and trust check for the download probe.
//!
//! Runs once, after every worker has reached a terminal state, over the
//! per-worker read traces.  Pure: no clocks, no I/O.

use std::time::Duration;

use super::worker::WorkerError;
use crate::probes::ProbeError;

pub const MIN_THREADS: usize = 1;
pub const MAX_THREADS: usize = 6;
pub const MIN_TARGET_TIME: Duration = Duration::from_millis(2_000);
pub const MAX_TARGET_TIME: Duration = Duration::from_millis(45_000);
pub const MIN_RAMP_UP: Duration = Duration::from_millis(1_000);
pub const MAX_RAMP_UP: Duration = Duration::from_millis(10_000);
pub const MIN_SLOT_LENGTH: Duration = Duration::from_millis(250);

const RAMP_UP_DIVISOR: u32 = 4;

/// Slow-start interval excluded from every worker's average.
pub fn ramp_up_for(target_time: Duration) -> Duration {
    (target_time / RAMP_UP_DIVISOR).clamp(MIN_RAMP_UP, MAX_RAMP_UP)
}

/// One completed socket read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadSample {
    pub bytes: u64,
    /// Nanoseconds since the run's anchor.
    pub at_ns: u64,
}

/// Everything one worker observed.  Times are nanoseconds since the run's
/// shared anchor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerTrace {
    pub connected_ns: Option<u64>,
    pub first_byte_ns: Option<u64>,
    pub finished_ns: u64,
    pub samples: Vec<ReadSample>,
}

impl WorkerTrace {
    pub fn total_bytes(&self) -> u64 {
        self.samples.iter().map(|s| s.bytes).sum()
    }

    /// Bytes whose read completed in `(start_ns, end_ns]`.
    pub fn bytes_between(&self, start_ns: u64, end_ns: u64) -> u64 {
        self.samples
            .iter()
            .filter(|s| s.at_ns > start_ns && s.at_ns <= end_ns)
            .map(|s| s.bytes)
            .sum()
    }

    /// Average throughput over `(start_ns, end_ns]` in bits per second.
    pub fn average_bps(&self, start_ns: u64, end_ns: u64) -> f64 {
        if end_ns <= start_ns {
            return 0.0;
        }
        let secs = (end_ns - start_ns) as f64 / 1e9;
        self.bytes_between(start_ns, end_ns) as f64 * 8.0 / secs
    }

    /// Throughput per fixed-length slot from `start_ns` up to `end_ns`; the
    /// last slot may be partial but is divided by the full slot length.
    pub fn slot_series(&self, start_ns: u64, end_ns: u64, slot: Duration) -> Vec<f64> {
        let slot_ns = slot.as_nanos() as u64;
        if slot_ns == 0 || end_ns <= start_ns {
            return Vec::new();
        }
        let slots = (end_ns - start_ns).div_ceil(slot_ns) as usize;
        let mut series = vec![0u64; slots];
        for sample in &self.samples {
            if sample.at_ns <= start_ns || sample.at_ns > end_ns {
                continue;
            }
            let index = ((sample.at_ns - start_ns - 1) / slot_ns) as usize;
            series[index.min(slots - 1)] += sample.bytes;
        }
        let slot_secs = slot_ns as f64 / 1e9;
        series
            .into_iter()
            .map(|bytes| bytes as f64 * 8.0 / slot_secs)
            .collect()
    }

    /// Post-ramp-up measurement window.
    pub fn window(&self, ramp_up: Duration) -> Option<(u64, u64)> {
        let start = self.first_byte_ns? + ramp_up.as_nanos() as u64;
        Some((start, self.finished_ns))
    }

    pub fn time_to_first_byte(&self) -> Option<Duration> {
        let connected = self.connected_ns?;
        let first = self.first_byte_ns?;
        Some(Duration::from_nanos(first.saturating_sub(connected)))
    }
}

/// Combined outcome of a trusted run.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    /// Sum of the per-worker post-ramp-up averages.
    pub bandwidth_bps: f64,
    /// `None` for workers that finished in error.
    pub per_worker_bps: Vec<Option<f64>>,
    pub successful_workers: usize,
    pub elapsed: Duration,
    pub bytes_received: u64,
    /// All successful workers summed, per slot from the anchor.
    pub slots_bps: Vec<f64>,
}

/// Least number of successful workers a run with `threads` workers needs.
pub fn required_workers(threads: usize) -> usize {
    threads.div_ceil(2).max(1)
}

/// Combine worker traces into one bandwidth figure, rejecting runs that are
/// not representative.
pub fn aggregate(
    outcomes: &[Result<WorkerTrace, WorkerError>],
    ramp_up: Duration,
    slot_length: Duration,
) -> Result<Aggregate, ProbeError> {
    let untrusted = |msg: String| Err(ProbeError::Untrustworthy(msg));

    let successful: Vec<(usize, &WorkerTrace)> = outcomes
        .iter()
        .enumerate()
        .filter_map(|(i, o)| o.as_ref().ok().map(|t| (i, t)))
        .collect();

    if successful.is_empty() {
        return untrusted(format!("all {} workers failed", outcomes.len()));
    }
    let required = required_workers(outcomes.len());
    if successful.len() < required {
        return untrusted(format!(
            "only {} of {} workers succeeded, {} required",
            successful.len(),
            outcomes.len(),
            required
        ));
    }

    let elapsed_ns = successful
        .iter()
        .map(|(_, t)| t.finished_ns)
        .max()
        .unwrap_or(0);
    let elapsed = Duration::from_nanos(elapsed_ns);
    if elapsed < MIN_TARGET_TIME || elapsed > MAX_TARGET_TIME {
        return untrusted(format!(
            "elapsed time {} ms outside [{}, {}] ms",
            elapsed.as_millis(),
            MIN_TARGET_TIME.as_millis(),
            MAX_TARGET_TIME.as_millis()
        ));
    }

    let mut per_worker_bps = vec![None; outcomes.len()];
    let mut bandwidth_bps = 0.0;
    for (index, trace) in &successful {
        let (start, end) = match trace.window(ramp_up) {
            Some(window) if trace.bytes_between(window.0, window.1) > 0 => window,
            _ => {
                return untrusted(format!("worker {} received no data after ramp-up", index));
            }
        };
        let bps = trace.average_bps(start, end);
        per_worker_bps[*index] = Some(bps);
        bandwidth_bps += bps;
    }

    let mut slots_bps: Vec<f64> = Vec::new();
    for (_, trace) in &successful {
        let series = trace.slot_series(0, elapsed_ns, slot_length);
        if slots_bps.len() < series.len() {
            slots_bps.resize(series.len(), 0.0);
        }
        for (slot, bps) in slots_bps.iter_mut().zip(series) {
            *slot += bps;
        }
    }

    Ok(Aggregate {
        bandwidth_bps,
        per_worker_bps,
        successful_workers: successful.len(),
        elapsed,
        bytes_received: successful.iter().map(|(_, t)| t.total_bytes()).sum(),
        slots_bps,
    })
}
