//! Timing policies: pure functions from an instant to the next due instant.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest accepted periodic interval (one year).
pub const MAX_PERIODIC_INTERVAL_MS: u64 = 366 * 24 * 60 * 60 * 1000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimingError {
    #[error("periodic interval must be greater than zero")]
    ZeroInterval,

    #[error("periodic interval of {interval_ms}ms exceeds the {max_ms}ms maximum")]
    IntervalTooLong { interval_ms: u64, max_ms: u64 },

    #[error("periodic end {end} precedes start {start}")]
    EndBeforeStart { start: String, end: String },

    #[error("scheduled timing has no instants")]
    EmptySchedule,

    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },
}

/// When a test definition becomes due.
///
/// Every variant satisfies the same contract: [`Timing::next_due_after`] is
/// deterministic and monotonic non-decreasing in its argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Timing {
    /// Due as soon as it is enqueued; fires once.
    Immediate,
    /// Fixed interval anchored at `start`, optionally bounded by `end`.
    Periodic {
        start: DateTime<Utc>,
        interval_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end: Option<DateTime<Utc>>,
    },
    /// Explicit list of instants, consumed in chronological order.
    Scheduled { instants: Vec<DateTime<Utc>> },
    /// Cron calendar expression (seconds field first).
    Calendar { cron: String },
}

impl Timing {
    pub fn periodic(start: DateTime<Utc>, interval: std::time::Duration) -> Self {
        Timing::Periodic {
            start,
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            end: None,
        }
    }

    pub fn scheduled(mut instants: Vec<DateTime<Utc>>) -> Self {
        instants.sort();
        instants.dedup();
        Timing::Scheduled { instants }
    }

    /// Build a calendar timing, rejecting expressions `cron` cannot parse.
    pub fn calendar(expr: &str) -> Result<Self, TimingError> {
        let timing = Timing::Calendar {
            cron: expr.to_string(),
        };
        timing.validate()?;
        Ok(timing)
    }

    /// Reject policies that can never produce a sensible instant.
    pub fn validate(&self) -> Result<(), TimingError> {
        match self {
            Timing::Immediate => Ok(()),
            Timing::Periodic {
                start,
                interval_ms,
                end,
            } => {
                if *interval_ms == 0 {
                    return Err(TimingError::ZeroInterval);
                }
                if *interval_ms > MAX_PERIODIC_INTERVAL_MS {
                    return Err(TimingError::IntervalTooLong {
                        interval_ms: *interval_ms,
                        max_ms: MAX_PERIODIC_INTERVAL_MS,
                    });
                }
                if let Some(end) = end {
                    if end < start {
                        return Err(TimingError::EndBeforeStart {
                            start: start.to_rfc3339(),
                            end: end.to_rfc3339(),
                        });
                    }
                }
                Ok(())
            }
            Timing::Scheduled { instants } => {
                if instants.is_empty() {
                    Err(TimingError::EmptySchedule)
                } else {
                    Ok(())
                }
            }
            Timing::Calendar { cron } => parse_cron(cron).map(|_| ()),
        }
    }

    /// First due instant for a definition enqueued at `now` (inclusive).
    pub fn first_due(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Timing::Immediate => Some(now),
            Timing::Periodic {
                start,
                interval_ms,
                end,
            } => {
                let interval = interval_millis(*interval_ms)?;
                let slot = if now <= *start {
                    *start
                } else {
                    let slots = (now - *start).num_milliseconds() / interval;
                    let candidate = slot_at(*start, slots, interval)?;
                    if candidate < now {
                        slot_at(*start, slots.checked_add(1)?, interval)?
                    } else {
                        candidate
                    }
                };
                within_end(slot, *end)
            }
            Timing::Scheduled { instants } => instants.iter().filter(|t| **t >= now).min().copied(),
            Timing::Calendar { .. } => self.next_due_after(now - Duration::nanoseconds(1)),
        }
    }

    /// Next due instant strictly after `t`, or `None` when the policy is
    /// exhausted.
    pub fn next_due_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Timing::Immediate => None,
            Timing::Periodic {
                start,
                interval_ms,
                end,
            } => {
                let interval = interval_millis(*interval_ms)?;
                let slot = if t < *start {
                    *start
                } else {
                    let slots = (t - *start).num_milliseconds() / interval;
                    slot_at(*start, slots.checked_add(1)?, interval)?
                };
                within_end(slot, *end)
            }
            Timing::Scheduled { instants } => instants.iter().filter(|i| **i > t).min().copied(),
            Timing::Calendar { cron } => {
                let schedule = parse_cron(cron).ok()?;
                let next = schedule.after(&t).next();
                next
            }
        }
    }

    /// Whether the policy can fire more than once.
    pub fn is_recurring(&self) -> bool {
        match self {
            Timing::Immediate => false,
            Timing::Scheduled { instants } => instants.len() > 1,
            Timing::Periodic { .. } | Timing::Calendar { .. } => true,
        }
    }
}

/// Positive interval as signed milliseconds, `None` when unrepresentable.
fn interval_millis(interval_ms: u64) -> Option<i64> {
    i64::try_from(interval_ms).ok().filter(|ms| *ms > 0)
}

/// `start + slots * interval`, `None` on overflow.
fn slot_at(start: DateTime<Utc>, slots: i64, interval_ms: i64) -> Option<DateTime<Utc>> {
    let offset = Duration::try_milliseconds(slots.checked_mul(interval_ms)?)?;
    start.checked_add_signed(offset)
}

fn within_end(slot: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match end {
        Some(end) if slot > end => None,
        _ => Some(slot),
    }
}

fn parse_cron(expr: &str) -> Result<CronSchedule, TimingError> {
    CronSchedule::from_str(expr).map_err(|e| TimingError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

impl fmt::Display for Timing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timing::Immediate => write!(f, "immediate"),
            Timing::Periodic {
                interval_ms, end, ..
            } => match end {
                Some(end) => write!(f, "every {}ms until {}", interval_ms, end.to_rfc3339()),
                None => write!(f, "every {}ms", interval_ms),
            },
            Timing::Scheduled { instants } => write!(f, "{} scheduled instants", instants.len()),
            Timing::Calendar { cron } => write!(f, "cron '{}'", cron),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn all_policies() -> Vec<Timing> {
        vec![
            Timing::Immediate,
            Timing::Periodic {
                start: at(0),
                interval_ms: 60_000,
                end: None,
            },
            Timing::Periodic {
                start: at(0),
                interval_ms: 90_000,
                end: Some(at(600)),
            },
            Timing::scheduled(vec![at(30), at(10), at(500)]),
            Timing::calendar("0 */5 * * * *").unwrap(),
        ]
    }

    #[test]
    fn test_next_due_is_monotonic() {
        for timing in all_policies() {
            let mut previous: Option<DateTime<Utc>> = None;
            let mut exhausted = false;
            for step in -120..1200 {
                let next = timing.next_due_after(at(step));
                match (previous, next) {
                    (Some(p), Some(n)) => {
                        assert!(!exhausted, "{timing}: policy revived after exhaustion");
                        assert!(n >= p, "{timing}: {n} < {p}");
                    }
                    (_, None) => exhausted = true,
                    (None, Some(_)) => {
                        assert!(!exhausted, "{timing}: policy revived after exhaustion")
                    }
                }
                previous = next.or(previous);
            }
        }
    }

    #[test]
    fn test_next_due_is_deterministic() {
        for timing in all_policies() {
            assert_eq!(timing.next_due_after(at(42)), timing.next_due_after(at(42)));
        }
    }

    #[test]
    fn test_periodic_adds_interval_once_fired() {
        let timing = Timing::Periodic {
            start: at(0),
            interval_ms: 30_000,
            end: None,
        };
        let first = timing.first_due(at(0)).unwrap();
        assert_eq!(first, at(0));
        let second = timing.next_due_after(first).unwrap();
        assert_eq!(second, first + Duration::seconds(30));
        let third = timing.next_due_after(second).unwrap();
        assert_eq!(third, second + Duration::seconds(30));
    }

    #[test]
    fn test_periodic_first_due_aligns_to_slot() {
        let timing = Timing::Periodic {
            start: at(0),
            interval_ms: 10_000,
            end: None,
        };
        assert_eq!(timing.first_due(at(25)), Some(at(30)));
        assert_eq!(timing.first_due(at(30)), Some(at(30)));
        assert_eq!(timing.first_due(at(-5)), Some(at(0)));
    }

    #[test]
    fn test_periodic_respects_end() {
        let timing = Timing::Periodic {
            start: at(0),
            interval_ms: 10_000,
            end: Some(at(20)),
        };
        assert_eq!(timing.next_due_after(at(10)), Some(at(20)));
        assert_eq!(timing.next_due_after(at(20)), None);
    }

    #[test]
    fn test_immediate_fires_once() {
        let timing = Timing::Immediate;
        assert_eq!(timing.first_due(at(7)), Some(at(7)));
        assert_eq!(timing.next_due_after(at(7)), None);
        assert!(!timing.is_recurring());
    }

    #[test]
    fn test_scheduled_consumed_in_order() {
        let timing = Timing::scheduled(vec![at(300), at(100), at(200)]);
        let first = timing.first_due(at(0)).unwrap();
        assert_eq!(first, at(100));
        let second = timing.next_due_after(first).unwrap();
        assert_eq!(second, at(200));
        let third = timing.next_due_after(second).unwrap();
        assert_eq!(third, at(300));
        assert_eq!(timing.next_due_after(third), None);
    }

    #[test]
    fn test_scheduled_skips_past_instants() {
        let timing = Timing::scheduled(vec![at(10), at(100)]);
        assert_eq!(timing.first_due(at(50)), Some(at(100)));
        assert_eq!(timing.first_due(at(150)), None);
    }

    #[test]
    fn test_calendar_every_five_minutes() {
        let timing = Timing::calendar("0 */5 * * * *").unwrap();
        let first = timing.first_due(at(1)).unwrap();
        let second = timing.next_due_after(first).unwrap();
        assert_eq!(second - first, Duration::minutes(5));
    }

    #[test]
    fn test_invalid_policies_rejected() {
        assert!(matches!(
            Timing::calendar("not a cron"),
            Err(TimingError::InvalidCron { .. })
        ));
        assert_eq!(
            Timing::Periodic {
                start: at(0),
                interval_ms: 0,
                end: None
            }
            .validate(),
            Err(TimingError::ZeroInterval)
        );
        assert_eq!(
            Timing::Scheduled { instants: vec![] }.validate(),
            Err(TimingError::EmptySchedule)
        );
        assert!(matches!(
            Timing::Periodic {
                start: at(10),
                interval_ms: 1000,
                end: Some(at(0))
            }
            .validate(),
            Err(TimingError::EndBeforeStart { .. })
        ));
    }

    #[test]
    fn test_huge_periodic_interval_never_panics() {
        let timing = Timing::Periodic {
            start: at(0),
            interval_ms: i64::MAX as u64,
            end: None,
        };
        assert!(matches!(
            timing.validate(),
            Err(TimingError::IntervalTooLong { .. })
        ));
        assert_eq!(timing.first_due(at(10)), None);
        assert_eq!(timing.next_due_after(at(10)), None);
        assert_eq!(timing.first_due(at(-10)), Some(at(0)));

        let timing = Timing::Periodic {
            start: at(0),
            interval_ms: u64::MAX,
            end: None,
        };
        assert_eq!(timing.first_due(at(10)), None);
        assert_eq!(timing.next_due_after(at(10)), None);
    }

    #[test]
    fn test_periodic_constructor_saturates() {
        let timing = Timing::periodic(at(0), std::time::Duration::MAX);
        assert!(matches!(timing, Timing::Periodic { interval_ms: u64::MAX, .. }));
        assert!(timing.validate().is_err());

        let year = std::time::Duration::from_millis(MAX_PERIODIC_INTERVAL_MS);
        assert!(Timing::periodic(at(0), year).validate().is_ok());
    }

    #[test]
    fn test_serde_tagged_representation() {
        let json = serde_json::to_value(Timing::Immediate).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "immediate" }));

        let periodic: Timing = serde_json::from_value(serde_json::json!({
            "type": "periodic",
            "start": "2024-01-01T00:00:00Z",
            "interval_ms": 60000
        }))
        .unwrap();
        assert!(matches!(periodic, Timing::Periodic { interval_ms: 60000, end: None, .. }));
    }
}
