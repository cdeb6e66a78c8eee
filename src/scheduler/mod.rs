//! Pending-set scheduler: decides which test definition runs next.
//!
//! The scheduler is a plain single-threaded data structure driven by the
//! agent loop in [`engine`].  Time is always passed in explicitly so due
//! checks are deterministic.

pub mod definition;
pub mod engine;
pub mod storage;
pub mod timing;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use self::definition::{Parameters, TestDefinition};
pub use self::storage::SchedulerStorage;
pub use self::timing::{Timing, TimingError};

use crate::probes::ProbeKind;

/// Upper bound on instants listed per definition by [`Scheduler::preview`].
const MAX_PREVIEW_PER_TEST: usize = 500;

/// Position-aware change notification for the pending set.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    Added {
        definition: TestDefinition,
        position: usize,
    },
    Removed {
        definition: TestDefinition,
        position: usize,
    },
}

#[derive(Debug)]
struct PendingTest {
    definition: TestDefinition,
    due: DateTime<Utc>,
    /// Handed out by a due check and awaiting completion feedback.
    dispatched: bool,
}

/// Insertion-ordered set of pending test definitions, at most one per
/// identity.
#[derive(Default)]
pub struct Scheduler {
    pending: Vec<PendingTest>,
    storage: Option<SchedulerStorage>,
    subscribers: Vec<mpsc::UnboundedSender<SchedulerEvent>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_storage(storage: SchedulerStorage) -> Self {
        Self {
            storage: Some(storage),
            ..Self::default()
        }
    }

    pub fn storage(&self) -> Option<&SchedulerStorage> {
        self.storage.as_ref()
    }

    /// Receive every add/remove notification from now on.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SchedulerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Insert or replace a definition and arm it at its first due instant.
    ///
    /// Returns the due instant, or `None` when the timing policy has nothing
    /// left to fire (the definition is then not kept).
    pub fn enqueue(
        &mut self,
        definition: TestDefinition,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, TimingError> {
        self.insert(definition, now, true)
    }

    /// Re-enqueue definitions read back from storage without writing them
    /// out again.  Invalid or exhausted definitions are skipped.
    pub fn restore(&mut self, definitions: Vec<TestDefinition>, now: DateTime<Utc>) -> usize {
        let mut restored = 0;
        for definition in definitions {
            let id = definition.id;
            let stale_file = self.storage.as_ref().map(|s| s.path_for(&definition));
            match self.insert(definition, now, false) {
                Ok(Some(_)) => restored += 1,
                Ok(None) => {
                    debug!(test_id = %id, "restored definition has no due instant left");
                    if let Some(path) = stale_file {
                        if let Err(e) = std::fs::remove_file(&path) {
                            warn!(path = %path.display(), error = %e, "unable to remove exhausted definition");
                        }
                    }
                }
                Err(e) => warn!(test_id = %id, error = %e, "skipping restored definition"),
            }
        }
        restored
    }

    fn insert(
        &mut self,
        definition: TestDefinition,
        now: DateTime<Utc>,
        persist: bool,
    ) -> Result<Option<DateTime<Utc>>, TimingError> {
        definition.timing.validate()?;

        if let Some(position) = self.position(&definition.id) {
            self.remove_at(position, persist);
        }

        let Some(due) = definition.timing.first_due(now) else {
            info!(test_id = %definition.id, timing = %definition.timing, "timing yields no due instant, not enqueued");
            return Ok(None);
        };

        info!(
            test_id = %definition.id,
            probe = %definition.probe,
            due = %due.to_rfc3339(),
            "test enqueued"
        );

        let position = self.pending.len();
        if persist {
            if let Some(storage) = &self.storage {
                storage.test_added(&definition);
            }
        }
        self.notify(SchedulerEvent::Added {
            definition: definition.clone(),
            position,
        });
        self.pending.push(PendingTest {
            definition,
            due,
            dispatched: false,
        });
        Ok(Some(due))
    }

    /// Remove a definition unconditionally.
    pub fn cancel(&mut self, id: &Uuid) -> bool {
        match self.position(id) {
            Some(position) => {
                self.remove_at(position, true);
                info!(test_id = %id, "test cancelled");
                true
            }
            None => false,
        }
    }

    fn remove_at(&mut self, position: usize, persist: bool) -> TestDefinition {
        let removed = self.pending.remove(position).definition;
        if persist {
            if let Some(storage) = &self.storage {
                storage.test_removed(&removed);
            }
        }
        self.notify(SchedulerEvent::Removed {
            definition: removed.clone(),
            position,
        });
        removed
    }

    fn notify(&mut self, event: SchedulerEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// All definitions due at `now` that are not already dispatched, ordered
    /// by due instant with ties in insertion order.  Returned definitions are
    /// marked dispatched until [`Scheduler::complete`] is called for them.
    pub fn due_now(&mut self, now: DateTime<Utc>) -> Vec<TestDefinition> {
        let mut due: Vec<usize> = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.dispatched && p.due <= now)
            .map(|(i, _)| i)
            .collect();
        // Stable: equal instants keep insertion order.
        due.sort_by_key(|i| self.pending[*i].due);

        due.into_iter()
            .map(|i| {
                let entry = &mut self.pending[i];
                entry.dispatched = true;
                entry.definition.clone()
            })
            .collect()
    }

    /// The single earliest due definition, marked dispatched.
    pub fn take_next_due(&mut self, now: DateTime<Utc>) -> Option<TestDefinition> {
        let index = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.dispatched && p.due <= now)
            .min_by_key(|(i, p)| (p.due, *i))
            .map(|(i, _)| i)?;
        let entry = &mut self.pending[index];
        entry.dispatched = true;
        Some(entry.definition.clone())
    }

    /// Earliest due instant among definitions still waiting to be dispatched.
    pub fn next_due_instant(&self) -> Option<DateTime<Utc>> {
        self.pending
            .iter()
            .filter(|p| !p.dispatched)
            .map(|p| p.due)
            .min()
    }

    /// Completion feedback for a dispatched definition.
    ///
    /// Re-arms the definition at the policy's next instant or retires it.
    /// Failed runs are re-armed exactly like successful ones.  Returns the new
    /// due instant, if any.
    pub fn complete(&mut self, id: &Uuid, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let Some(position) = self.position(id) else {
            debug!(test_id = %id, "completed test is no longer pending");
            return None;
        };

        let entry = &self.pending[position];
        let previous = entry.due;
        let timing = &entry.definition.timing;

        let mut next = timing.next_due_after(previous);
        if let Some(candidate) = next {
            let coalesces = matches!(timing, Timing::Periodic { .. } | Timing::Calendar { .. });
            if coalesces && candidate < now {
                let skipped_to = timing.next_due_after(now);
                warn!(
                    test_id = %id,
                    missed = %candidate.to_rfc3339(),
                    "due instant already passed, skipping forward"
                );
                next = skipped_to;
            }
        }

        match next {
            Some(due) => {
                let entry = &mut self.pending[position];
                entry.due = due;
                entry.dispatched = false;
                debug!(test_id = %id, due = %due.to_rfc3339(), "test re-armed");
                Some(due)
            }
            None => {
                self.remove_at(position, true);
                info!(test_id = %id, "timing exhausted, test retired");
                None
            }
        }
    }

    /// Upcoming runs within `horizon` of `now`, sorted by instant.
    pub fn preview(
        &self,
        now: DateTime<Utc>,
        horizon: Duration,
    ) -> Vec<(DateTime<Utc>, Uuid, ProbeKind)> {
        let end = now.checked_add_signed(horizon).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut preview = Vec::new();

        for entry in &self.pending {
            let mut next = Some(entry.due);
            let mut listed = 0;
            while let Some(at) = next {
                if at > end || listed >= MAX_PREVIEW_PER_TEST {
                    break;
                }
                preview.push((at, entry.definition.id, entry.definition.probe));
                listed += 1;
                next = entry.definition.timing.next_due_after(at);
            }
        }

        preview.sort_by_key(|(at, _, _)| *at);
        preview
    }

    pub fn position(&self, id: &Uuid) -> Option<usize> {
        self.pending.iter().position(|p| &p.definition.id == id)
    }

    pub fn get(&self, id: &Uuid) -> Option<&TestDefinition> {
        self.pending
            .iter()
            .find(|p| &p.definition.id == id)
            .map(|p| &p.definition)
    }

    pub fn due_instant(&self, id: &Uuid) -> Option<DateTime<Utc>> {
        self.pending
            .iter()
            .find(|p| &p.definition.id == id)
            .map(|p| p.due)
    }

    /// Pending definitions in insertion order.
    pub fn tests(&self) -> impl Iterator<Item = &TestDefinition> {
        self.pending.iter().map(|p| &p.definition)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Write the pending set out when storage runs in batched mode.
    pub fn flush(&self) {
        if let Some(storage) = &self.storage {
            storage.flush(self.pending.iter().map(|p| &p.definition));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
