//! Process-wide data-transfer budget.

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("traffic budget exhausted: requested {requested} bytes, {available} available")]
pub struct QuotaExhausted {
    pub requested: u64,
    pub available: u64,
}

/// Remaining bytes probes may transfer.
///
/// [`TrafficBudget::try_reserve`] is the single mutation point: the check and
/// the decrement happen in one atomic step.
#[derive(Debug)]
pub struct TrafficBudget {
    available: AtomicU64,
    used: AtomicU64,
}

impl TrafficBudget {
    pub fn new(available: u64) -> Self {
        Self {
            available: AtomicU64::new(available),
            used: AtomicU64::new(0),
        }
    }

    pub fn available(&self) -> u64 {
        self.available.load(Ordering::Acquire)
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// Reserve `bytes`, failing without side effects when the budget is too
    /// small.  Returns what is left afterwards.
    pub fn try_reserve(&self, bytes: u64) -> Result<u64, QuotaExhausted> {
        match self
            .available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |available| {
                available.checked_sub(bytes)
            }) {
            Ok(previous) => {
                self.used.fetch_add(bytes, Ordering::AcqRel);
                let remaining = previous - bytes;
                debug!(reserved = bytes, remaining, "traffic reserved");
                Ok(remaining)
            }
            Err(available) => Err(QuotaExhausted {
                requested: bytes,
                available,
            }),
        }
    }

    /// Reserve `bytes` behind a guard that refunds them on drop unless
    /// [`Reservation::commit`] is called.
    pub fn reserve(&self, bytes: u64) -> Result<Reservation<'_>, QuotaExhausted> {
        self.try_reserve(bytes)?;
        Ok(Reservation {
            budget: self,
            bytes,
            committed: false,
        })
    }

    /// Return a reservation that was never used.
    pub fn refund(&self, bytes: u64) {
        self.available.fetch_add(bytes, Ordering::AcqRel);
        // Saturating: a refund never exceeds what was reserved.
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
        debug!(refunded = bytes, "traffic refunded");
    }
}

/// Pending reservation.  Dropping it uncommitted, including when the future
/// holding it is cancelled, gives the bytes back.
#[must_use = "an uncommitted reservation is refunded on drop"]
#[derive(Debug)]
pub struct Reservation<'a> {
    budget: &'a TrafficBudget,
    bytes: u64,
    committed: bool,
}

impl Reservation<'_> {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Keep the bytes spent.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.budget.refund(self.bytes);
        }
    }
}
