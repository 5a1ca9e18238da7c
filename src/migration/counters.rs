//! Run-scoped accounting
//!
//! Counters live for one run and are never persisted. They are atomics so
//! concurrent workers can record outcomes without a lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::outcome::TransferOutcome;

/// Live counters for one migration run.
#[derive(Debug, Default)]
pub struct RunCounters {
    migrated: AtomicU64,
    skipped: AtomicU64,
    simulated: AtomicU64,
    skipped_exists: AtomicU64,
    skipped_rejected: AtomicU64,
    skipped_error: AtomicU64,
}

impl RunCounters {
    /// Fresh counters, all zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one processed key. Called exactly once per key.
    pub fn record(&self, outcome: &TransferOutcome) {
        match outcome {
            TransferOutcome::Migrated { simulated } => {
                self.migrated.fetch_add(1, Ordering::Relaxed);
                if *simulated {
                    self.simulated.fetch_add(1, Ordering::Relaxed);
                }
            }
            TransferOutcome::SkippedExists => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                self.skipped_exists.fetch_add(1, Ordering::Relaxed);
            }
            TransferOutcome::SkippedRejected { .. } => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                self.skipped_rejected.fetch_add(1, Ordering::Relaxed);
            }
            TransferOutcome::SkippedError { .. } => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                self.skipped_error.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            migrated: self.migrated.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            simulated: self.simulated.load(Ordering::Relaxed),
            skipped_exists: self.skipped_exists.load(Ordering::Relaxed),
            skipped_rejected: self.skipped_rejected.load(Ordering::Relaxed),
            skipped_error: self.skipped_error.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`RunCounters`] at one moment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    /// Keys migrated (including simulated ones in a dry run)
    pub migrated: u64,
    /// Keys skipped for any reason
    pub skipped: u64,
    /// Of `migrated`, how many were only simulated
    pub simulated: u64,
    /// Of `skipped`, keys already on the target
    pub skipped_exists: u64,
    /// Of `skipped`, transfers answered with a non-success reply
    pub skipped_rejected: u64,
    /// Of `skipped`, checks or transfers that failed
    pub skipped_error: u64,
}

impl CounterSnapshot {
    /// Keys processed so far
    pub fn processed(&self) -> u64 {
        self.migrated + self.skipped
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The cursor reached the end of the keyspace
    Completed,
    /// A shutdown request stopped the run early
    Cancelled,
}

/// Authoritative accounting of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// How the run ended
    pub status: RunStatus,
    /// Whether transfers were simulated
    pub dry_run: bool,
    /// Final counters
    #[serde(flatten)]
    pub counters: CounterSnapshot,
    /// Keys seen, repeated visits included
    #[serde(default)]
    pub processed: u64,
    /// Keyspace pages fetched
    pub batches: u64,
    /// Wall-clock duration
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl RunSummary {
    /// Summary over final counters; `processed` is derived from them.
    pub fn new(
        status: RunStatus,
        dry_run: bool,
        counters: CounterSnapshot,
        batches: u64,
        duration: Duration,
    ) -> Self {
        Self {
            status,
            dry_run,
            processed: counters.processed(),
            counters,
            batches,
            duration,
        }
    }

    /// Total migrated
    pub fn migrated(&self) -> u64 {
        self.counters.migrated
    }

    /// Total skipped
    pub fn skipped(&self) -> u64 {
        self.counters.skipped
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
