//! Per-key transfer coordination
//!
//! For each key: check the target, settle it if it already exists (or if
//! this is a dry run), otherwise ask the source to copy it over and
//! classify the acknowledgement. Exactly one outcome is recorded per call.

use std::sync::Arc;

use tracing::{info, warn};

use super::counters::RunCounters;
use super::outcome::{classify_transfer, decide_after_check, Decision, RunMode, TransferOutcome};
use crate::store::{display_key, SourceStore, TargetStore, TransferRequest};

/// Drives the check-then-transfer sequence for single keys.
pub struct TransferCoordinator {
    source: Arc<dyn SourceStore>,
    target: Arc<dyn TargetStore>,
    request: TransferRequest,
    mode: RunMode,
    counters: RunCounters,
}

impl TransferCoordinator {
    /// Create a coordinator with fresh counters.
    pub fn new(
        source: Arc<dyn SourceStore>,
        target: Arc<dyn TargetStore>,
        request: TransferRequest,
        mode: RunMode,
    ) -> Self {
        Self {
            source,
            target,
            request,
            mode,
            counters: RunCounters::new(),
        }
    }

    /// Process one key and record its outcome.
    ///
    /// Never fails: per-key problems become `SkippedError` or
    /// `SkippedRejected` outcomes.
    pub async fn process(&self, key: &[u8]) -> TransferOutcome {
        let check = self.target.exists(key).await;

        let outcome = match decide_after_check(check.as_ref().copied(), self.mode) {
            Decision::Settled(outcome) => outcome,
            Decision::Transfer => {
                let result = self.source.transfer(key, &self.request).await;
                classify_transfer(result.as_ref().cloned())
            }
        };

        self.counters.record(&outcome);
        log_outcome(key, &outcome);
        outcome
    }

    /// Run counters
    pub fn counters(&self) -> &RunCounters {
        &self.counters
    }

    /// The request every transfer is issued with
    pub fn request(&self) -> &TransferRequest {
        &self.request
    }
}

fn log_outcome(key: &[u8], outcome: &TransferOutcome) {
    let key = display_key(key);
    match outcome {
        TransferOutcome::Migrated { simulated: false } => info!(key = %key, "migrated"),
        TransferOutcome::Migrated { simulated: true } => {
            info!(key = %key, dry_run = true, "would migrate")
        }
        TransferOutcome::SkippedExists => info!(key = %key, "skipped, exists on target"),
        TransferOutcome::SkippedRejected { reply } => {
            warn!(key = %key, reply = %reply, "skipped, transfer rejected")
        }
        TransferOutcome::SkippedError { step, reason } => {
            warn!(
                key = %key,
                step = step.as_str(),
                error = %reason,
                "skipped, {} failed",
                step.as_str()
            )
        }
    }
}
