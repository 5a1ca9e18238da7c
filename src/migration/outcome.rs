//! Per-key transfer outcomes and the decisions that produce them
//!
//! Everything here is pure: the coordinator performs the network calls and
//! feeds their results through [`decide_after_check`] and
//! [`classify_transfer`], so every classification rule is testable without
//! a store.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::store::TransferAck;

/// Whether transfers are performed or only simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Check, transfer and count
    #[default]
    Live,
    /// Check and count; never transfer
    DryRun,
}

impl RunMode {
    /// Mode for a dry-run flag
    pub fn from_dry_run(dry_run: bool) -> Self {
        if dry_run {
            RunMode::DryRun
        } else {
            RunMode::Live
        }
    }

    /// Whether this is a dry run
    pub fn is_dry_run(self) -> bool {
        self == RunMode::DryRun
    }
}

/// The per-key step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedStep {
    /// EXISTS on the target; no transfer was attempted
    Check,
    /// MIGRATE on the source
    Transfer,
}

impl FailedStep {
    /// Short name used in logs and console output
    pub fn as_str(self) -> &'static str {
        match self {
            FailedStep::Check => "check",
            FailedStep::Transfer => "transfer",
        }
    }
}

/// Final classification of one processed key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransferOutcome {
    /// Copied to the target, or would have been in a dry run
    Migrated {
        /// No transfer was issued because the run is a dry run
        simulated: bool,
    },
    /// The target already holds the key; nothing was sent
    SkippedExists,
    /// The transfer was answered with anything but success
    SkippedRejected {
        /// What the source answered
        reply: String,
    },
    /// The check or the transfer failed
    SkippedError {
        /// Which step failed
        step: FailedStep,
        /// Failure description
        reason: String,
    },
}

impl TransferOutcome {
    /// Counts towards the migrated total
    pub fn is_migrated(&self) -> bool {
        matches!(self, TransferOutcome::Migrated { .. })
    }

    /// Counts towards the skipped total
    pub fn is_skipped(&self) -> bool {
        !self.is_migrated()
    }

    /// Stable short label
    pub fn label(&self) -> &'static str {
        match self {
            TransferOutcome::Migrated { simulated: false } => "migrated",
            TransferOutcome::Migrated { simulated: true } => "dry_run",
            TransferOutcome::SkippedExists => "skipped_exists",
            TransferOutcome::SkippedRejected { .. } => "skipped_rejected",
            TransferOutcome::SkippedError { .. } => "skipped_error",
        }
    }
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferOutcome::SkippedRejected { reply } => write!(f, "skipped_rejected ({})", reply),
            TransferOutcome::SkippedError { step, reason } => {
                write!(f, "skipped_error ({} failed: {})", step.as_str(), reason)
            }
            other => f.write_str(other.label()),
        }
    }
}

/// What to do with a key once its existence on the target is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The key is settled without a transfer
    Settled(TransferOutcome),
    /// Issue the transfer
    Transfer,
}

/// Decide a key's fate from the target existence check.
///
/// The dry-run flag only matters once a transfer would be issued, which
/// keeps both modes on the same path up to that point.
pub fn decide_after_check(check: Result<bool, &StoreError>, mode: RunMode) -> Decision {
    match check {
        Err(e) => Decision::Settled(TransferOutcome::SkippedError {
            step: FailedStep::Check,
            reason: e.to_string(),
        }),
        Ok(true) => Decision::Settled(TransferOutcome::SkippedExists),
        Ok(false) if mode.is_dry_run() => {
            Decision::Settled(TransferOutcome::Migrated { simulated: true })
        }
        Ok(false) => Decision::Transfer,
    }
}

/// Classify the result of a transfer.
pub fn classify_transfer(result: Result<TransferAck, &StoreError>) -> TransferOutcome {
    match result {
        Ok(TransferAck::Ok) => TransferOutcome::Migrated { simulated: false },
        Ok(TransferAck::NotAcknowledged(reply)) => TransferOutcome::SkippedRejected { reply },
        Ok(TransferAck::Refused { message, .. }) => {
            TransferOutcome::SkippedRejected { reply: message }
        }
        Err(e) => TransferOutcome::SkippedError {
            step: FailedStep::Transfer,
            reason: e.to_string(),
        },
    }
}
