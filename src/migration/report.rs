//! Run reporting
//!
//! A [`ReportSink`] receives a progress line per batch, a classification
//! per key and the final summary. [`ConsoleReporter`] renders them for a
//! terminal, or as JSON lines: one object per key, then the summary.

use std::io::Write;

use colored::Colorize;
use parking_lot::Mutex;
use serde::Serialize;

use super::counters::{CounterSnapshot, RunStatus, RunSummary};
use super::outcome::TransferOutcome;
use crate::store::display_key;

/// Progress at the start of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    /// 1-based batch number
    pub batch: u64,
    /// Keys in this batch
    pub keys: usize,
    /// Totals before this batch
    pub totals: CounterSnapshot,
}

/// One classified key as written in JSON mode.
#[derive(Debug, Serialize)]
pub struct KeyRecord<'a> {
    /// Key rendered with [`display_key`]
    pub key: String,
    #[serde(flatten)]
    pub outcome: &'a TransferOutcome,
}

impl<'a> KeyRecord<'a> {
    pub fn new(key: &[u8], outcome: &'a TransferOutcome) -> Self {
        Self {
            key: display_key(key),
            outcome,
        }
    }
}

/// Receives run progress.
pub trait ReportSink: Send + Sync {
    /// A batch is about to be processed
    fn batch_started(&self, progress: &BatchProgress);

    /// A key has been classified
    fn key_processed(&self, key: &[u8], outcome: &TransferOutcome);

    /// The run ended, completed or cancelled
    fn finished(&self, summary: &RunSummary);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl ReportSink for NullReporter {
    fn batch_started(&self, _progress: &BatchProgress) {}

    fn key_processed(&self, _key: &[u8], _outcome: &TransferOutcome) {}

    fn finished(&self, _summary: &RunSummary) {}
}

/// Terminal reporter.
pub struct ConsoleReporter {
    out: Mutex<Box<dyn Write + Send>>,
    json: bool,
}

impl ConsoleReporter {
    /// Report to stdout. With `json`, every key and the summary are printed
    /// as one JSON object per line and batch progress is left out.
    pub fn stdout(json: bool) -> Self {
        Self::with_writer(Box::new(std::io::stdout()), json)
    }

    /// Report to any writer
    pub fn with_writer(out: Box<dyn Write + Send>, json: bool) -> Self {
        Self {
            out: Mutex::new(out),
            json,
        }
    }

    fn emit_json<T: Serialize>(&self, value: &T) {
        match serde_json::to_string(value) {
            Ok(line) => self.emit(&line),
            Err(e) => tracing::error!(error = %e, "failed to serialize report line"),
        }
    }

    fn emit(&self, text: &str) {
        let mut out = self.out.lock();
        // A closed stdout must not abort the run.
        let _ = writeln!(out, "{}", text);
        let _ = out.flush();
    }
}

impl ReportSink for ConsoleReporter {
    fn batch_started(&self, progress: &BatchProgress) {
        if self.json || progress.keys == 0 {
            return;
        }
        self.emit(&format_progress(progress));
    }

    fn key_processed(&self, key: &[u8], outcome: &TransferOutcome) {
        if self.json {
            self.emit_json(&KeyRecord::new(key, outcome));
        } else {
            self.emit(&format_outcome(key, outcome));
        }
    }

    fn finished(&self, summary: &RunSummary) {
        if self.json {
            self.emit_json(summary);
        } else {
            self.emit(&format_summary(summary));
        }
    }
}

/// One progress line.
pub fn format_progress(progress: &BatchProgress) -> String {
    format!(
        "{} batch {}: {} keys (migrated {}, skipped {})",
        "→".cyan().bold(),
        progress.batch,
        progress.keys,
        progress.totals.migrated,
        progress.totals.skipped
    )
}

/// One classification line.
pub fn format_outcome(key: &[u8], outcome: &TransferOutcome) -> String {
    let key = display_key(key);
    match outcome {
        TransferOutcome::Migrated { simulated: false } => {
            format!("{} {}", "[MIGRATED]".green().bold(), key)
        }
        TransferOutcome::Migrated { simulated: true } => {
            format!("{} would migrate {}", "[DRY RUN]".cyan().bold(), key)
        }
        TransferOutcome::SkippedExists => {
            format!("{} {} already exists on target", "[SKIP]".yellow(), key)
        }
        TransferOutcome::SkippedRejected { reply } => {
            format!("{} {}: {}", "[REJECTED]".yellow().bold(), key, reply.dimmed())
        }
        TransferOutcome::SkippedError { step, reason } => {
            format!(
                "{} {}: {} failed: {}",
                "[ERROR]".red().bold(),
                key,
                step.as_str(),
                reason
            )
        }
    }
}

/// The end-of-run summary block.
pub fn format_summary(summary: &RunSummary) -> String {
    let c = &summary.counters;
    let title = match (summary.status, summary.dry_run) {
        (RunStatus::Completed, false) => "Migration complete".green().bold(),
        (RunStatus::Completed, true) => "Dry run complete".cyan().bold(),
        (RunStatus::Cancelled, _) => "Migration cancelled".yellow().bold(),
    };

    let mut lines = vec![
        String::new(),
        title.to_string(),
        format!("  Migrated:        {}", c.migrated.to_string().green()),
        format!("  Skipped:         {}", c.skipped),
        format!("    exists:        {}", c.skipped_exists),
        format!("    rejected:      {}", c.skipped_rejected),
        format!("    errors:        {}", error_count(c.skipped_error)),
        format!("  Keys processed:  {}", summary.processed),
        format!("  Batches:         {}", summary.batches),
        format!("  Duration:        {:.2?}", summary.duration),
    ];
    if summary.dry_run {
        lines.push(format!(
            "  {}",
            "No keys were transferred (dry run)".dimmed()
        ));
    }
    lines.join("\n")
}

fn error_count(n: u64) -> String {
    if n == 0 {
        n.to_string()
    } else {
        n.to_string().red().to_string()
    }
}
