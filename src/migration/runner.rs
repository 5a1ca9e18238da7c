//! Migration run loop
//!
//! Alternates between fetching a batch from the [`KeyspaceEnumerator`] and
//! pushing every key of it through the [`TransferCoordinator`]. A batch is
//! fully drained before the next page is requested, so an enumeration
//! failure never leaves per-key work in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::coordinator::TransferCoordinator;
use super::counters::{RunStatus, RunSummary};
use super::enumerator::KeyspaceEnumerator;
use super::outcome::RunMode;
use super::report::{BatchProgress, NullReporter, ReportSink};
use crate::config::{MigrationSettings, DEFAULT_CHUNK_SIZE, DEFAULT_TIMEOUT_MS};
use crate::error::{MigrateError, Result};
use crate::store::{Location, SourceStore, TargetStore};

/// Tunables for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// SCAN COUNT hint
    pub chunk_size: usize,
    /// Bound the source applies to each transfer
    pub transfer_timeout: Duration,
    /// Dry run or live
    pub mode: RunMode,
    /// Concurrent per-key tasks; 1 is sequential
    pub workers: usize,
    /// Optional SCAN MATCH pattern
    pub pattern: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            transfer_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            mode: RunMode::Live,
            workers: 1,
            pattern: None,
        }
    }
}

impl From<&MigrationSettings> for RunOptions {
    fn from(settings: &MigrationSettings) -> Self {
        Self {
            chunk_size: settings.chunk_size,
            transfer_timeout: settings.transfer_timeout(),
            mode: RunMode::from_dry_run(settings.dry_run),
            workers: settings.workers,
            pattern: settings.pattern.clone(),
        }
    }
}

/// One migration run from start of keyspace to terminal cursor.
pub struct MigrationRun {
    source: Arc<dyn SourceStore>,
    coordinator: Arc<TransferCoordinator>,
    reporter: Arc<dyn ReportSink>,
    options: RunOptions,
    shutdown: Option<watch::Receiver<bool>>,
}

impl MigrationRun {
    /// Prepare a run copying from `source` to `target` at `destination`.
    pub fn new(
        source: Arc<dyn SourceStore>,
        target: Arc<dyn TargetStore>,
        destination: &Location,
        options: RunOptions,
    ) -> Self {
        let request = destination.transfer_request(options.transfer_timeout);
        let coordinator = TransferCoordinator::new(source.clone(), target, request, options.mode);
        Self {
            source,
            coordinator: Arc::new(coordinator),
            reporter: Arc::new(NullReporter),
            options,
            shutdown: None,
        }
    }

    /// Send progress to `reporter`
    pub fn with_reporter(mut self, reporter: Arc<dyn ReportSink>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Stop early once `shutdown` holds `true`
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Run to completion or cancellation.
    ///
    /// Only an enumeration failure (or a crashed worker) is an error; every
    /// per-key problem is counted as a skip.
    pub async fn run(self) -> Result<RunSummary> {
        let started = Instant::now();
        let mut enumerator = KeyspaceEnumerator::new(
            self.source.clone(),
            self.options.chunk_size,
            self.options.pattern.clone(),
        );
        info!(
            destination = %self.coordinator.request().destination,
            dry_run = self.options.mode.is_dry_run(),
            chunk_size = self.options.chunk_size,
            workers = self.options.workers,
            "migration started"
        );

        let mut status = RunStatus::Completed;
        loop {
            if self.is_cancelled() {
                status = RunStatus::Cancelled;
                break;
            }
            let Some(batch) = enumerator.next_batch().await? else {
                break;
            };

            self.reporter.batch_started(&BatchProgress {
                batch: enumerator.pages(),
                keys: batch.len(),
                totals: self.coordinator.counters().snapshot(),
            });

            let drained = if self.options.workers > 1 {
                self.process_concurrent(batch).await?
            } else {
                self.process_sequential(batch).await
            };
            if !drained {
                status = RunStatus::Cancelled;
                break;
            }
        }

        let summary = RunSummary::new(
            status,
            self.options.mode.is_dry_run(),
            self.coordinator.counters().snapshot(),
            enumerator.pages(),
            started.elapsed(),
        );
        if status == RunStatus::Cancelled {
            warn!(cursor = %enumerator.cursor(), "migration cancelled");
        }
        info!(
            migrated = summary.migrated(),
            skipped = summary.skipped(),
            batches = summary.batches,
            "migration finished"
        );
        self.reporter.finished(&summary);
        Ok(summary)
    }

    fn is_cancelled(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Returns `false` if cancelled part-way.
    async fn process_sequential(&self, batch: Vec<Bytes>) -> bool {
        for key in batch {
            if self.is_cancelled() {
                return false;
            }
            let outcome = self.coordinator.process(&key).await;
            self.reporter.key_processed(&key, &outcome);
        }
        true
    }

    /// Process a batch with up to `workers` tasks in flight. Waves hold
    /// distinct keys and run one after another, so a key repeated within a
    /// batch is never handled by two tasks at once.
    async fn process_concurrent(&self, batch: Vec<Bytes>) -> Result<bool> {
        for wave in split_into_waves(batch) {
            let mut tasks = JoinSet::new();
            let mut failure = None;
            let mut cancelled = false;

            for key in wave {
                if self.is_cancelled() {
                    cancelled = true;
                    break;
                }
                while tasks.len() >= self.options.workers {
                    if let Some(Err(e)) = tasks.join_next().await {
                        failure.get_or_insert(e);
                    }
                }
                let coordinator = Arc::clone(&self.coordinator);
                let reporter = Arc::clone(&self.reporter);
                tasks.spawn(async move {
                    let outcome = coordinator.process(&key).await;
                    reporter.key_processed(&key, &outcome);
                });
            }

            // In-flight keys always finish before the run moves on or stops.
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    failure.get_or_insert(e);
                }
            }
            if let Some(e) = failure {
                return Err(MigrateError::Worker(e.to_string()));
            }
            if cancelled {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Split a batch into waves of distinct keys, keeping order within each
/// wave. The n-th occurrence of a key lands in wave n.
pub fn split_into_waves(keys: Vec<Bytes>) -> Vec<Vec<Bytes>> {
    let mut seen: HashMap<Bytes, usize> = HashMap::with_capacity(keys.len());
    let mut waves: Vec<Vec<Bytes>> = Vec::new();
    for key in keys {
        let occurrence = seen.entry(key.clone()).or_insert(0);
        let wave = *occurrence;
        *occurrence += 1;
        if waves.len() <= wave {
            waves.push(Vec::new());
        }
        waves[wave].push(key);
    }
    waves
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Endpoint;
    use crate::migration::outcome::TransferOutcome;
    use crate::store::memory::MemoryFaults;
    use crate::store::{MemoryNetwork, MemoryStore};
    use parking_lot::Mutex;
    use std::collections::HashSet;

    struct Fixture {
        _net: Arc<MemoryNetwork>,
        source: Arc<MemoryStore>,
        target: Arc<MemoryStore>,
        destination: Location,
    }

    impl Fixture {
        fn new() -> Self {
            let net = MemoryNetwork::new();
            let destination = Location::new(Endpoint::new("target", 6379), 0);
            Self {
                source: net.store(&Endpoint::new("source", 6379), 0),
                target: net.store(&destination.endpoint, destination.db),
                destination,
                _net: net,
            }
        }

        fn run(&self, options: RunOptions) -> MigrationRun {
            MigrationRun::new(
                self.source.clone(),
                self.target.clone(),
                &self.destination,
                options,
            )
        }
    }

    #[derive(Default)]
    struct Recorder {
        outcomes: Mutex<Vec<(Bytes, TransferOutcome)>>,
        batches: Mutex<Vec<BatchProgress>>,
        summaries: Mutex<Vec<RunSummary>>,
    }

    impl ReportSink for Recorder {
        fn batch_started(&self, progress: &BatchProgress) {
            self.batches.lock().push(*progress);
        }

        fn key_processed(&self, key: &[u8], outcome: &TransferOutcome) {
            self.outcomes
                .lock()
                .push((Bytes::copy_from_slice(key), outcome.clone()));
        }

        fn finished(&self, summary: &RunSummary) {
            self.summaries.lock().push(summary.clone());
        }
    }

    impl Recorder {
        fn outcome_of(&self, key: &str) -> Option<TransferOutcome> {
            self.outcomes
                .lock()
                .iter()
                .find(|(k, _)| k.as_ref() == key.as_bytes())
                .map(|(_, o)| o.clone())
        }
    }

    #[tokio::test]
    async fn test_basic_scenario() {
        let fx = Fixture::new();
        fx.source.set("a", "1");
        fx.source.set("b", "2");
        fx.target.set("b", "9");

        let recorder = Arc::new(Recorder::default());
        let summary = fx
            .run(RunOptions::default())
            .with_reporter(recorder.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!((summary.migrated(), summary.skipped()), (1, 1));
        assert_eq!(
            recorder.outcome_of("a"),
            Some(TransferOutcome::Migrated { simulated: false })
        );
        assert_eq!(recorder.outcome_of("b"), Some(TransferOutcome::SkippedExists));
        assert_eq!(fx.target.get(b"a"), Some(Bytes::from("1")));
        assert_eq!(fx.target.get(b"b"), Some(Bytes::from("9")));
        assert_eq!(fx.source.len(), 2);
        assert_eq!(recorder.summaries.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_key_does_not_stop_run() {
        let fx = Fixture::new();
        for key in ["a", "c", "z"] {
            fx.source.set(key, "v");
        }
        fx.source.set_faults(MemoryFaults {
            failing_transfers: [Bytes::from("c")].into_iter().collect(),
            ..Default::default()
        });

        let recorder = Arc::new(Recorder::default());
        let summary = fx
            .run(RunOptions::default())
            .with_reporter(recorder.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.counters.skipped_error, 1);
        assert_eq!(summary.migrated(), 2);
        assert_eq!(recorder.outcome_of("c").map(|o| o.label()), Some("skipped_error"));
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let fx = Fixture::new();
        for i in 0..20 {
            fx.source.set(format!("k{}", i), "v");
        }
        let options = RunOptions {
            chunk_size: 7,
            ..Default::default()
        };

        let first = fx.run(options.clone()).run().await.unwrap();
        assert_eq!(first.migrated(), 20);
        assert_eq!(first.batches, 3);

        let second = fx.run(options).run().await.unwrap();
        assert_eq!(second.migrated(), 0);
        assert_eq!(second.counters.skipped_exists, 20);
    }

    #[tokio::test]
    async fn test_dry_run_leaves_target_untouched() {
        let fx = Fixture::new();
        fx.source.set("a", "1");
        fx.source.set("b", "2");
        fx.target.set("b", "9");
        let before = fx.target.snapshot();

        let summary = fx
            .run(RunOptions {
                mode: RunMode::DryRun,
                ..Default::default()
            })
            .run()
            .await
            .unwrap();

        assert!(summary.dry_run);
        assert_eq!((summary.migrated(), summary.skipped()), (1, 1));
        assert_eq!(summary.counters.simulated, 1);
        assert_eq!(fx.target.snapshot(), before);
    }

    #[tokio::test]
    async fn test_duplicate_pages_are_counted_per_visit() {
        let fx = Fixture::new();
        for i in 0..6 {
            fx.source.set(format!("k{}", i), "v");
        }
        fx.source.set_faults(MemoryFaults {
            repeat_previous_page: true,
            ..Default::default()
        });

        let recorder = Arc::new(Recorder::default());
        let summary = fx
            .run(RunOptions {
                chunk_size: 2,
                ..Default::default()
            })
            .with_reporter(recorder.clone())
            .run()
            .await
            .unwrap();

        let processed = recorder.outcomes.lock().len() as u64;
        assert_eq!(processed, 10);
        assert_eq!(summary.counters.processed(), processed);
        assert_eq!(summary.migrated(), 6);
        assert_eq!(summary.counters.skipped_exists, 4);
        assert_eq!(fx.target.len(), 6);
    }

    #[tokio::test]
    async fn test_empty_pages_do_not_end_run() {
        let fx = Fixture::new();
        fx.source.set("a", "1");
        fx.source.set_faults(MemoryFaults {
            empty_pages: 2,
            ..Default::default()
        });
        let summary = fx.run(RunOptions::default()).run().await.unwrap();
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.migrated(), 1);
    }

    #[tokio::test]
    async fn test_enumeration_failure_aborts() {
        let fx = Fixture::new();
        for i in 0..10 {
            fx.source.set(format!("k{}", i), "v");
        }
        fx.source.set_faults(MemoryFaults {
            fail_scan_after: Some(2),
            ..Default::default()
        });
        let recorder = Arc::new(Recorder::default());
        let err = fx
            .run(RunOptions {
                chunk_size: 3,
                ..Default::default()
            })
            .with_reporter(recorder.clone())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, MigrateError::Enumeration { .. }));
        // Both fetched batches were fully processed before the abort.
        assert_eq!(recorder.outcomes.lock().len(), 6);
        assert!(recorder.summaries.lock().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_matches_sequential() {
        let fx = Fixture::new();
        for i in 0..50 {
            fx.source.set(format!("k{:02}", i), "v");
        }
        for i in 0..10 {
            fx.target.set(format!("k{:02}", i), "old");
        }
        fx.source.set_faults(MemoryFaults {
            repeat_previous_page: true,
            ..Default::default()
        });

        let summary = fx
            .run(RunOptions {
                chunk_size: 8,
                workers: 4,
                ..Default::default()
            })
            .run()
            .await
            .unwrap();

        assert_eq!(summary.migrated(), 40);
        assert_eq!(fx.target.len(), 50);
        assert_eq!(fx.target.get(b"k00"), Some(Bytes::from("old")));
        assert_eq!(
            summary.counters.processed(),
            summary.migrated() + summary.counters.skipped_exists
        );
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let fx = Fixture::new();
        fx.source.set("a", "1");
        let (tx, rx) = watch::channel(false);
        tx.send_replace(true);

        let summary = fx
            .run(RunOptions::default())
            .with_shutdown(rx)
            .run()
            .await
            .unwrap();
        assert_eq!(summary.status, RunStatus::Cancelled);
        assert_eq!(summary.counters.processed(), 0);
        assert!(fx.target.is_empty());
    }

    struct CancelAfterFirst {
        tx: watch::Sender<bool>,
    }

    impl ReportSink for CancelAfterFirst {
        fn batch_started(&self, _progress: &BatchProgress) {}

        fn key_processed(&self, _key: &[u8], _outcome: &TransferOutcome) {
            self.tx.send_replace(true);
        }

        fn finished(&self, _summary: &RunSummary) {}
    }

    #[tokio::test]
    async fn test_cancel_mid_batch() {
        let fx = Fixture::new();
        for i in 0..5 {
            fx.source.set(format!("k{}", i), "v");
        }
        let (tx, rx) = watch::channel(false);

        let summary = fx
            .run(RunOptions::default())
            .with_reporter(Arc::new(CancelAfterFirst { tx }))
            .with_shutdown(rx)
            .run()
            .await
            .unwrap();
        assert_eq!(summary.status, RunStatus::Cancelled);
        assert_eq!(summary.counters.processed(), 1);
        assert_eq!(fx.target.len(), 1);
    }

    #[test]
    fn test_split_into_waves() {
        let keys: Vec<Bytes> = ["a", "b", "a", "c", "a", "b"]
            .iter()
            .map(|k| Bytes::from(*k))
            .collect();
        let waves = split_into_waves(keys);
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0], vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]);
        assert_eq!(waves[1], vec![Bytes::from("a"), Bytes::from("b")]);
        assert_eq!(waves[2], vec![Bytes::from("a")]);
        for wave in &waves {
            let distinct: HashSet<_> = wave.iter().collect();
            assert_eq!(distinct.len(), wave.len());
        }
    }

    #[test]
    fn test_options_from_settings() {
        let settings = MigrationSettings {
            dry_run: true,
            workers: 3,
            ..Default::default()
        };
        let options = RunOptions::from(&settings);
        assert_eq!(options.mode, RunMode::DryRun);
        assert_eq!(options.workers, 3);
        assert_eq!(options.transfer_timeout, Duration::from_millis(5000));
    }
}
