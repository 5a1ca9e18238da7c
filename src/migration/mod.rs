//! Migration engine
//!
//! Copies every key of a source store that the target does not hold yet,
//! never overwriting and never deleting.
//!
//! - [`KeyspaceEnumerator`] pages through the source by cursor.
//! - [`TransferCoordinator`] decides and performs the per-key copy.
//! - [`MigrationRun`] drives both and produces a [`RunSummary`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use keyshift::config::Config;
//! use keyshift::migration::{connect_stores, ConsoleReporter, MigrationRun, RunOptions};
//!
//! let config = Config::from_file("keyshift.toml".as_ref())?;
//! let (source, target) = connect_stores(&config).await?;
//! let summary = MigrationRun::new(
//!     source,
//!     target,
//!     &config.target_location(),
//!     RunOptions::from(&config.migration),
//! )
//! .with_reporter(Arc::new(ConsoleReporter::stdout(false)))
//! .run()
//! .await?;
//! println!("migrated {}", summary.migrated());
//! ```

pub mod coordinator;
pub mod counters;
pub mod enumerator;
pub mod outcome;
pub mod report;
pub mod runner;

pub use coordinator::TransferCoordinator;
pub use counters::{CounterSnapshot, RunCounters, RunStatus, RunSummary};
pub use enumerator::KeyspaceEnumerator;
pub use outcome::{
    classify_transfer, decide_after_check, Decision, FailedStep, RunMode, TransferOutcome,
};
pub use report::{BatchProgress, ConsoleReporter, NullReporter, ReportSink};
pub use runner::{split_into_waves, MigrationRun, RunOptions};

use std::sync::Arc;

use crate::config::Config;
use crate::error::{MigrateError, Result};
use crate::store::{RedisSource, RedisTarget};

/// Open and verify both store handles.
///
/// Each side gets one connection per worker. Any failure here is fatal and
/// happens before a single key is touched.
pub async fn connect_stores(config: &Config) -> Result<(Arc<RedisSource>, Arc<RedisTarget>)> {
    let workers = config.migration.workers.max(1);

    let source = RedisSource::connect(config.source_connect_options(), workers)
        .await
        .map_err(|source| MigrateError::Setup {
            role: "source",
            source,
        })?;
    let target = RedisTarget::connect(config.target_connect_options(), workers)
        .await
        .map_err(|source| MigrateError::Setup {
            role: "target",
            source,
        })?;

    Ok((Arc::new(source), Arc::new(target)))
}
