//! # keyshift
//!
//! One-directional, non-destructive bulk key migration between two
//! Redis-protocol stores.
//!
//! keyshift pages through the source keyspace with `SCAN`, checks each key
//! on the target with `EXISTS`, and asks the source to push missing keys
//! with `MIGRATE ... COPY`. Keys that already exist on the target are never
//! overwritten and nothing is ever deleted from the source, so a run can be
//! repeated safely.
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`protocol`] | RESP2 frame codec |
//! | [`client`] | Async RESP connection with timeouts and reconnect |
//! | [`store`] | Source/target store traits, Redis and in-memory implementations |
//! | [`migration`] | Enumerator, coordinator, run loop and reporting |
//! | [`config`] | TOML configuration |
//! | [`error`] | Error types |

pub mod client;
pub mod config;
pub mod error;
pub mod migration;
pub mod protocol;
pub mod store;

pub use config::Config;
pub use error::{MigrateError, Result};
pub use migration::{MigrationRun, RunOptions, RunStatus, RunSummary, TransferOutcome};
