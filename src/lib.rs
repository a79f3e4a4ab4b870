//! snowdrift: mirrors time-partitioned object-store files into a relational
//! warehouse.
//!
//! The engine periodically discovers new data files against an idempotency
//! ledger, keeps emulated time-bucket partitions and their union views in
//! step with upstream DDL, and bulk-loads each chunk of work in a single
//! warehouse transaction so partial failures are always safe to retry.
//!
//! # Example
//!
//! ```ignore
//! use snowdrift::{Config, LoadOrchestrator};
//! use snowdrift::notify::LogNotifier;
//! use snowdrift::storage::StorageProvider;
//! use snowdrift::warehouse::PostgresWarehouse;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), snowdrift::error::SyncError> {
//! let config = Arc::new(Config::from_file("config.yaml")?);
//! let storage = Arc::new(StorageProvider::for_url(&config.storage.url)?);
//! let warehouse = Arc::new(
//!     PostgresWarehouse::connect(&config.warehouse.connection, config.warehouse.dialect).await?,
//! );
//! let orchestrator =
//!     LoadOrchestrator::new(config, storage, warehouse, Arc::new(LogNotifier));
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod ledger;
pub mod load;
pub mod metrics;
pub mod notify;
pub mod partition;
pub mod scheduler;
pub mod schema;
pub mod signal;
pub mod storage;
pub mod time;
pub mod warehouse;

// Re-export main types
pub use config::Config;
pub use load::{LoadOrchestrator, LoadStats};
pub use scheduler::SyncScheduler;
pub use storage::{StorageProvider, StorageProviderRef};
