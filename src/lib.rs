pub mod catalog;
pub mod client;
pub mod config;
pub mod encoding;
pub mod error;
pub mod flock;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod warehouse;

/// Producer-assigned, strictly increasing row identifier.
pub type RowId = i64;

pub type SegmentId = u64;

/// Commit time in the producer's clock.
pub type Timestamp = i64;

pub use catalog::{Catalog, Column, FlushPolicy, WarehouseTarget};
pub use client::{AccuracyPoller, Consumer, Producer};
pub use config::{ProducerConfig, SchedulerConfig, ServerConfig, StoreConfig};
pub use error::{Error, Result};
pub use server::Server;
pub use store::FileBasedTupleStore;
