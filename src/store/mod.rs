//! File-based staging store.
//!
//! Each table lives in its own directory under the data dir:
//!
//! ```text
//! <data>/<table>/
//!   catalog            column list, primary key, warehouse target
//!   seg<N>.dat         segments; all sealed except the open one
//!   tmp/               checkpoint being written
//!   finalized/         last durable checkpoint
//! ```
//!
//! Rows arrive in commit batches and are appended to the open segment.
//! Segments that fill up are sealed and become immutable. The in-memory
//! indexes over segments, commit times and update/delete statements are
//! double-buffered ([`rwmap`]): a batch mutates write copies and publishes
//! them all at once, then a checkpoint is written. A failed batch reloads
//! the last checkpoint.

pub mod accuracy;
pub mod checkpoint;
pub mod counter;
mod flush;
mod materialize;
pub mod metrics;
mod query;
mod recovery;
pub mod rwmap;
pub mod segment;
mod shrink;
pub mod state;
pub mod tuple_store;
pub mod ud;

pub use accuracy::{Locker, PingServer};
pub use metrics::TableMetrics;
pub use state::Snapshot;
pub use tuple_store::FileBasedTupleStore;
pub use ud::{CompareOp, ParsedStatement, UdKind, UdStatement};
