//! The permanent store rows are materialized into.
//!
//! The tuple store only needs three things from a warehouse: load a batch of
//! delimited rows, replay an update/delete against rows it already holds,
//! and remember which row IDs it has received so consumers can split a read
//! between the warehouse and the staging server.

mod file;
mod memory;

pub use file::FileWarehouse;
pub use memory::MemoryWarehouse;

use crate::catalog::Catalog;
use crate::error::Result;
use crate::store::ud::UdStatement;
use crate::RowId;

pub trait Warehouse: Send + Sync {
    /// Appends `data`, a buffer of delimited rows, to the table's target.
    /// Returns the number of rows loaded.
    fn bulk_load(&self, catalog: &Catalog, data: &[u8]) -> Result<usize>;

    /// Applies `statement` to warehouse rows with ID `<= through_row`.
    /// Returns the number of rows affected.
    fn apply_ud(&self, catalog: &Catalog, statement: &UdStatement, through_row: RowId)
        -> Result<usize>;

    /// Records that rows `min_row..=max_row` of `table` are now in the
    /// warehouse.
    fn record_materialized(&self, table: &str, min_row: RowId, max_row: RowId) -> Result<()>;

    /// The lowest and highest row ID materialized into `table`.
    fn row_bounds(&self, table: &str) -> Result<Option<(RowId, RowId)>>;
}

/// Widens `bounds` to include `min..=max`.
fn widen(bounds: Option<(RowId, RowId)>, min: RowId, max: RowId) -> (RowId, RowId) {
    match bounds {
        Some((lo, hi)) => (lo.min(min), hi.max(max)),
        None => (min, max),
    }
}
