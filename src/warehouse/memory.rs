use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{widen, Warehouse};
use crate::catalog::Catalog;
use crate::encoding::{delimited, Value};
use crate::error::{Error, Result};
use crate::store::ud::{UdKind, UdStatement};
use crate::RowId;

#[derive(Debug, Default)]
struct Table {
    rows: BTreeMap<RowId, Vec<Value>>,
    bounds: Option<(RowId, RowId)>,
}

/// An in-process warehouse holding decoded rows per target table.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    tables: Mutex<HashMap<String, Table>>,
    fail_loads: AtomicBool,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following bulk load fail, to exercise error paths.
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn rows(&self, table: &str) -> Vec<(RowId, Vec<Value>)> {
        self.lock()
            .map(|tables| {
                tables
                    .get(table)
                    .map(|t| t.rows.iter().map(|(&id, v)| (id, v.clone())).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Table>>> {
        self.tables
            .lock()
            .map_err(|_| Error::Warehouse("warehouse mutex poisoned".to_string()))
    }
}

impl Warehouse for MemoryWarehouse {
    fn bulk_load(&self, catalog: &Catalog, data: &[u8]) -> Result<usize> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(Error::Warehouse(format!(
                "bulk load into {} rejected",
                catalog.target.table
            )));
        }
        let text = std::str::from_utf8(data)
            .map_err(|e| Error::Warehouse(format!("bulk load is not UTF-8: {e}")))?;
        let types = catalog.types();
        let rows = text
            .lines()
            .map(|line| delimited::parse_row(line, &types))
            .collect::<Result<Vec<_>>>()?;

        let count = rows.len();
        let mut tables = self.lock()?;
        let table = tables.entry(catalog.target.table.clone()).or_default();
        for (values, row_id) in rows {
            table.rows.insert(row_id, values);
        }
        Ok(count)
    }

    fn apply_ud(
        &self,
        catalog: &Catalog,
        statement: &UdStatement,
        through_row: RowId,
    ) -> Result<usize> {
        let mut tables = self.lock()?;
        let Some(table) = tables.get_mut(&catalog.target.table) else {
            return Ok(0);
        };
        let matching: Vec<RowId> = table
            .rows
            .range(..=through_row)
            .filter(|(_, values)| statement.matches(values))
            .map(|(&id, _)| id)
            .collect();
        for id in &matching {
            match statement.kind {
                UdKind::Delete => {
                    table.rows.remove(id);
                }
                UdKind::Update => {
                    if let Some(values) = table.rows.get_mut(id) {
                        for a in &statement.assignments {
                            values[a.column] = a.value.clone();
                        }
                    }
                }
            }
        }
        Ok(matching.len())
    }

    fn record_materialized(&self, table: &str, min_row: RowId, max_row: RowId) -> Result<()> {
        let mut tables = self.lock()?;
        let entry = tables.entry(table.to_string()).or_default();
        entry.bounds = Some(widen(entry.bounds, min_row, max_row));
        Ok(())
    }

    fn row_bounds(&self, table: &str) -> Result<Option<(RowId, RowId)>> {
        Ok(self.lock()?.get(table).and_then(|t| t.bounds))
    }
}
