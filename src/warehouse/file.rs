use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::{widen, Warehouse};
use crate::catalog::Catalog;
use crate::encoding::{delimited, DataType};
use crate::error::{Error, Result};
use crate::store::ud::{UdKind, UdStatement};
use crate::RowId;

/// A warehouse that keeps each target table as a delimited text file
/// `<dir>/<table>.tbl`, with its row bounds in `<dir>/<table>.bounds`.
///
/// Loads are append-only by row ID: rows at or below the highest ID a
/// table file already holds are skipped.
pub struct FileWarehouse {
    dir: PathBuf,
    // Highest loaded row per table; the mutex also serializes rewrites.
    loaded: Mutex<HashMap<String, RowId>>,
}

impl FileWarehouse {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            loaded: Mutex::new(HashMap::new()),
        })
    }

    pub fn table_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{table}.tbl"))
    }

    fn bounds_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{table}.bounds"))
    }

    fn guard(&self) -> Result<MutexGuard<'_, HashMap<String, RowId>>> {
        self.loaded
            .lock()
            .map_err(|_| Error::Warehouse("warehouse mutex poisoned".to_string()))
    }
}

/// Highest row ID in a table file, 0 when there is none.
fn max_row_in(path: &Path, types: &[DataType]) -> Result<RowId> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    text.lines().try_fold(0, |max, line| {
        let (_, row_id) = delimited::parse_row(line, types)?;
        Ok(max.max(row_id))
    })
}

fn replace_file(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

impl Warehouse for FileWarehouse {
    fn bulk_load(&self, catalog: &Catalog, data: &[u8]) -> Result<usize> {
        let mut loaded = self.guard()?;
        let table = &catalog.target.table;
        let path = self.table_path(table);
        let types = catalog.types();
        let through = match loaded.get(table) {
            Some(&through) => through,
            None => max_row_in(&path, &types)?,
        };

        let text = std::str::from_utf8(data)
            .map_err(|e| Error::Warehouse(format!("bulk load is not UTF-8: {e}")))?;
        let mut out = Vec::with_capacity(data.len());
        let mut max = through;
        let mut count = 0;
        let mut skipped = 0;
        for line in text.lines() {
            let (_, row_id) = delimited::parse_row(line, &types)?;
            if row_id <= through {
                skipped += 1;
                continue;
            }
            out.extend_from_slice(line.as_bytes());
            out.push(delimited::ROW_DELIMITER);
            max = max.max(row_id);
            count += 1;
        }
        if skipped > 0 {
            tracing::debug!(table = %table, through, skipped, "Skipped rows already loaded");
        }

        if !out.is_empty() {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(&out)?;
            file.sync_all()?;
        }
        loaded.insert(table.clone(), max);
        Ok(count)
    }

    fn apply_ud(
        &self,
        catalog: &Catalog,
        statement: &UdStatement,
        through_row: RowId,
    ) -> Result<usize> {
        let _guard = self.guard()?;
        let path = self.table_path(&catalog.target.table);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let types = catalog.types();
        let mut out = Vec::with_capacity(text.len());
        let mut affected = 0;
        for line in text.lines() {
            let (mut values, row_id) = delimited::parse_row(line, &types)?;
            if row_id <= through_row && statement.matches(&values) {
                affected += 1;
                match statement.kind {
                    UdKind::Delete => continue,
                    UdKind::Update => {
                        for a in &statement.assignments {
                            values[a.column] = a.value.clone();
                        }
                    }
                }
            }
            delimited::write_row(&mut out, &values, row_id);
        }
        if affected > 0 {
            replace_file(&path, &out)?;
        }
        Ok(affected)
    }

    fn record_materialized(&self, table: &str, min_row: RowId, max_row: RowId) -> Result<()> {
        let bounds = widen(self.row_bounds(table)?, min_row, max_row);
        let _guard = self.guard()?;
        replace_file(
            &self.bounds_path(table),
            format!("{} {}\n", bounds.0, bounds.1).as_bytes(),
        )
    }

    fn row_bounds(&self, table: &str) -> Result<Option<(RowId, RowId)>> {
        let text = match fs::read_to_string(self.bounds_path(table)) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let parse = |s: Option<&str>| -> Result<RowId> {
            s.and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::Corrupted("warehouse bounds", text.trim().to_string()))
        };
        let mut parts = text.split_whitespace();
        Ok(Some((parse(parts.next())?, parse(parts.next())?)))
    }
}
