//! Table schema descriptors.
//!
//! A catalog is fixed once the table exists: a later `SYNC_CATALOG` must
//! describe the same table or it is rejected. It is persisted as a small
//! `key=value` text file next to the table's segments.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use itertools::Itertools;

use crate::encoding::row::RowCodec;
use crate::encoding::DataType;
use crate::error::{Error, Result};
use crate::RowId;

pub const CATALOG_FILE: &str = "catalog";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// How the producer ships commits for a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushPolicy {
    /// Every commit is sent as it happens; reads never wait.
    #[default]
    Instant,
    /// Commits are archived locally and sent when a reader needs them or the
    /// producer decides to flush.
    Lazy,
}

impl FromStr for FlushPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "instant" => Ok(FlushPolicy::Instant),
            "lazy" => Ok(FlushPolicy::Lazy),
            other => Err(Error::decode("flush policy", format!("{other:?}"))),
        }
    }
}

impl FlushPolicy {
    fn as_str(&self) -> &'static str {
        match self {
            FlushPolicy::Instant => "instant",
            FlushPolicy::Lazy => "lazy",
        }
    }
}

/// Connection details of the warehouse table rows are materialized into.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WarehouseTarget {
    pub url: String,
    pub user: String,
    pub table: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    pub table: String,
    pub columns: Vec<Column>,
    pub primary_key: Vec<String>,
    pub target: WarehouseTarget,
    pub flush_policy: FlushPolicy,
}

impl Catalog {
    pub fn new(table: impl Into<String>, columns: Vec<Column>) -> Self {
        let table = table.into();
        Self {
            target: WarehouseTarget {
                table: table.clone(),
                ..Default::default()
            },
            table,
            columns,
            primary_key: Vec::new(),
            flush_policy: FlushPolicy::default(),
        }
    }

    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn target(mut self, target: WarehouseTarget) -> Self {
        self.target = target;
        self
    }

    pub fn flush_policy(mut self, policy: FlushPolicy) -> Self {
        self.flush_policy = policy;
        self
    }

    pub fn types(&self) -> Vec<DataType> {
        self.columns.iter().map(|c| c.data_type).collect()
    }

    pub fn codec(&self) -> RowCodec {
        RowCodec::new(self.types())
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidOperation(msg));
        if self.table.is_empty()
            || !self
                .table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return invalid(format!("invalid table name {:?}", self.table));
        }
        if self.columns.is_empty() {
            return invalid(format!("table {} has no columns", self.table));
        }
        if !self.columns.iter().map(|c| &c.name).all_unique() {
            return invalid(format!("table {} has duplicate columns", self.table));
        }
        for key in &self.primary_key {
            if self.column_index(key).is_none() {
                return invalid(format!("primary key column {key} does not exist"));
            }
        }
        Ok(())
    }

    /// Checks that `other` describes the same table as this one.
    pub fn ensure_compatible(&self, other: &Catalog) -> Result<()> {
        if self.columns != other.columns {
            return Err(Error::CatalogMismatch(
                self.table.clone(),
                "column list differs".to_string(),
            ));
        }
        if self.primary_key != other.primary_key {
            return Err(Error::CatalogMismatch(
                self.table.clone(),
                "primary key differs".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let columns = self
            .columns
            .iter()
            .map(|c| format!("{}:{}", c.name, c.data_type))
            .join(",");
        // Writing to a String cannot fail.
        let _ = writeln!(out, "table={}", self.table);
        let _ = writeln!(out, "columns={columns}");
        let _ = writeln!(out, "primary_key={}", self.primary_key.join(","));
        let _ = writeln!(out, "target.url={}", self.target.url);
        let _ = writeln!(out, "target.user={}", self.target.user);
        let _ = writeln!(out, "target.table={}", self.target.table);
        let _ = writeln!(out, "flush_policy={}", self.flush_policy.as_str());
        out
    }

    pub fn from_text(text: &str) -> Result<Self> {
        let mut table = None;
        let mut columns = None;
        let mut primary_key = Vec::new();
        let mut target = WarehouseTarget::default();
        let mut flush_policy = FlushPolicy::default();

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| Error::decode("catalog", format!("malformed line {line:?}")))?;
            match key {
                "table" => table = Some(value.to_string()),
                "columns" => columns = Some(parse_columns(value)?),
                "primary_key" => {
                    primary_key = value
                        .split(',')
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                }
                "target.url" => target.url = value.to_string(),
                "target.user" => target.user = value.to_string(),
                "target.table" => target.table = value.to_string(),
                "flush_policy" => flush_policy = value.parse()?,
                other => tracing::debug!(key = other, "Ignoring unknown catalog key"),
            }
        }

        let catalog = Catalog {
            table: table.ok_or_else(|| Error::decode("catalog", "missing table"))?,
            columns: columns.ok_or_else(|| Error::decode("catalog", "missing columns"))?,
            primary_key,
            target,
            flush_policy,
        };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Writes the catalog file into `dir`, replacing any previous one.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let tmp = dir.join(format!("{CATALOG_FILE}.tmp"));
        fs::write(&tmp, self.to_text())?;
        fs::rename(&tmp, dir.join(CATALOG_FILE))?;
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let text = fs::read_to_string(dir.join(CATALOG_FILE))?;
        Self::from_text(&text)
    }
}

fn parse_columns(value: &str) -> Result<Vec<Column>> {
    value
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (name, ty) = entry
                .split_once(':')
                .ok_or_else(|| Error::decode("catalog column", format!("{entry:?}")))?;
            Ok(Column::new(name, ty.parse()?))
        })
        .collect()
}

/// Per-table monotonic row-ID source. Row IDs start at 1; 0 means "no rows".
#[derive(Debug, Default)]
pub struct RowSequence {
    current: AtomicI64,
}

impl RowSequence {
    pub fn starting_after(current: RowId) -> Self {
        Self {
            current: AtomicI64::new(current),
        }
    }

    pub fn next(&self) -> RowId {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> RowId {
        self.current.load(Ordering::SeqCst)
    }

    /// Moves the sequence back, used when a producer transaction is rolled
    /// back before it reached the server.
    pub fn reset_to(&self, current: RowId) {
        self.current.store(current, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn orders() -> Catalog {
        Catalog::new(
            "orders",
            vec![
                Column::new("id", DataType::Long),
                Column::new("customer", DataType::String),
                Column::new("placed", DataType::Date),
            ],
        )
        .primary_key(&["id"])
        .flush_policy(FlushPolicy::Lazy)
        .target(WarehouseTarget {
            url: "warehouse://localhost:9000".into(),
            user: "loader".into(),
            table: "dw_orders".into(),
        })
    }

    #[test]
    fn test_text_roundtrip() {
        let catalog = orders();
        let parsed = Catalog::from_text(&catalog.to_text()).unwrap();
        assert_eq!(parsed, catalog);
    }

    #[test]
    fn test_save_and_load() -> Result<()> {
        let dir = TempDir::new()?;
        let catalog = orders();
        catalog.save(dir.path())?;
        assert_eq!(Catalog::load(dir.path())?, catalog);
        Ok(())
    }

    #[test]
    fn test_validate_rejects_bad_catalogs() {
        assert!(Catalog::new("bad name", vec![Column::new("a", DataType::Int)])
            .validate()
            .is_err());
        assert!(Catalog::new("t", vec![]).validate().is_err());
        assert!(Catalog::new(
            "t",
            vec![Column::new("a", DataType::Int), Column::new("a", DataType::Long)]
        )
        .validate()
        .is_err());
        assert!(Catalog::new("t", vec![Column::new("a", DataType::Int)])
            .primary_key(&["b"])
            .validate()
            .is_err());
    }

    #[test]
    fn test_compatibility() {
        let a = orders();
        let mut b = orders();
        b.target.url = "elsewhere".into();
        assert!(a.ensure_compatible(&b).is_ok());

        b.columns.pop();
        assert!(matches!(
            a.ensure_compatible(&b),
            Err(Error::CatalogMismatch(..))
        ));
    }

    #[test]
    fn test_row_sequence() {
        let seq = RowSequence::starting_after(10);
        assert_eq!(seq.next(), 11);
        assert_eq!(seq.next(), 12);
        seq.reset_to(11);
        assert_eq!(seq.next(), 12);
    }
}
