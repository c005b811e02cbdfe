//! Deferred update/delete overlay.
//!
//! Update and delete statements never touch stored row bytes. They are kept
//! in an ordered log and applied while rows stream out of the segments: a
//! statement affects a row when the row was committed before the statement
//! arrived (`row_id <= row_cutoff`) and the row satisfies its predicate.
//! Statements apply in arrival order, so a later update sees the values an
//! earlier one produced.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::rwmap::ReadWriteMap;
use crate::catalog::Catalog;
use crate::encoding::row::{decode_value, encode_value, RowCodec};
use crate::encoding::{read_string, write_string, DataType, Value};
use crate::error::{Error, Result};
use crate::{RowId, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdKind {
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn code(&self) -> u8 {
        match self {
            CompareOp::Eq => 0,
            CompareOp::Ne => 1,
            CompareOp::Lt => 2,
            CompareOp::Le => 3,
            CompareOp::Gt => 4,
            CompareOp::Ge => 5,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => CompareOp::Eq,
            1 => CompareOp::Ne,
            2 => CompareOp::Lt,
            3 => CompareOp::Le,
            4 => CompareOp::Gt,
            5 => CompareOp::Ge,
            other => return Err(Error::decode("predicate operator", format!("{other}"))),
        })
    }
}

/// `column <op> value`. Comparisons with null never match.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub column: usize,
    pub op: CompareOp,
    pub value: Value,
}

impl Predicate {
    pub fn matches(&self, row: &[Value]) -> bool {
        use std::cmp::Ordering::*;
        let Some(ordering) = row.get(self.column).and_then(|v| v.compare(&self.value)) else {
            return false;
        };
        match self.op {
            CompareOp::Eq => ordering == Equal,
            CompareOp::Ne => ordering != Equal,
            CompareOp::Lt => ordering == Less,
            CompareOp::Le => ordering != Greater,
            CompareOp::Gt => ordering == Greater,
            CompareOp::Ge => ordering != Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: usize,
    pub value: Value,
}

/// A resolved update or delete statement, as shipped by the producer.
#[derive(Debug, Clone, PartialEq)]
pub struct UdStatement {
    pub kind: UdKind,
    pub id: i32,
    pub sql: String,
    pub assignments: Vec<Assignment>,
    pub predicate: Option<Predicate>,
}

impl UdStatement {
    pub fn update(id: i32, sql: impl Into<String>) -> Self {
        Self {
            kind: UdKind::Update,
            id,
            sql: sql.into(),
            assignments: Vec::new(),
            predicate: None,
        }
    }

    pub fn delete(id: i32, sql: impl Into<String>) -> Self {
        Self {
            kind: UdKind::Delete,
            ..Self::update(id, sql)
        }
    }

    pub fn set(mut self, column: usize, value: Value) -> Self {
        self.assignments.push(Assignment { column, value });
        self
    }

    pub fn filter(mut self, column: usize, op: CompareOp, value: Value) -> Self {
        self.predicate = Some(Predicate { column, op, value });
        self
    }

    pub fn matches(&self, row: &[Value]) -> bool {
        self.predicate.as_ref().map_or(true, |p| p.matches(row))
    }

    /// Checks column references and value types against the table.
    pub fn validate(&self, types: &[DataType]) -> Result<()> {
        let check = |column: usize, value: &Value, what: &'static str| -> Result<()> {
            let ty = types.get(column).ok_or_else(|| {
                Error::decode(what, format!("column {column} out of range"))
            })?;
            if !value.fits(*ty) {
                return Err(Error::decode(what, format!("{value:?} is not a {ty}")));
            }
            Ok(())
        };
        for a in &self.assignments {
            check(a.column, &a.value, "assignment")?;
        }
        if let Some(p) = &self.predicate {
            check(p.column, &p.value, "predicate")?;
        }
        match self.kind {
            UdKind::Update if self.assignments.is_empty() => {
                Err(Error::decode("update", "no assignments"))
            }
            UdKind::Delete if !self.assignments.is_empty() => {
                Err(Error::decode("delete", "unexpected assignments"))
            }
            _ => Ok(()),
        }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>, types: &[DataType]) -> Result<()> {
        self.validate(types)
            .map_err(|e| Error::Encode("ud statement", e.to_string()))?;
        buf.push(match self.kind {
            UdKind::Update => 0,
            UdKind::Delete => 1,
        });
        buf.write_i32::<BigEndian>(self.id)?;
        write_string(buf, &self.sql);
        buf.write_i32::<BigEndian>(self.assignments.len() as i32)?;
        for a in &self.assignments {
            buf.write_i32::<BigEndian>(a.column as i32)?;
            encode_value(buf, types[a.column], &a.value)?;
        }
        match &self.predicate {
            None => buf.push(0),
            Some(p) => {
                buf.push(1);
                buf.write_i32::<BigEndian>(p.column as i32)?;
                buf.push(p.op.code());
                encode_value(buf, types[p.column], &p.value)?;
            }
        }
        Ok(())
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>, types: &[DataType]) -> Result<Self> {
        let eof = |e: std::io::Error| Error::decode("ud statement", e.to_string());
        let kind = match cursor.read_u8().map_err(eof)? {
            0 => UdKind::Update,
            1 => UdKind::Delete,
            other => return Err(Error::decode("ud kind", format!("{other}"))),
        };
        let id = cursor.read_i32::<BigEndian>().map_err(eof)?;
        let sql = read_string(cursor)?;

        let column = |cursor: &mut Cursor<&[u8]>| -> Result<usize> {
            let col = cursor.read_i32::<BigEndian>().map_err(eof)?;
            usize::try_from(col)
                .ok()
                .filter(|&c| c < types.len())
                .ok_or_else(|| Error::decode("ud column", format!("{col} out of range")))
        };

        let count = cursor.read_i32::<BigEndian>().map_err(eof)?;
        if count < 0 || count as usize > types.len() * 4 + 16 {
            return Err(Error::decode("ud assignments", format!("bad count {count}")));
        }
        let mut assignments = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let col = column(cursor)?;
            let value = decode_value(cursor, types[col])?;
            assignments.push(Assignment { column: col, value });
        }

        let predicate = match cursor.read_u8().map_err(eof)? {
            0 => None,
            1 => {
                let col = column(cursor)?;
                let op = CompareOp::from_code(cursor.read_u8().map_err(eof)?)?;
                let value = decode_value(cursor, types[col])?;
                Some(Predicate {
                    column: col,
                    op,
                    value,
                })
            }
            other => return Err(Error::decode("ud predicate flag", format!("{other}"))),
        };

        let statement = Self {
            kind,
            id,
            sql,
            assignments,
            predicate,
        };
        statement.validate(types)?;
        Ok(statement)
    }
}

/// A statement as produced by the SQL front end: column names instead of
/// positions.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedStatement {
    pub table: String,
    pub kind: UdKind,
    pub sql: String,
    pub bindings: Vec<(String, Value)>,
    pub predicate: Option<(String, CompareOp, Value)>,
}

impl ParsedStatement {
    pub fn resolve(&self, id: i32, catalog: &Catalog) -> Result<UdStatement> {
        if self.table != catalog.table {
            return Err(Error::InvalidOperation(format!(
                "statement targets {} but catalog is {}",
                self.table, catalog.table
            )));
        }
        let index = |name: &str| {
            catalog.column_index(name).ok_or_else(|| {
                Error::InvalidOperation(format!("unknown column {name} in {}", catalog.table))
            })
        };
        let mut statement = match self.kind {
            UdKind::Update => UdStatement::update(id, &self.sql),
            UdKind::Delete => UdStatement::delete(id, &self.sql),
        };
        for (name, value) in &self.bindings {
            statement = statement.set(index(name)?, value.clone());
        }
        if let Some((name, op, value)) = &self.predicate {
            statement = statement.filter(index(name)?, *op, value.clone());
        }
        statement.validate(&catalog.types())?;
        Ok(statement)
    }
}

/// A statement in the server-side log.
#[derive(Debug, Clone, PartialEq)]
pub struct UdEntry {
    pub statement: UdStatement,
    pub commit_time: Timestamp,
    /// Highest row ID committed when the statement arrived.
    pub row_cutoff: RowId,
    /// Low-water mark when the statement arrived: rows up to here were
    /// already in the warehouse and must be changed there.
    pub warehouse_bound: RowId,
    pub warehouse_applied: bool,
}

impl UdEntry {
    pub fn applies_to(&self, row_id: RowId) -> bool {
        row_id <= self.row_cutoff
    }

    pub fn needs_warehouse(&self) -> bool {
        self.warehouse_bound > 0 && !self.warehouse_applied
    }
}

pub type UdSeq = u64;

/// The ordered log of pending update/delete statements of one table.
#[derive(Default)]
pub struct UdStore {
    log: ReadWriteMap<UdSeq, Arc<UdEntry>>,
}

impl UdStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> &ReadWriteMap<UdSeq, Arc<UdEntry>> {
        &self.log
    }

    pub fn snapshot(&self) -> Arc<BTreeMap<UdSeq, Arc<UdEntry>>> {
        self.log.snapshot()
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Appends to the write copy. Must run inside a flush.
    pub fn append(&self, seq: UdSeq, entry: UdEntry) -> Result<()> {
        self.log.insert(seq, Arc::new(entry))?;
        Ok(())
    }

    /// Marks the entries pushed to the warehouse and drops every entry that
    /// can no longer affect a staged row. Must run inside a flush.
    pub fn settle(&self, applied: &[UdSeq], last_mat_row: RowId) -> Result<usize> {
        self.log.write(|log| {
            for seq in applied {
                if let Some(entry) = log.get_mut(seq) {
                    let mut updated = (**entry).clone();
                    updated.warehouse_applied = true;
                    *entry = Arc::new(updated);
                }
            }
            let before = log.len();
            log.retain(|_, e| !(e.row_cutoff <= last_mat_row && !e.needs_warehouse()));
            before - log.len()
        })
    }
}

/// The statements visible to one read, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct UdOverlay {
    entries: Vec<Arc<UdEntry>>,
    max_cutoff: RowId,
}

impl UdOverlay {
    /// Statements committed at or before `bound`; all of them when `bound`
    /// is `None`.
    pub fn new(log: &BTreeMap<UdSeq, Arc<UdEntry>>, bound: Option<Timestamp>) -> Self {
        let entries: Vec<_> = log
            .values()
            .filter(|e| bound.map_or(true, |b| e.commit_time <= b))
            .cloned()
            .collect();
        let max_cutoff = entries.iter().map(|e| e.row_cutoff).max().unwrap_or(0);
        Self {
            entries,
            max_cutoff,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Applies the overlay to one decoded row. Returns `false` when the row
    /// is deleted.
    pub fn apply(&self, values: &mut [Value], row_id: RowId) -> bool {
        for entry in self.entries.iter().filter(|e| e.applies_to(row_id)) {
            let statement = &entry.statement;
            if !statement.matches(values) {
                continue;
            }
            match statement.kind {
                UdKind::Delete => return false,
                UdKind::Update => {
                    for a in &statement.assignments {
                        values[a.column] = a.value.clone();
                    }
                }
            }
        }
        true
    }

    /// Streams encoded rows through the overlay into `dest`. Rows no
    /// statement can touch are copied without decoding.
    pub fn transform(&self, codec: &RowCodec, bytes: &[u8], dest: &mut Vec<u8>) -> Result<()> {
        for row in codec.rows(bytes) {
            let row = row?;
            if row.row_id > self.max_cutoff {
                dest.extend_from_slice(row.bytes);
                continue;
            }
            let (mut values, row_id, _) = codec.decode(row.bytes)?;
            if self.apply(&mut values, row_id) {
                codec.encode_into(dest, &values, row_id)?;
            }
        }
        Ok(())
    }

    /// Like [`UdOverlay::transform`], handing each surviving row to `f`
    /// decoded.
    pub fn for_each_row(
        &self,
        codec: &RowCodec,
        bytes: &[u8],
        mut f: impl FnMut(&[Value], RowId),
    ) -> Result<()> {
        for row in codec.rows(bytes) {
            let (mut values, row_id, _) = codec.decode(row?.bytes)?;
            if self.apply(&mut values, row_id) {
                f(&values, row_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Column;
    use crate::store::rwmap::FlushCoordinator;

    fn catalog() -> Catalog {
        Catalog::new(
            "items",
            vec![
                Column::new("name", DataType::String),
                Column::new("qty", DataType::Int),
            ],
        )
    }

    fn entry(statement: UdStatement, commit_time: Timestamp, row_cutoff: RowId) -> Arc<UdEntry> {
        Arc::new(UdEntry {
            statement,
            commit_time,
            row_cutoff,
            warehouse_bound: 0,
            warehouse_applied: false,
        })
    }

    fn rows(codec: &RowCodec, data: &[(&str, i32)]) -> Vec<u8> {
        let mut buf = Vec::new();
        for (i, (name, qty)) in data.iter().enumerate() {
            codec
                .encode_into(
                    &mut buf,
                    &[Value::Str(name.to_string()), Value::Int(*qty)],
                    i as RowId + 1,
                )
                .unwrap();
        }
        buf
    }

    fn decode_all(codec: &RowCodec, bytes: &[u8]) -> Vec<(Vec<Value>, RowId)> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let (values, id, n) = codec.decode(&bytes[pos..]).unwrap();
            out.push((values, id));
            pos += n;
        }
        out
    }

    #[test]
    fn test_predicate_ops() {
        let row = [Value::Str("a".into()), Value::Int(5)];
        let p = |op, v| Predicate {
            column: 1,
            op,
            value: Value::Int(v),
        };
        assert!(p(CompareOp::Eq, 5).matches(&row));
        assert!(p(CompareOp::Ne, 4).matches(&row));
        assert!(p(CompareOp::Lt, 6).matches(&row));
        assert!(p(CompareOp::Le, 5).matches(&row));
        assert!(p(CompareOp::Gt, 4).matches(&row));
        assert!(!p(CompareOp::Ge, 6).matches(&row));

        let null_row = [Value::Null, Value::Null];
        assert!(!p(CompareOp::Ne, 4).matches(&null_row));
    }

    #[test]
    fn test_statement_encoding() {
        let types = catalog().types();
        let statement = UdStatement::update(3, "UPDATE items SET qty = 0 WHERE name = 'b'")
            .set(1, Value::Int(0))
            .filter(0, CompareOp::Eq, Value::Str("b".into()));
        let mut buf = Vec::new();
        statement.encode_into(&mut buf, &types).unwrap();

        let decoded = UdStatement::decode(&mut Cursor::new(buf.as_slice()), &types).unwrap();
        assert_eq!(decoded, statement);
    }

    #[test]
    fn test_decode_rejects_bad_column() {
        let types = catalog().types();
        let mut buf = Vec::new();
        UdStatement::delete(1, "DELETE FROM items")
            .encode_into(&mut buf, &types)
            .unwrap();
        // Swap in a predicate pointing at column 9.
        buf.pop();
        buf.push(1);
        buf.extend_from_slice(&9i32.to_be_bytes());
        buf.push(0);
        buf.push(1);
        assert!(UdStatement::decode(&mut Cursor::new(buf.as_slice()), &types).is_err());
    }

    #[test]
    fn test_resolve_parsed_statement() {
        let parsed = ParsedStatement {
            table: "items".into(),
            kind: UdKind::Update,
            sql: "UPDATE items SET qty = 1 WHERE name = 'x'".into(),
            bindings: vec![("qty".into(), Value::Int(1))],
            predicate: Some(("name".into(), CompareOp::Eq, Value::Str("x".into()))),
        };
        let statement = parsed.resolve(7, &catalog()).unwrap();
        assert_eq!(statement.assignments[0].column, 1);
        assert_eq!(statement.predicate.unwrap().column, 0);

        let mut bad = parsed.clone();
        bad.bindings[0].0 = "missing".into();
        assert!(bad.resolve(7, &catalog()).is_err());
    }

    #[test]
    fn test_overlay_transform() {
        let codec = catalog().codec();
        let data = rows(&codec, &[("a", 1), ("b", 2), ("c", 3), ("d", 4)]);

        let mut log = BTreeMap::new();
        log.insert(
            1,
            entry(
                UdStatement::update(1, "")
                    .set(1, Value::Int(20))
                    .filter(0, CompareOp::Eq, Value::Str("b".into())),
                100,
                4,
            ),
        );
        log.insert(
            2,
            entry(
                UdStatement::delete(2, "").filter(1, CompareOp::Ge, Value::Int(3)),
                200,
                2,
            ),
        );

        let overlay = UdOverlay::new(&log, None);
        let mut out = Vec::new();
        overlay.transform(&codec, &data, &mut out).unwrap();
        let result = decode_all(&codec, &out);

        // Row 2 was updated to 20 and then deleted by the second statement;
        // row 3 is past the delete's cutoff and survives.
        let ids: Vec<RowId> = result.iter().map(|(_, id)| *id).collect();
        assert_eq!(ids, vec![1, 3, 4]);

        // Reading as of time 150 only sees the update.
        let overlay = UdOverlay::new(&log, Some(150));
        let mut out = Vec::new();
        overlay.transform(&codec, &data, &mut out).unwrap();
        let result = decode_all(&codec, &out);
        assert_eq!(result.len(), 4);
        assert_eq!(result[1].0[1], Value::Int(20));
    }

    #[test]
    fn test_empty_overlay_copies_bytes() {
        let codec = catalog().codec();
        let data = rows(&codec, &[("a", 1), ("b", 2)]);
        let mut out = Vec::new();
        UdOverlay::default().transform(&codec, &data, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_settle_prunes_materialized_entries() -> Result<()> {
        let store = UdStore::new();
        let coordinator = FlushCoordinator::new();
        let flush = coordinator.begin(&[store.log()])?;
        let mut pending = (*entry(UdStatement::delete(1, ""), 10, 5)).clone();
        pending.warehouse_bound = 3;
        store.append(1, pending)?;
        store.append(2, (*entry(UdStatement::delete(2, ""), 20, 8)).clone())?;
        flush.commit()?;

        // Nothing materialized past 5 yet and entry 1 still owes the warehouse.
        let flush = coordinator.begin(&[store.log()])?;
        assert_eq!(store.settle(&[], 5)?, 0);
        flush.commit()?;

        let flush = coordinator.begin(&[store.log()])?;
        assert_eq!(store.settle(&[1], 5)?, 1);
        flush.commit()?;
        assert_eq!(store.snapshot().keys().copied().collect::<Vec<_>>(), vec![2]);
        Ok(())
    }
}
