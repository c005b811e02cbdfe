use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::Client;
use crate::catalog::{Catalog, FlushPolicy, RowSequence};
use crate::config::ProducerConfig;
use crate::encoding::row::RowCodec;
use crate::encoding::Value;
use crate::error::{Error, Result};
use crate::store::ParsedStatement;
use crate::{RowId, Timestamp};

/// A commit held back under [`FlushPolicy::Lazy`].
#[derive(Debug, Clone)]
struct ArchivedCommit {
    commit_time: Timestamp,
    row_count: i32,
    last_row: RowId,
    rows: Vec<u8>,
}

struct ProducerTable {
    catalog: Catalog,
    codec: RowCodec,
    sequence: RowSequence,
    last_commit_time: Timestamp,
    /// Latest commit time the server has acknowledged.
    sent_through: Timestamp,
    archive: VecDeque<ArchivedCommit>,
    next_statement_id: i32,
}

/// The writing side: assigns row IDs, ships commits and statements, and
/// answers the server's accuracy requests for lazily flushed tables.
///
/// The connection lock is taken before any table state so commits reach the
/// server in the order their row IDs were assigned.
pub struct Producer {
    config: ProducerConfig,
    client: tokio::sync::Mutex<Client>,
    tables: Mutex<HashMap<String, ProducerTable>>,
}

impl Producer {
    pub async fn connect(config: ProducerConfig) -> Result<Self> {
        let client = Client::connect(config.server_addr).await?;
        Ok(Self {
            config,
            client: tokio::sync::Mutex::new(client),
            tables: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    /// Syncs `catalog` with the server and resumes its row sequence after
    /// the server's last committed row. Lazily flushed tables also join the
    /// accuracy protocol.
    pub async fn register_table(&self, catalog: Catalog) -> Result<RowId> {
        catalog.validate()?;
        let mut client = self.client.lock().await;
        let current = client.sync_catalog(&catalog).await?;
        if catalog.flush_policy == FlushPolicy::Lazy {
            client.ping_connect(&catalog.table).await?;
        }
        tracing::info!(
            table = %catalog.table,
            current_row = current,
            policy = ?catalog.flush_policy,
            "Registered producer table"
        );
        self.lock_tables()?.insert(
            catalog.table.clone(),
            ProducerTable {
                codec: catalog.codec(),
                catalog,
                sequence: RowSequence::starting_after(current),
                last_commit_time: 0,
                sent_through: 0,
                archive: VecDeque::new(),
                next_statement_id: 1,
            },
        );
        Ok(current)
    }

    /// Commits `rows` at `commit_time` and returns their row IDs. Under the
    /// instant policy the batch is on the server when this returns.
    pub async fn commit_rows(
        &self,
        table: &str,
        commit_time: Timestamp,
        rows: &[Vec<Value>],
    ) -> Result<Vec<RowId>> {
        let mut client = self.client.lock().await;
        let (ids, commit, before) = {
            let mut tables = self.lock_tables()?;
            let t = Self::table_mut(&mut tables, table)?;
            Self::check_time(t, commit_time)?;

            let before = t.sequence.current();
            let mut bytes = Vec::new();
            let mut ids = Vec::with_capacity(rows.len());
            for values in rows {
                let id = t.sequence.next();
                if let Err(e) = t.codec.encode_into(&mut bytes, values, id) {
                    t.sequence.reset_to(before);
                    return Err(e);
                }
                ids.push(id);
            }
            let commit = ArchivedCommit {
                commit_time,
                row_count: ids.len() as i32,
                last_row: t.sequence.current(),
                rows: bytes,
            };
            t.last_commit_time = commit_time;
            if t.catalog.flush_policy == FlushPolicy::Lazy {
                t.archive.push_back(commit);
                return Ok(ids);
            }
            (ids, commit, before)
        };

        let sent = client
            .flush_data(table, commit.commit_time, commit.row_count, &commit.rows)
            .await;
        if let Err(e) = sent {
            // The server rolled the batch back; its IDs can be reused.
            if let Some(t) = self.lock_tables()?.get_mut(table) {
                t.sequence.reset_to(before);
            }
            return Err(e);
        }
        self.mark_sent(table, commit_time)?;
        tracing::trace!(table, commit_time, rows = ids.len(), "Committed rows");
        Ok(ids)
    }

    /// Resolves and ships update/delete statements committed at
    /// `commit_time`. Archived rows are flushed first so every statement
    /// sees the rows committed before it.
    pub async fn commit_statements(
        &self,
        table: &str,
        commit_time: Timestamp,
        statements: &[ParsedStatement],
    ) -> Result<()> {
        let mut client = self.client.lock().await;
        let pending = {
            let mut tables = self.lock_tables()?;
            let t = Self::table_mut(&mut tables, table)?;
            Self::check_time(t, commit_time)?;
            t.archive.drain(..).collect::<Vec<_>>()
        };
        self.send_archived(&mut client, table, pending).await?;

        let (count, bytes) = {
            let mut tables = self.lock_tables()?;
            let t = Self::table_mut(&mut tables, table)?;
            let types = t.catalog.types();
            let mut bytes = Vec::new();
            for parsed in statements {
                let statement = parsed.resolve(t.next_statement_id, &t.catalog)?;
                statement.encode_into(&mut bytes, &types)?;
                t.next_statement_id += 1;
            }
            t.last_commit_time = commit_time;
            (statements.len() as i32, bytes)
        };
        client.flush_ud(table, commit_time, count, &bytes).await?;
        self.mark_sent(table, commit_time)
    }

    /// Sends every archived commit up to `time`. When none of them reached
    /// `time`, an empty heartbeat commit at `time` follows so readers
    /// waiting for it are released. Returns the number of commits sent.
    pub async fn flush_through(&self, table: &str, time: Timestamp) -> Result<usize> {
        let mut client = self.client.lock().await;
        let due = {
            let mut tables = self.lock_tables()?;
            let t = Self::table_mut(&mut tables, table)?;
            let split = t
                .archive
                .iter()
                .position(|c| c.commit_time > time)
                .unwrap_or(t.archive.len());
            t.archive.drain(..split).collect::<Vec<_>>()
        };
        let sent = due.len();
        self.send_archived(&mut client, table, due).await?;

        let sent_through = {
            let mut tables = self.lock_tables()?;
            Self::table_mut(&mut tables, table)?.sent_through
        };
        if sent_through < time {
            client.flush_data(table, time, 0, &[]).await?;
            self.mark_sent(table, time)?;
            tracing::debug!(table, time, "Sent heartbeat commit");
        }
        Ok(sent)
    }

    /// Sends every archived commit of `table`.
    pub async fn flush_all(&self, table: &str) -> Result<usize> {
        let mut client = self.client.lock().await;
        let due = {
            let mut tables = self.lock_tables()?;
            Self::table_mut(&mut tables, table)?
                .archive
                .drain(..)
                .collect::<Vec<_>>()
        };
        let sent = due.len();
        self.send_archived(&mut client, table, due).await?;
        Ok(sent)
    }

    pub async fn materialize(&self, table: &str) -> Result<RowId> {
        let through = self.client.lock().await.materialize(table).await?;
        tracing::info!(table, through, "Materialized");
        Ok(through)
    }

    /// Rolls the server back to its last checkpoint and realigns the row
    /// sequence with it. Archived commits keep their row IDs.
    pub async fn rollback(&self, table: &str) -> Result<()> {
        let mut client = self.client.lock().await;
        client.rollback(table).await?;
        let catalog = {
            let mut tables = self.lock_tables()?;
            Self::table_mut(&mut tables, table)?.catalog.clone()
        };
        let current = client.sync_catalog(&catalog).await?;

        let mut tables = self.lock_tables()?;
        let t = Self::table_mut(&mut tables, table)?;
        let archived = t.archive.back().map_or(0, |c| c.last_row);
        t.sequence.reset_to(current.max(archived));
        Ok(())
    }

    /// Tables flushed lazily, the ones the accuracy poller watches.
    pub fn lazy_tables(&self) -> Vec<String> {
        self.lock_tables()
            .map(|tables| {
                tables
                    .values()
                    .filter(|t| t.catalog.flush_policy == FlushPolicy::Lazy)
                    .map(|t| t.catalog.table.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Commit times readers are currently waiting for, per lazy table.
    pub async fn pending(&self) -> Result<Vec<(String, Timestamp)>> {
        let tables = self.lazy_tables();
        if tables.is_empty() {
            return Ok(Vec::new());
        }
        let pending = self.client.lock().await.ensure_accuracy(&tables).await?;
        Ok(tables
            .into_iter()
            .zip(pending)
            .filter_map(|(table, time)| time.map(|t| (table, t)))
            .collect())
    }

    pub fn archived(&self, table: &str) -> usize {
        self.lock_tables()
            .ok()
            .and_then(|tables| tables.get(table).map(|t| t.archive.len()))
            .unwrap_or(0)
    }

    pub async fn close(self) -> Result<()> {
        self.client.into_inner().bye().await
    }

    async fn send_archived(
        &self,
        client: &mut Client,
        table: &str,
        commits: Vec<ArchivedCommit>,
    ) -> Result<()> {
        let mut commits = VecDeque::from(commits);
        while let Some(commit) = commits.front() {
            if let Err(e) = client
                .flush_data(table, commit.commit_time, commit.row_count, &commit.rows)
                .await
            {
                // Put the unsent commits back in front of anything archived since.
                if let Some(t) = self.lock_tables()?.get_mut(table) {
                    for c in commits.into_iter().rev() {
                        t.archive.push_front(c);
                    }
                }
                return Err(e);
            }
            if let Some(sent) = commits.pop_front() {
                self.mark_sent(table, sent.commit_time)?;
            }
        }
        Ok(())
    }

    fn mark_sent(&self, table: &str, time: Timestamp) -> Result<()> {
        let mut tables = self.lock_tables()?;
        let t = Self::table_mut(&mut tables, table)?;
        t.sent_through = t.sent_through.max(time);
        t.last_commit_time = t.last_commit_time.max(time);
        Ok(())
    }

    fn check_time(table: &ProducerTable, commit_time: Timestamp) -> Result<()> {
        if commit_time < table.last_commit_time {
            return Err(Error::InvalidOperation(format!(
                "commit time {commit_time} is before last commit {} of {}",
                table.last_commit_time, table.catalog.table
            )));
        }
        Ok(())
    }

    fn table_mut<'a>(
        tables: &'a mut HashMap<String, ProducerTable>,
        table: &str,
    ) -> Result<&'a mut ProducerTable> {
        tables
            .get_mut(table)
            .ok_or_else(|| Error::NotFound(table.to_string()))
    }

    fn lock_tables(&self) -> Result<MutexGuard<'_, HashMap<String, ProducerTable>>> {
        self.tables
            .lock()
            .map_err(|_| Error::InvalidState("producer table lock poisoned".to_string()))
    }
}
