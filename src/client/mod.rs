//! Producer and consumer ends of the wire protocol.

mod consumer;
mod poller;
mod producer;

pub use consumer::Consumer;
pub use poller::AccuracyPoller;
pub use producer::Producer;

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::catalog::Catalog;
use crate::encoding::DataType;
use crate::error::{Error, Result};
use crate::protocol::{self, Opcode, NOT_PENDING, NO_FRESHNESS};
use crate::{RowId, Timestamp};

/// One request/reply connection to the server.
pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
        })
    }

    async fn begin(&mut self, opcode: Opcode, table: &str) -> Result<()> {
        protocol::write_opcode(&mut self.writer, opcode).await?;
        protocol::write_string(&mut self.writer, table).await
    }

    async fn finish(&mut self) -> Result<()> {
        self.writer.flush().await?;
        protocol::read_status(&mut self.reader).await
    }

    /// Creates or checks the table on the server and returns its last
    /// committed row ID.
    pub async fn sync_catalog(&mut self, catalog: &Catalog) -> Result<RowId> {
        protocol::write_opcode(&mut self.writer, Opcode::SyncCatalog).await?;
        protocol::write_string(&mut self.writer, &catalog.to_text()).await?;
        self.finish().await?;
        Ok(self.reader.read_i64().await?)
    }

    pub async fn flush_data(
        &mut self,
        table: &str,
        commit_time: Timestamp,
        row_count: i32,
        rows: &[u8],
    ) -> Result<()> {
        self.begin(Opcode::CommitFlushData, table).await?;
        self.writer.write_i64(commit_time).await?;
        self.writer.write_i32(row_count).await?;
        protocol::write_bytes(&mut self.writer, rows).await?;
        self.finish().await
    }

    pub async fn flush_ud(
        &mut self,
        table: &str,
        commit_time: Timestamp,
        entry_count: i32,
        entries: &[u8],
    ) -> Result<()> {
        self.begin(Opcode::CommitFlushUd, table).await?;
        self.writer.write_i64(commit_time).await?;
        self.writer.write_i32(entry_count).await?;
        protocol::write_bytes(&mut self.writer, entries).await?;
        self.finish().await
    }

    pub async fn materialize(&mut self, table: &str) -> Result<RowId> {
        self.begin(Opcode::CommitMaterialize, table).await?;
        self.finish().await?;
        Ok(self.reader.read_i64().await?)
    }

    pub async fn rollback(&mut self, table: &str) -> Result<()> {
        self.begin(Opcode::Rollback, table).await?;
        self.finish().await
    }

    pub async fn register(
        &mut self,
        table: &str,
        min: RowId,
        max: RowId,
        freshness: Option<i64>,
    ) -> Result<()> {
        self.begin(Opcode::RegisterQuery, table).await?;
        self.writer.write_i64(min).await?;
        self.writer.write_i64(max).await?;
        self.writer.write_i64(freshness.unwrap_or(NO_FRESHNESS)).await?;
        self.finish().await
    }

    pub async fn unregister(&mut self, table: &str, min: RowId, max: RowId) -> Result<()> {
        self.begin(Opcode::UnregisterQuery, table).await?;
        self.writer.write_i64(min).await?;
        self.writer.write_i64(max).await?;
        self.finish().await
    }

    /// Fetches the encoded rows of `(min, max)`, without the end-of-stream
    /// marker.
    pub async fn get_data(
        &mut self,
        table: &str,
        types: &[DataType],
        min: RowId,
        max: RowId,
        query_start: Timestamp,
    ) -> Result<Vec<u8>> {
        self.begin(Opcode::GetData, table).await?;
        self.writer.write_i64(min).await?;
        self.writer.write_i64(max).await?;
        self.writer.write_i64(query_start).await?;
        self.finish().await?;
        protocol::read_row_stream(&mut self.reader, types).await
    }

    pub async fn ping_connect(&mut self, table: &str) -> Result<()> {
        self.begin(Opcode::PingConnect, table).await?;
        self.finish().await
    }

    /// The commit time readers of each table are waiting for.
    pub async fn ensure_accuracy(&mut self, tables: &[String]) -> Result<Vec<Option<Timestamp>>> {
        let n = i32::try_from(tables.len())
            .map_err(|_| Error::Protocol(format!("too many tables: {}", tables.len())))?;
        protocol::write_opcode(&mut self.writer, Opcode::PingEnsureAccuracy).await?;
        self.writer.write_i32(n).await?;
        for table in tables {
            protocol::write_string(&mut self.writer, table).await?;
        }
        self.finish().await?;

        let mut pending = Vec::with_capacity(tables.len());
        for _ in tables {
            let time = self.reader.read_i64().await?;
            pending.push((time != NOT_PENDING).then_some(time));
        }
        Ok(pending)
    }

    pub async fn bye(mut self) -> Result<()> {
        protocol::write_opcode(&mut self.writer, Opcode::Bye).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
