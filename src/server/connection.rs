use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::area::SharedDataArea;
use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::protocol::{self, Opcode, NOT_PENDING, NO_FRESHNESS};
use crate::store::FileBasedTupleStore;
use crate::RowId;

/// The successful reply body of one request.
enum Reply {
    Empty,
    Long(i64),
    Longs(Vec<i64>),
    Bytes(Vec<u8>),
}

/// Serves the requests of one client until `BYE`, EOF or a transport error.
pub struct Connection {
    peer: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    area: Arc<SharedDataArea>,
    /// Freshness of the ranges this client registered, consulted by
    /// `GET_DATA`.
    freshness: HashMap<(String, RowId, RowId), i64>,
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::InvalidState(format!("store task failed: {e}")))?
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, area: Arc<SharedDataArea>) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            peer,
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            area,
            freshness: HashMap::new(),
        }
    }

    pub async fn run(mut self) -> Result<()> {
        tracing::debug!(peer = %self.peer, "Connection opened");
        let result = self.serve().await;
        match &result {
            Ok(()) => tracing::debug!(peer = %self.peer, "Connection closed"),
            Err(e) => tracing::warn!(peer = %self.peer, error = %e, "Connection failed"),
        }
        result
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            let code = match self.reader.read_i32().await {
                Ok(code) => code,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            let opcode = Opcode::try_from(code)?;
            if opcode == Opcode::Bye {
                return Ok(());
            }

            match self.dispatch(opcode).await {
                Ok(reply) => self.write_reply(reply).await?,
                Err(e) if e.is_transport() => return Err(e),
                Err(e) => {
                    tracing::debug!(peer = %self.peer, ?opcode, error = %e, "Request failed");
                    protocol::write_err(&mut self.writer, &e.to_string()).await?;
                }
            }
            self.writer.flush().await?;
        }
    }

    async fn write_reply(&mut self, reply: Reply) -> Result<()> {
        protocol::write_ok(&mut self.writer).await?;
        match reply {
            Reply::Empty => {}
            Reply::Long(v) => self.writer.write_i64(v).await?,
            Reply::Longs(values) => {
                for v in values {
                    self.writer.write_i64(v).await?;
                }
            }
            Reply::Bytes(bytes) => self.writer.write_all(&bytes).await?,
        }
        Ok(())
    }

    /// Reads the rest of the request, then runs it. Only reading the
    /// request can fail with a transport error; a failed command leaves the
    /// stream positioned at the next request.
    async fn dispatch(&mut self, opcode: Opcode) -> Result<Reply> {
        match opcode {
            Opcode::SyncCatalog => {
                let text = protocol::read_string(&mut self.reader).await?;
                let area = self.area.clone();
                blocking(move || {
                    let catalog = Catalog::from_text(&text)?;
                    let store = area.sync_catalog(catalog)?;
                    Ok(Reply::Long(store.current_row()))
                })
                .await
            }
            Opcode::CommitFlushData => {
                let table = protocol::read_string(&mut self.reader).await?;
                let commit_time = self.reader.read_i64().await?;
                let count = self.reader.read_i32().await?;
                let bytes = protocol::read_bytes(&mut self.reader).await?;
                self.with_store(&table, move |store| {
                    store.read_rows_in(commit_time, count, &bytes)?;
                    Ok(Reply::Empty)
                })
                .await
            }
            Opcode::CommitFlushUd => {
                let table = protocol::read_string(&mut self.reader).await?;
                let commit_time = self.reader.read_i64().await?;
                let count = self.reader.read_i32().await?;
                let bytes = protocol::read_bytes(&mut self.reader).await?;
                self.with_store(&table, move |store| {
                    store.read_uds_in(commit_time, count, &bytes)?;
                    Ok(Reply::Empty)
                })
                .await
            }
            Opcode::CommitMaterialize => {
                let table = protocol::read_string(&mut self.reader).await?;
                self.with_store(&table, |store| Ok(Reply::Long(store.materialize()?)))
                    .await
            }
            Opcode::Rollback => {
                let table = protocol::read_string(&mut self.reader).await?;
                self.with_store(&table, |store| {
                    store.rollback()?;
                    Ok(Reply::Empty)
                })
                .await
            }
            Opcode::RegisterQuery => {
                let table = protocol::read_string(&mut self.reader).await?;
                let min = self.reader.read_i64().await?;
                let max = self.reader.read_i64().await?;
                let freshness = self.reader.read_i64().await?;
                let reply = self
                    .with_store(&table, move |store| {
                        store.register(min, max)?;
                        Ok(Reply::Empty)
                    })
                    .await?;
                self.freshness.insert((table, min, max), freshness);
                Ok(reply)
            }
            Opcode::UnregisterQuery => {
                let table = protocol::read_string(&mut self.reader).await?;
                let min = self.reader.read_i64().await?;
                let max = self.reader.read_i64().await?;
                self.freshness.remove(&(table.clone(), min, max));
                self.with_store(&table, move |store| {
                    store.unregister(min, max)?;
                    Ok(Reply::Empty)
                })
                .await
            }
            Opcode::GetData => {
                let table = protocol::read_string(&mut self.reader).await?;
                let min = self.reader.read_i64().await?;
                let max = self.reader.read_i64().await?;
                let query_start = self.reader.read_i64().await?;
                let freshness = self
                    .freshness
                    .get(&(table.clone(), min, max))
                    .copied()
                    .filter(|&f| f != NO_FRESHNESS && f >= 0);
                self.with_store(&table, move |store| {
                    let mut out = Vec::new();
                    store.query(&mut out, min, max, query_start, freshness)?;
                    Ok(Reply::Bytes(out))
                })
                .await
            }
            Opcode::PingConnect => {
                let table = protocol::read_string(&mut self.reader).await?;
                let store = self.area.get(&table)?;
                store.ping_server().connect();
                tracing::info!(table = %table, peer = %self.peer, "Producer joined accuracy protocol");
                Ok(Reply::Empty)
            }
            Opcode::PingEnsureAccuracy => {
                let n = self.reader.read_i32().await?;
                if n < 0 {
                    return Err(Error::Protocol(format!("negative table count {n}")));
                }
                let mut tables = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    tables.push(protocol::read_string(&mut self.reader).await?);
                }
                let pending = tables
                    .iter()
                    .map(|t| {
                        let store = self.area.get(t)?;
                        Ok(store.ping_server().pending().unwrap_or(NOT_PENDING))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Reply::Longs(pending))
            }
            Opcode::Bye | Opcode::Ok | Opcode::Err => Err(Error::Protocol(format!(
                "unexpected request opcode {opcode:?}"
            ))),
        }
    }

    async fn with_store<T, F>(&self, table: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&FileBasedTupleStore) -> Result<T> + Send + 'static,
    {
        let store = self.area.get(table)?;
        blocking(move || f(&store)).await
    }
}
