use super::Client;
use crate::catalog::Catalog;
use crate::encoding::Value;
use crate::error::Result;
use crate::{RowId, Timestamp};

/// The reading side: pins row ranges on the server and fetches them.
pub struct Consumer {
    client: Client,
}

impl Consumer {
    pub async fn connect(addr: std::net::SocketAddr) -> Result<Self> {
        Ok(Self {
            client: Client::connect(addr).await?,
        })
    }

    /// Pins the rows strictly inside `(min, max)` so materialization cannot
    /// drop them while this consumer reads. With `freshness`, later reads of
    /// the range include every commit older than `query_start - freshness`.
    pub async fn register(
        &mut self,
        table: &str,
        min: RowId,
        max: RowId,
        freshness: Option<i64>,
    ) -> Result<()> {
        self.client.register(table, min, max, freshness).await
    }

    pub async fn unregister(&mut self, table: &str, min: RowId, max: RowId) -> Result<()> {
        self.client.unregister(table, min, max).await
    }

    /// Reads the rows of a registered range.
    pub async fn get_data(
        &mut self,
        catalog: &Catalog,
        min: RowId,
        max: RowId,
        query_start: Timestamp,
    ) -> Result<Vec<(RowId, Vec<Value>)>> {
        let codec = catalog.codec();
        let bytes = self
            .client
            .get_data(&catalog.table, codec.types(), min, max, query_start)
            .await?;

        let mut rows = Vec::new();
        let mut rest = bytes.as_slice();
        while !rest.is_empty() {
            let (values, row_id, used) = codec.decode(rest)?;
            rows.push((row_id, values));
            rest = &rest[used..];
        }
        Ok(rows)
    }

    /// Registers, reads and unregisters `(min, max)` in one go. The range is
    /// unregistered even when the read fails.
    pub async fn query(
        &mut self,
        catalog: &Catalog,
        min: RowId,
        max: RowId,
        query_start: Timestamp,
        freshness: Option<i64>,
    ) -> Result<Vec<(RowId, Vec<Value>)>> {
        self.register(&catalog.table, min, max, freshness).await?;
        let rows = self.get_data(catalog, min, max, query_start).await;
        if let Err(e) = self.unregister(&catalog.table, min, max).await {
            if rows.is_ok() {
                return Err(e);
            }
            tracing::warn!(table = %catalog.table, min, max, error = %e, "Failed to unregister range");
        }
        rows
    }

    pub async fn close(self) -> Result<()> {
        self.client.bye().await
    }
}
