//! TCP front end: one task per client connection, one store per table.

mod area;
mod connection;
mod tasks;

pub use area::SharedDataArea;
pub use connection::Connection;
pub use tasks::{GcTask, MetricsTask};

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::scheduler::Scheduler;
use crate::warehouse::Warehouse;

pub const LOCK_FILE: &str = "stagehouse.lock";

pub struct Server {
    config: ServerConfig,
    area: Arc<SharedDataArea>,
    listener: TcpListener,
    _lock: FileLock,
}

impl Server {
    /// Locks the data directory, opens its tables and binds the listener.
    pub async fn bind(config: ServerConfig, warehouse: Arc<dyn Warehouse>) -> Result<Self> {
        std::fs::create_dir_all(&config.store.data_dir)?;
        let lock = FileLock::lock(config.store.data_dir.join(LOCK_FILE)).map_err(Error::LockError)?;

        let store_config = config.store.clone();
        let area = tokio::task::spawn_blocking(move || SharedDataArea::open(store_config, warehouse))
            .await
            .map_err(|e| Error::InvalidState(format!("open join error: {e}")))??;

        let listener = TcpListener::bind(config.listen_addr).await?;
        tracing::info!(
            addr = %listener.local_addr()?,
            data_dir = %config.store.data_dir.display(),
            "Server listening"
        );
        Ok(Self {
            config,
            area: Arc::new(area),
            listener,
            _lock: lock,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn area(&self) -> Arc<SharedDataArea> {
        self.area.clone()
    }

    /// Accepts connections until `shutdown` resolves, then stops the
    /// background tasks and fails any parked readers.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let scheduler = Scheduler::new();
        scheduler
            .register(Arc::new(GcTask::new(self.area.clone(), &self.config.scheduler)))
            .register(Arc::new(MetricsTask::new(self.area.clone(), &self.config.scheduler)));

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                tracing::warn!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                            }
                            let connection = Connection::new(stream, peer, self.area.clone());
                            tokio::spawn(async move {
                                let _ = connection.run().await;
                            });
                        }
                        Err(e) => tracing::error!(error = %e, "Accept failed"),
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.area.close();
        scheduler.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::sync::oneshot;

    use crate::catalog::{Catalog, Column, FlushPolicy};
    use crate::client::{AccuracyPoller, Consumer, Producer};
    use crate::config::{ProducerConfig, SchedulerConfig};
    use crate::encoding::{DataType, Value};
    use crate::warehouse::MemoryWarehouse;

    fn catalog(table: &str, policy: FlushPolicy) -> Catalog {
        Catalog::new(
            table,
            vec![
                Column::new("customer", DataType::String),
                Column::new("amount", DataType::Long),
            ],
        )
        .flush_policy(policy)
    }

    fn rows(n: i64) -> Vec<Vec<Value>> {
        (0..n)
            .map(|i| vec![Value::Str(format!("c{i}")), Value::Long(i * 10)])
            .collect()
    }

    async fn start(
        dir: &TempDir,
        warehouse: Arc<MemoryWarehouse>,
    ) -> Result<(SocketAddr, Arc<SharedDataArea>, oneshot::Sender<()>, tokio::task::JoinHandle<Result<()>>)>
    {
        let config = ServerConfig::new(dir.path())
            .listen_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
            .scheduler(
                SchedulerConfig::default()
                    .gc_interval(Duration::from_millis(50))
                    .metrics_interval(Duration::from_secs(60)),
            );
        let server = Server::bind(config, warehouse).await?;
        let addr = server.local_addr()?;
        let area = server.area();
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(server.run(async move {
            rx.await.ok();
        }));
        Ok((addr, area, tx, handle))
    }

    #[tokio::test]
    async fn test_lazy_commits_reach_fresh_reader() -> Result<()> {
        let dir = TempDir::new()?;
        let warehouse = Arc::new(MemoryWarehouse::new());
        let (addr, area, shutdown, handle) = start(&dir, warehouse.clone()).await?;

        let producer = Arc::new(
            Producer::connect(ProducerConfig::new(addr).poll_interval(Duration::from_millis(20)))
                .await?,
        );
        let orders = catalog("orders", FlushPolicy::Lazy);
        assert_eq!(producer.register_table(orders.clone()).await?, 0);

        assert_eq!(producer.commit_rows("orders", 100, &rows(3)).await?, vec![1, 2, 3]);
        assert_eq!(producer.commit_rows("orders", 200, &rows(2)).await?, vec![4, 5]);
        assert_eq!(producer.archived("orders"), 2);
        assert_eq!(area.get("orders")?.current_row(), 0);

        let scheduler = Scheduler::new();
        scheduler.register(Arc::new(AccuracyPoller::new(producer.clone())));

        // Reading at 300 with freshness 100 needs every commit through 200.
        let mut consumer = Consumer::connect(addr).await?;
        let fresh = consumer.query(&orders, 0, 100, 300, Some(100)).await?;
        let ids: Vec<_> = fresh.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(fresh[4].1, vec![Value::Str("c1".to_string()), Value::Long(10)]);
        assert_eq!(producer.archived("orders"), 0);

        assert_eq!(producer.materialize("orders").await?, 5);
        assert_eq!(warehouse.rows("orders").len(), 5);

        scheduler.shutdown().await?;
        consumer.close().await?;
        shutdown.send(()).ok();
        handle
            .await
            .map_err(|e| Error::InvalidState(format!("server task failed: {e}")))??;
        Ok(())
    }

    #[tokio::test]
    async fn test_instant_commits_and_errors() -> Result<()> {
        let dir = TempDir::new()?;
        let (addr, area, shutdown, handle) = start(&dir, Arc::new(MemoryWarehouse::new())).await?;

        let producer = Producer::connect(ProducerConfig::new(addr)).await?;
        let events = catalog("events", FlushPolicy::Instant);
        producer.register_table(events.clone()).await?;
        producer.commit_rows("events", 10, &rows(4)).await?;
        assert_eq!(area.get("events")?.current_row(), 4);

        // Older commit times are refused before anything is sent.
        assert!(producer.commit_rows("events", 5, &rows(1)).await.is_err());

        let mut consumer = Consumer::connect(addr).await?;
        let err = consumer.register("missing", 0, 10, None).await;
        assert!(matches!(err, Err(Error::InvalidOperation(_))));

        // The connection survives a failed request.
        let all = consumer.query(&events, 0, 10, 0, None).await?;
        assert_eq!(all.len(), 4);
        let middle = consumer.query(&events, 1, 4, 0, None).await?;
        assert_eq!(middle.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![2, 3]);

        // A restarted producer resumes after the server's last row.
        producer.close().await?;
        let producer = Producer::connect(ProducerConfig::new(addr)).await?;
        assert_eq!(producer.register_table(events).await?, 4);
        assert_eq!(producer.commit_rows("events", 20, &rows(1)).await?, vec![5]);

        producer.close().await?;
        consumer.close().await?;
        shutdown.send(()).ok();
        handle
            .await
            .map_err(|e| Error::InvalidState(format!("server task failed: {e}")))??;
        Ok(())
    }
}
