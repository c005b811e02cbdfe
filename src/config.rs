use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the tuple stores of one data directory
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding one subdirectory per table
    pub data_dir: PathBuf,

    /// Capacity of a new table's segments (default: 1MB)
    pub segment_size: usize,

    /// Sealed segments kept in memory per table (default: 64)
    pub segment_cache_capacity: usize,

    /// How long a bounded-staleness read waits for the producer (default: 30s)
    pub accuracy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./stagehouse"),
            segment_size: 1024 * 1024, // 1MB
            segment_cache_capacity: 64,
            accuracy_timeout: Duration::from_secs(30),
        }
    }
}

impl StoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn segment_size(mut self, size: usize) -> Self {
        self.segment_size = size;
        self
    }

    pub fn segment_cache_capacity(mut self, capacity: usize) -> Self {
        self.segment_cache_capacity = capacity;
        self
    }

    pub fn accuracy_timeout(mut self, timeout: Duration) -> Self {
        self.accuracy_timeout = timeout;
        self
    }
}

/// Intervals of the server's background tasks
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to reclaim materialized segments (default: 10s)
    pub gc_interval: Duration,

    /// How often to log per-table metrics (default: 60s)
    pub metrics_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            gc_interval: Duration::from_secs(10),
            metrics_interval: Duration::from_secs(60),
        }
    }
}

impl SchedulerConfig {
    pub fn gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on (default: 127.0.0.1:7878)
    pub listen_addr: SocketAddr,

    pub store: StoreConfig,

    pub scheduler: SchedulerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7878)),
            store: StoreConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            store: StoreConfig::new(data_dir),
            ..Default::default()
        }
    }

    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn store(mut self, config: StoreConfig) -> Self {
        self.store = config;
        self
    }

    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }
}

/// Configuration for the producer side
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub server_addr: SocketAddr,

    /// How often the accuracy poller asks for pending reads (default: 200ms)
    pub poll_interval: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 7878)),
            poll_interval: Duration::from_millis(200),
        }
    }
}

impl ProducerConfig {
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            ..Default::default()
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.store.data_dir, PathBuf::from("./stagehouse"));
        assert_eq!(config.store.segment_size, 1024 * 1024);
        assert_eq!(config.store.segment_cache_capacity, 64);
        assert_eq!(config.scheduler.gc_interval, Duration::from_secs(10));
        assert_eq!(config.listen_addr.port(), 7878);
    }

    #[test]
    fn test_config_builder() {
        let config = ServerConfig::new("/tmp/stage")
            .listen_addr("0.0.0.0:9000".parse().unwrap())
            .store(
                StoreConfig::new("/tmp/other")
                    .segment_size(4096)
                    .segment_cache_capacity(2)
                    .accuracy_timeout(Duration::from_millis(500)),
            )
            .scheduler(
                SchedulerConfig::default()
                    .gc_interval(Duration::from_secs(1))
                    .metrics_interval(Duration::from_secs(5)),
            );

        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.store.data_dir, PathBuf::from("/tmp/other"));
        assert_eq!(config.store.segment_size, 4096);
        assert_eq!(config.store.accuracy_timeout, Duration::from_millis(500));
        assert_eq!(config.scheduler.metrics_interval, Duration::from_secs(5));

        let producer = ProducerConfig::default().poll_interval(Duration::from_millis(50));
        assert_eq!(producer.poll_interval, Duration::from_millis(50));
    }
}
