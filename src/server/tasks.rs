use std::{sync::Arc, time::Duration};

use super::area::SharedDataArea;
use crate::{
    config::SchedulerConfig,
    error::{Error, Result},
    scheduler::{BackgroundTask, Context},
};

pub struct GcTask {
    area: Arc<SharedDataArea>,
    interval: Duration,
}

impl GcTask {
    pub fn new(area: Arc<SharedDataArea>, config: &SchedulerConfig) -> Self {
        Self {
            area,
            interval: config.gc_interval,
        }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for GcTask {
    fn name(&self) -> &'static str {
        "segment-gc"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, ctx: Context) -> Result<()> {
        for store in self.area.tables() {
            if !store.is_available() {
                continue;
            }
            let table = store.table().to_string();
            let removed = tokio::task::spawn_blocking(move || store.shrink())
                .await
                .map_err(|e| Error::InvalidState(format!("gc join error: {e}")))?;
            match removed {
                Ok(0) => {}
                Ok(removed) => {
                    tracing::debug!(table = %table, removed, run_id = ctx.run_id, "Segment gc pass");
                }
                Err(e) => tracing::warn!(table = %table, error = %e, "Segment gc failed"),
            }
        }
        Ok(())
    }
}

pub struct MetricsTask {
    area: Arc<SharedDataArea>,
    interval: Duration,
}

impl MetricsTask {
    pub fn new(area: Arc<SharedDataArea>, config: &SchedulerConfig) -> Self {
        Self {
            area,
            interval: config.metrics_interval,
        }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for MetricsTask {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        for store in self.area.tables() {
            store.metrics().log();
        }
        Ok(())
    }
}
