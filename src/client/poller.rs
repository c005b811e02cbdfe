use std::sync::Arc;
use std::time::Duration;

use super::Producer;
use crate::error::Result;
use crate::scheduler::{BackgroundTask, Context};

/// Answers the server's accuracy requests: whenever a reader is parked on a
/// commit time of a lazily flushed table, the archived commits up to that
/// time are sent.
pub struct AccuracyPoller {
    producer: Arc<Producer>,
}

impl AccuracyPoller {
    pub fn new(producer: Arc<Producer>) -> Self {
        Self { producer }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for AccuracyPoller {
    fn name(&self) -> &'static str {
        "accuracy-poller"
    }

    fn interval(&self) -> Duration {
        self.producer.config().poll_interval
    }

    async fn execute(&self, ctx: Context) -> Result<()> {
        for (table, time) in self.producer.pending().await? {
            let sent = self.producer.flush_through(&table, time).await?;
            tracing::debug!(
                task = ctx.task_name,
                run_id = ctx.run_id,
                table = %table,
                time,
                sent,
                "Flushed for waiting readers"
            );
        }
        Ok(())
    }
}
