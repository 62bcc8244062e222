use crate::cascade::ReadingFetcher;
use crate::pipeline::{CycleOutcome, ReadingPipeline};
use crate::publish::ReadingSink;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Polls until `cancel` fires. Cycle failures are published and logged, never
/// returned. Cancellation drops any in-flight query and publishes nothing
/// for that cycle.
pub async fn run<F: ReadingFetcher>(
    mut pipeline: ReadingPipeline<F>,
    sinks: Vec<Arc<dyn ReadingSink>>,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("shutdown during poll; abandoning cycle");
                break;
            }
            outcome = pipeline.run_cycle(Utc::now()) => outcome,
        };

        if let CycleOutcome::Updated(reading) = &outcome {
            tracing::info!(
                source = %reading.source,
                pm2_5_epa = reading.pm2_5_epa,
                aqi = reading.aqi,
                "published reading"
            );
        }
        for sink in &sinks {
            sink.publish(&outcome).await;
        }
    }

    tracing::info!("poller stopped");
}
