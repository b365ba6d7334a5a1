// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod aggregator;
pub mod aggregator_service;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

pub use aggregator::{CustomMetricRecord, MetricKind, MAX_METRICS};
pub use aggregator_service::{AggregatorHandle, AggregatorService};

use crate::event::{Event, EventSink};

/// Sends the table as one `customMetrics` batch every `period`, then starts a fresh window.
pub async fn run_flush_loop(
    handle: AggregatorHandle,
    sink: Arc<dyn EventSink>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut flush_interval = interval(period);
    flush_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    flush_interval.tick().await; // discard first tick, which is instantaneous

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = flush_interval.tick() => {}
        }
        flush_once(&handle, sink.as_ref()).await;
    }
    // last window
    flush_once(&handle, sink.as_ref()).await;
}

pub async fn flush_once(handle: &AggregatorHandle, sink: &dyn EventSink) {
    match handle.flush().await {
        Ok(records) if records.is_empty() => {}
        Ok(records) => {
            debug!("CUSTOM_METRICS | Flushing {} metrics", records.len());
            sink.emit(Event::CustomMetrics(records));
        }
        Err(e) => error!("CUSTOM_METRICS | {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::testing::RecordingSink;

    #[tokio::test]
    async fn test_flush_once_skips_empty_table() {
        let (service, handle) = AggregatorService::new(MAX_METRICS);
        tokio::spawn(service.run());
        let sink = RecordingSink::default();

        flush_once(&handle, &sink).await;
        assert!(sink.take().is_empty());

        handle.record("signups", MetricKind::Increment, 1.0).unwrap();
        flush_once(&handle, &sink).await;
        let events = sink.take();
        assert_eq!(events.len(), 1);
        let Event::CustomMetrics(records) = &events[0] else {
            panic!("unexpected event {:?}", events[0]);
        };
        assert_eq!(records[0].metric, "signups");
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_loop_emits_each_window() {
        let (service, handle) = AggregatorService::new(MAX_METRICS);
        tokio::spawn(service.run());
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_flush_loop(
            handle.clone(),
            sink.clone(),
            Duration::from_secs(10),
            cancel.clone(),
        ));

        handle.record("a", MetricKind::Gauge, 2.0).unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        handle.record("a", MetricKind::Gauge, 5.0).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        cancel.cancel();
        task.await.unwrap();

        let windows: Vec<f64> = sink
            .take()
            .into_iter()
            .map(|event| match event {
                Event::CustomMetrics(records) => records[0].sum,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(windows, vec![2.0, 5.0]);
    }
}
