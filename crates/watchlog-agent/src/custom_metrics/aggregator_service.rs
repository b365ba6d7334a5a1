// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::custom_metrics::aggregator::{Aggregator, CustomMetricRecord, MetricKind, RecordOutcome};

#[derive(Debug)]
pub enum AggregatorCommand {
    Record {
        metric: String,
        kind: MetricKind,
        value: f64,
    },
    Flush(oneshot::Sender<Vec<CustomMetricRecord>>),
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct AggregatorHandle {
    tx: mpsc::UnboundedSender<AggregatorCommand>,
}

impl AggregatorHandle {
    pub fn record(
        &self,
        metric: impl Into<String>,
        kind: MetricKind,
        value: f64,
    ) -> Result<(), mpsc::error::SendError<AggregatorCommand>> {
        self.tx.send(AggregatorCommand::Record {
            metric: metric.into(),
            kind,
            value,
        })
    }

    pub async fn flush(&self) -> Result<Vec<CustomMetricRecord>, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(AggregatorCommand::Flush(response_tx))
            .map_err(|e| format!("Failed to send flush command: {}", e))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive flush response: {}", e))
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<AggregatorCommand>> {
        self.tx.send(AggregatorCommand::Shutdown)
    }
}

/// Owns the metric table; every mutation arrives as a command.
pub struct AggregatorService {
    aggregator: Aggregator,
    rx: mpsc::UnboundedReceiver<AggregatorCommand>,
}

impl AggregatorService {
    pub fn new(max_metrics: usize) -> (Self, AggregatorHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            aggregator: Aggregator::new(max_metrics),
            rx,
        };
        (service, AggregatorHandle { tx })
    }

    pub async fn run(mut self) {
        debug!("CUSTOM_METRICS | Aggregator service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                AggregatorCommand::Record {
                    metric,
                    kind,
                    value,
                } => {
                    let outcome = self.aggregator.record(&metric, kind, value);
                    if outcome == RecordOutcome::InvalidValue {
                        debug!("CUSTOM_METRICS | Ignoring {kind} '{metric}' with value {value}");
                    }
                }

                AggregatorCommand::Flush(response_tx) => {
                    let records = self.aggregator.consume();
                    if response_tx.send(records).is_err() {
                        error!("CUSTOM_METRICS | Failed to send flush response - receiver dropped");
                    }
                }

                AggregatorCommand::Shutdown => {
                    debug!("CUSTOM_METRICS | Aggregator service shutting down");
                    break;
                }
            }
        }
    }
}
