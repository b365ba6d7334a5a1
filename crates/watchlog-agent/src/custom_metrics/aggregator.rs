// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Maximum number of distinct metric names held between two flushes.
pub const MAX_METRICS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Increment,
    Decrement,
    Distribution,
    Gauge,
    Percentage,
    Systembyte,
}

impl MetricKind {
    /// Numeric type code understood by the collector.
    pub fn code(self) -> u8 {
        match self {
            MetricKind::Increment | MetricKind::Decrement => 1,
            MetricKind::Distribution => 2,
            MetricKind::Gauge => 3,
            MetricKind::Percentage => 4,
            MetricKind::Systembyte => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Increment => "increment",
            MetricKind::Decrement => "decrement",
            MetricKind::Distribution => "distribution",
            MetricKind::Gauge => "gauge",
            MetricKind::Percentage => "percentage",
            MetricKind::Systembyte => "systembyte",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = UnknownMetricKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "increment" => Ok(MetricKind::Increment),
            "decrement" => Ok(MetricKind::Decrement),
            "distribution" => Ok(MetricKind::Distribution),
            "gauge" => Ok(MetricKind::Gauge),
            "percentage" => Ok(MetricKind::Percentage),
            "systembyte" => Ok(MetricKind::Systembyte),
            other => Err(UnknownMetricKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown metric method '{0}'")]
pub struct UnknownMetricKind(pub String);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomMetricRecord {
    pub metric: String,
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub last: f64,
    pub avg: f64,
    pub metric_type: MetricKind,
    #[serde(rename = "metric_type")]
    pub metric_type_code: u8,
}

impl CustomMetricRecord {
    fn seed(metric: String, kind: MetricKind, value: f64) -> Self {
        Self {
            metric,
            count: 1,
            sum: value,
            min: value,
            max: value,
            last: value,
            avg: value,
            metric_type: kind,
            metric_type_code: kind.code(),
        }
    }

    fn accumulate(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.last = value;
        self.avg = self.sum / self.count as f64;
    }

    fn overwrite(&mut self, value: f64) {
        self.count += 1;
        self.sum = value;
        self.min = value;
        self.max = value;
        self.last = value;
        self.avg = value;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Created,
    Updated,
    /// Zero, missing or non-finite value, or a percentage outside `[0, 100]`.
    InvalidValue,
    /// A new name arrived while the table is full.
    Overflow,
}

/// Rolling per-name aggregation, emptied by every flush.
#[derive(Debug)]
pub struct Aggregator {
    records: Vec<CustomMetricRecord>,
    index: HashMap<String, usize>,
    max_metrics: usize,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(MAX_METRICS)
    }
}

impl Aggregator {
    pub fn new(max_metrics: usize) -> Self {
        Self {
            records: Vec::new(),
            index: HashMap::new(),
            max_metrics,
        }
    }

    pub fn record(&mut self, metric: &str, kind: MetricKind, value: f64) -> RecordOutcome {
        if metric.is_empty() || !value.is_finite() || value == 0.0 {
            return RecordOutcome::InvalidValue;
        }
        if kind == MetricKind::Percentage && !(0.0..=100.0).contains(&value) {
            return RecordOutcome::InvalidValue;
        }
        let value = if kind == MetricKind::Decrement {
            -value.abs()
        } else {
            value
        };

        if let Some(&position) = self.index.get(metric) {
            let record = &mut self.records[position];
            match kind {
                MetricKind::Distribution => record.overwrite(value),
                _ => record.accumulate(value),
            }
            return RecordOutcome::Updated;
        }

        if self.records.len() >= self.max_metrics {
            debug!("CUSTOM_METRICS | Table full, ignoring new metric '{metric}'");
            return RecordOutcome::Overflow;
        }
        self.index.insert(metric.to_string(), self.records.len());
        self.records
            .push(CustomMetricRecord::seed(metric.to_string(), kind, value));
        RecordOutcome::Created
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, metric: &str) -> Option<&CustomMetricRecord> {
        self.index.get(metric).map(|&position| &self.records[position])
    }

    /// Takes every record in arrival order and leaves the table empty.
    pub fn consume(&mut self) -> Vec<CustomMetricRecord> {
        self.index.clear();
        std::mem::take(&mut self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_accumulates() {
        let mut aggregator = Aggregator::default();
        assert_eq!(
            aggregator.record("orders", MetricKind::Increment, 2.0),
            RecordOutcome::Created
        );
        assert_eq!(
            aggregator.record("orders", MetricKind::Increment, 6.0),
            RecordOutcome::Updated
        );
        let record = aggregator.get("orders").unwrap();
        assert_eq!(record.count, 2);
        assert_eq!(record.sum, 8.0);
        assert_eq!(record.min, 2.0);
        assert_eq!(record.max, 6.0);
        assert_eq!(record.last, 6.0);
        assert_eq!(record.avg, 4.0);
        assert_eq!(record.metric_type_code, 1);
    }

    #[test]
    fn gauge_and_percentage_accumulate() {
        let mut aggregator = Aggregator::default();
        aggregator.record("load", MetricKind::Gauge, 3.0);
        aggregator.record("load", MetricKind::Gauge, 1.0);
        let record = aggregator.get("load").unwrap();
        assert_eq!((record.sum, record.min, record.max), (4.0, 1.0, 3.0));

        aggregator.record("cpu", MetricKind::Percentage, 40.0);
        aggregator.record("cpu", MetricKind::Percentage, 60.0);
        let record = aggregator.get("cpu").unwrap();
        assert_eq!((record.sum, record.avg), (100.0, 50.0));
        assert_eq!(record.metric_type_code, 4);
    }

    #[test]
    fn decrement_forces_negative() {
        let mut aggregator = Aggregator::default();
        aggregator.record("stock", MetricKind::Decrement, 5.0);
        aggregator.record("stock", MetricKind::Decrement, -3.0);
        let record = aggregator.get("stock").unwrap();
        assert_eq!(record.sum, -8.0);
        assert_eq!(record.min, -5.0);
        assert_eq!(record.max, -3.0);
    }

    #[test]
    fn distribution_overwrites() {
        let mut aggregator = Aggregator::default();
        aggregator.record("latency", MetricKind::Distribution, 100.0);
        aggregator.record("latency", MetricKind::Distribution, 20.0);
        let record = aggregator.get("latency").unwrap();
        assert_eq!(record.count, 2);
        assert_eq!(record.sum, 20.0);
        assert_eq!(record.min, 20.0);
        assert_eq!(record.max, 20.0);
        assert_eq!(record.last, 20.0);
        assert_eq!(record.avg, 20.0);
        assert_eq!(record.metric_type_code, 2);
    }

    #[test]
    fn invalid_values_are_ignored() {
        let mut aggregator = Aggregator::default();
        assert_eq!(
            aggregator.record("a", MetricKind::Increment, 0.0),
            RecordOutcome::InvalidValue
        );
        assert_eq!(
            aggregator.record("a", MetricKind::Increment, f64::NAN),
            RecordOutcome::InvalidValue
        );
        assert_eq!(
            aggregator.record("a", MetricKind::Percentage, 101.0),
            RecordOutcome::InvalidValue
        );
        assert_eq!(
            aggregator.record("", MetricKind::Gauge, 1.0),
            RecordOutcome::InvalidValue
        );
        assert!(aggregator.is_empty());
    }

    #[test]
    fn cap_rejects_new_names_until_flush() {
        let mut aggregator = Aggregator::default();
        for i in 0..MAX_METRICS {
            assert_eq!(
                aggregator.record(&format!("m{i}"), MetricKind::Increment, 1.0),
                RecordOutcome::Created
            );
        }
        assert_eq!(
            aggregator.record("one-too-many", MetricKind::Increment, 1.0),
            RecordOutcome::Overflow
        );
        assert_eq!(aggregator.len(), MAX_METRICS);
        // existing names still update
        assert_eq!(
            aggregator.record("m0", MetricKind::Increment, 1.0),
            RecordOutcome::Updated
        );

        let flushed = aggregator.consume();
        assert_eq!(flushed.len(), MAX_METRICS);
        assert_eq!(flushed[0].metric, "m0");
        assert!(aggregator.is_empty());
        assert_eq!(
            aggregator.record("one-too-many", MetricKind::Increment, 1.0),
            RecordOutcome::Created
        );
    }

    #[test]
    fn record_serializes_both_type_fields() {
        let mut aggregator = Aggregator::default();
        aggregator.record("bytes", MetricKind::Systembyte, 512.0);
        let json = serde_json::to_value(aggregator.consume()).unwrap();
        assert_eq!(json[0]["metricType"], "systembyte");
        assert_eq!(json[0]["metric_type"], 5);
        assert_eq!(json[0]["count"], 1);
    }

    #[test]
    fn parses_methods() {
        assert_eq!("gauge".parse::<MetricKind>(), Ok(MetricKind::Gauge));
        assert!("histogram".parse::<MetricKind>().is_err());
    }
}
