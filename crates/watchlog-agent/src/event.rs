// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Everything the agent sends to the collector.

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use watchlog_transport::DeferredEmitter;

use crate::custom_metrics::CustomMetricRecord;
use crate::gitlab::model::{GitlabEvent, GitlabSummary};
use crate::http::{AiSpan, ApmReport};
use crate::logs::access::{AccessRecord, AccessSource, OriginRollup};
use crate::logs::iis::{SiteSnapshot, SiteStatusChange};
use crate::logs::nginx::NginxStatusChange;
use crate::logs::watchlist::WatchlistEntry;
use crate::system_metrics::SystemMetric;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ServerMetrics(Vec<SystemMetric>),
    CustomMetrics(Vec<CustomMetricRecord>),
    GitlabSummary(GitlabSummary),
    GitlabEvents(Vec<GitlabEvent>),
    AccessRollup {
        source: AccessSource,
        rollups: Vec<OriginRollup>,
    },
    AccessRecords {
        source: AccessSource,
        records: Vec<AccessRecord>,
    },
    NginxStatus(NginxStatusChange),
    SiteStatus(SiteStatusChange),
    SiteSnapshot(SiteSnapshot),
    Watchlist(WatchlistEntry),
    PodLogLines(Vec<Value>),
    AiTrace(Vec<AiSpan>),
    Apm(ApmReport),
    Pm2List(Value),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::ServerMetrics(_) => "serverMetricsArray",
            Event::CustomMetrics(_) => "customMetrics",
            Event::GitlabSummary(_) => "integrations/gitlab.influx",
            Event::GitlabEvents(_) => "integrations/gitlab.elastic",
            Event::AccessRollup { source, .. } => match source {
                AccessSource::Nginx => "integrations/nginx.access.influx",
                AccessSource::Iis => "integrations/iis.access.influx",
            },
            Event::AccessRecords { source, .. } => match source {
                AccessSource::Nginx => "integrations/nginx.access.elastic",
                AccessSource::Iis => "integrations/iis.access.elastic",
            },
            Event::NginxStatus(_) => "integrations/nginx.status.update",
            Event::SiteStatus(_) => "iis/site-status-update",
            Event::SiteSnapshot(_) => "iis/site-status-snapshot",
            Event::Watchlist(_) => "logs/watchlist",
            Event::PodLogLines(_) => "podLogLines",
            Event::AiTrace(_) => "ai-trace",
            Event::Apm(_) => "APM",
            Event::Pm2List(_) => "integrations/pm2List",
        }
    }

    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Event::ServerMetrics(data) => Ok(json!({ "data": to_value(data)? })),
            Event::CustomMetrics(records) => to_value(records),
            // the collector expects summaries wrapped in a one element array
            Event::GitlabSummary(summary) => Ok(Value::Array(vec![to_value(summary)?])),
            Event::GitlabEvents(events) => to_value(events),
            Event::AccessRollup { rollups, .. } => to_value(rollups),
            Event::AccessRecords { records, .. } => to_value(records),
            Event::NginxStatus(change) => to_value(change),
            Event::SiteStatus(change) => to_value(change),
            Event::SiteSnapshot(snapshot) => to_value(snapshot),
            Event::Watchlist(entry) => to_value(entry),
            Event::PodLogLines(lines) => to_value(lines),
            Event::AiTrace(spans) => Ok(json!({ "spans": to_value(spans)? })),
            Event::Apm(report) => to_value(report),
            Event::Pm2List(data) => Ok(json!({ "data": data })),
        }
    }
}

fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, serde_json::Error> {
    serde_json::to_value(value)
}

/// Write side used by every producer.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

impl EventSink for DeferredEmitter {
    fn emit(&self, event: Event) {
        let payload = match event.payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Could not serialize '{}': {e}", event.name());
                return;
            }
        };
        if let Err(e) = self.emit_when_connected(event.name(), payload) {
            debug!("Emission not accepted: {e}");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::{Event, EventSink};

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        events: Mutex<Vec<Event>>,
    }

    impl RecordingSink {
        pub(crate) fn take(&self) -> Vec<Event> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }
}
