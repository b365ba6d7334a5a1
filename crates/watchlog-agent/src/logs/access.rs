// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Access-log buffering shared by the NGINX and IIS monitors.

use std::collections::HashMap;

use serde::Serialize;

use crate::event::{Event, EventSink};

/// Entries held before a flush is forced.
pub const MAX_BUFFERED: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessSource {
    Nginx,
    Iis,
}

/// One parsed request line.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessEntry {
    pub timestamp: String,
    pub origin: String,
    pub method: String,
    /// Normalized path.
    pub path: String,
    pub status: u16,
    pub duration_ms: f64,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OriginRollup {
    pub origin: String,
    pub total: u64,
    pub ok_2xx: u64,
    pub redirects_3xx: u64,
    pub errors_4xx: u64,
    pub errors_5xx: u64,
    #[serde(rename = "avgResponseTimeMs")]
    pub avg_response_time_ms: u64,
}

impl OriginRollup {
    fn new(origin: &str) -> Self {
        Self {
            origin: origin.to_string(),
            total: 0,
            ok_2xx: 0,
            redirects_3xx: 0,
            errors_4xx: 0,
            errors_5xx: 0,
            avg_response_time_ms: 0,
        }
    }

    fn count(&mut self, status: u16) {
        self.total += 1;
        match status {
            200..=299 => self.ok_2xx += 1,
            300..=399 => self.redirects_3xx += 1,
            400..=499 => self.errors_4xx += 1,
            500.. => self.errors_5xx += 1,
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRecord {
    pub timestamp: String,
    pub origin: String,
    pub method: String,
    pub url: String,
    pub status_code: u16,
    pub duration: f64,
    pub raw: String,
}

impl From<AccessEntry> for AccessRecord {
    fn from(entry: AccessEntry) -> Self {
        Self {
            timestamp: entry.timestamp,
            origin: entry.origin,
            method: entry.method,
            url: entry.path,
            status_code: entry.status,
            duration: entry.duration_ms,
            raw: entry.raw,
        }
    }
}

/// Rolls entries up per origin, in order of first appearance.
pub fn rollup(entries: &[AccessEntry]) -> Vec<OriginRollup> {
    let mut rollups: Vec<OriginRollup> = Vec::new();
    let mut durations: Vec<f64> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    for entry in entries {
        let position = *index.entry(entry.origin.as_str()).or_insert_with(|| {
            rollups.push(OriginRollup::new(&entry.origin));
            durations.push(0.0);
            rollups.len() - 1
        });
        rollups[position].count(entry.status);
        durations[position] += entry.duration_ms;
    }
    for (rollup, total_duration) in rollups.iter_mut().zip(durations) {
        if rollup.total > 0 {
            rollup.avg_response_time_ms = (total_duration / rollup.total as f64).round() as u64;
        }
    }
    rollups
}

#[derive(Debug)]
pub struct AccessBuffer {
    source: AccessSource,
    entries: Vec<AccessEntry>,
    capacity: usize,
}

impl AccessBuffer {
    pub fn new(source: AccessSource) -> Self {
        Self::with_capacity(source, MAX_BUFFERED)
    }

    pub fn with_capacity(source: AccessSource, capacity: usize) -> Self {
        Self {
            source,
            entries: Vec::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds an entry and flushes when the buffer is full.
    pub fn push(&mut self, entry: AccessEntry, sink: &dyn EventSink) {
        self.entries.push(entry);
        if self.entries.len() >= self.capacity {
            self.flush(sink);
        }
    }

    /// Emits the rollup then the raw records. The buffer is cleared either way.
    pub fn flush(&mut self, sink: &dyn EventSink) {
        if self.entries.is_empty() {
            return;
        }
        let entries = std::mem::take(&mut self.entries);
        let rollups = rollup(&entries);
        sink.emit(Event::AccessRollup {
            source: self.source,
            rollups,
        });
        sink.emit(Event::AccessRecords {
            source: self.source,
            records: entries.into_iter().map(AccessRecord::from).collect(),
        });
    }
}
