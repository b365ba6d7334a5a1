// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! NGINX access-log monitor and reachability probe.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use regex::Regex;
use reqwest::Url;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NginxSettings;
use crate::event::{Event, EventSink};
use crate::logs::access::{AccessBuffer, AccessEntry, AccessSource};
use crate::logs::normalize::PathNormalizer;
use crate::logs::tailer::FileTailer;
use crate::logs::{FLUSH_INTERVAL, POLL_INTERVAL};

const STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// `log_format` with the full URL quoted after the request line, then
/// status, bytes, referer, user agent, request time, upstream time and TLS.
const LINE_PATTERN: &str = r#"^(\S+) - \S+ \[([^\]]+)\] "([A-Z]+) ([^ ]+) HTTP/[^"]+" "([^"]+)" (\d{3}) \d+ "([^"]*)" "([^"]*)" ([\d.]+) ([\d.]+|-) ([.\-]) (\S+) (\S+)$"#;

pub struct NginxLineParser {
    line: Regex,
    normalizer: PathNormalizer,
}

impl NginxLineParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            line: Regex::new(LINE_PATTERN)?,
            normalizer: PathNormalizer::new()?,
        })
    }

    /// `None` for lines that do not follow the expected format.
    pub fn parse(&self, line: &str, timestamp: &str) -> Option<AccessEntry> {
        let captures = self.line.captures(line)?;
        let method = captures.get(3)?.as_str();
        let raw_url = captures.get(4)?.as_str();
        let full_url = captures.get(5)?.as_str();
        let status = captures.get(6)?.as_str().parse::<u16>().ok()?;
        let request_time = captures.get(9)?.as_str().parse::<f64>().unwrap_or(0.0);

        let (origin, path) = match Url::parse(full_url) {
            Ok(url) => (
                url.host_str().unwrap_or("unknown").to_string(),
                url.path().to_string(),
            ),
            Err(_) => (
                "invalid-url".to_string(),
                raw_url.split('?').next().unwrap_or_default().to_string(),
            ),
        };
        if path.is_empty() {
            return None;
        }

        Some(AccessEntry {
            timestamp: timestamp.to_string(),
            origin,
            method: method.to_string(),
            path: self.normalizer.normalize(&path),
            status,
            duration_ms: request_time * 1000.0,
            raw: line.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NginxStatusChange {
    pub timestamp: String,
    pub status: ProbeStatus,
    pub prev: Option<ProbeStatus>,
}

/// Reports a change only when the probe result differs from the previous one.
#[derive(Debug, Default)]
pub struct StatusTracker {
    previous: Option<ProbeStatus>,
}

impl StatusTracker {
    pub fn observe(&mut self, status: ProbeStatus, timestamp: String) -> Option<NginxStatusChange> {
        if self.previous == Some(status) {
            return None;
        }
        let prev = self.previous.replace(status);
        Some(NginxStatusChange {
            timestamp,
            status,
            prev,
        })
    }
}

/// TCP connect within `timeout`.
pub async fn probe(host: &str, port: u16, timeout: Duration) -> ProbeStatus {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => ProbeStatus::Active,
        Ok(Err(e)) => {
            debug!("NGINX | {host}:{port} unreachable: {e}");
            ProbeStatus::Inactive
        }
        Err(_) => ProbeStatus::Inactive,
    }
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub struct NginxMonitor {
    settings: NginxSettings,
    parser: NginxLineParser,
    sink: Arc<dyn EventSink>,
}

impl NginxMonitor {
    pub fn new(settings: NginxSettings, sink: Arc<dyn EventSink>) -> Result<Self, regex::Error> {
        Ok(Self {
            settings,
            parser: NginxLineParser::new()?,
            sink,
        })
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut tailer = match FileTailer::attach_at_end(&self.settings.access_log).await {
            Ok(tailer) => tailer,
            Err(e) => {
                warn!(
                    "NGINX | Not monitoring {}: {e}",
                    self.settings.access_log.display()
                );
                return;
            }
        };
        info!("NGINX | Tailing {}", self.settings.access_log.display());

        let mut buffer = AccessBuffer::new(AccessSource::Nginx);
        let mut status = StatusTracker::default();
        let mut poll_tick = interval(POLL_INTERVAL);
        let mut flush_tick = interval(FLUSH_INTERVAL);
        let mut status_tick = interval(STATUS_INTERVAL);
        for tick in [&mut poll_tick, &mut flush_tick, &mut status_tick] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }
        flush_tick.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = poll_tick.tick() => match tailer.poll().await {
                    Ok(lines) => {
                        let timestamp = now_iso();
                        for line in lines {
                            if let Some(entry) = self.parser.parse(&line, &timestamp) {
                                buffer.push(entry, self.sink.as_ref());
                            }
                        }
                    }
                    Err(e) => debug!("NGINX | Tail error: {e}"),
                },
                _ = flush_tick.tick() => buffer.flush(self.sink.as_ref()),
                _ = status_tick.tick() => {
                    let current = probe(
                        &self.settings.host,
                        self.settings.port,
                        self.settings.healthcheck_timeout,
                    )
                    .await;
                    if let Some(change) = status.observe(current, now_iso()) {
                        self.sink.emit(Event::NginxStatus(change));
                    }
                }
            }
        }
        buffer.flush(self.sink.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str = r#"203.0.113.9 - - [01/May/2024:12:00:00 +0000] "GET /api/users/42?x=1 HTTP/1.1" "https://shop.example.com/api/users/42?x=1" 200 512 "-" "curl/8.0" 0.125 0.120 . TLSv1.3 TLS_AES_256_GCM_SHA384"#;

    #[test]
    fn test_parse_line() {
        let parser = NginxLineParser::new().unwrap();
        let entry = parser.parse(LINE, "ts").unwrap();
        assert_eq!(entry.origin, "shop.example.com");
        assert_eq!(entry.method, "GET");
        assert_eq!(entry.path, "/api/users/:id");
        assert_eq!(entry.status, 200);
        assert_eq!(entry.duration_ms, 125.0);
        assert_eq!(entry.raw, LINE);
    }

    #[test]
    fn test_invalid_full_url_falls_back_to_raw_path() {
        let parser = NginxLineParser::new().unwrap();
        let line = LINE.replace("https://shop.example.com/api/users/42?x=1", "not a url");
        let entry = parser.parse(&line, "ts").unwrap();
        assert_eq!(entry.origin, "invalid-url");
        assert_eq!(entry.path, "/api/users/:id");
    }

    #[test]
    fn test_unmatched_line_is_ignored() {
        let parser = NginxLineParser::new().unwrap();
        assert!(parser.parse("garbage", "ts").is_none());
        assert!(parser
            .parse(r#"1.2.3.4 - - [x] "GET / HTTP/1.1" 200 1 "-" "-""#, "ts")
            .is_none());
    }

    #[test]
    fn test_status_tracker_reports_transitions() {
        let mut tracker = StatusTracker::default();
        let first = tracker.observe(ProbeStatus::Active, "t1".into()).unwrap();
        assert_eq!(first.prev, None);
        assert!(tracker.observe(ProbeStatus::Active, "t2".into()).is_none());
        let change = tracker.observe(ProbeStatus::Inactive, "t3".into()).unwrap();
        assert_eq!(change.prev, Some(ProbeStatus::Active));
        assert_eq!(
            serde_json::to_value(&change).unwrap(),
            serde_json::json!({"timestamp": "t3", "status": "inactive", "prev": "active"})
        );
    }

    #[tokio::test]
    async fn test_probe() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_eq!(
            probe("127.0.0.1", port, Duration::from_secs(1)).await,
            ProbeStatus::Active
        );
        drop(listener);
        assert_eq!(
            probe("127.0.0.1", port, Duration::from_secs(1)).await,
            ProbeStatus::Inactive
        );
    }
}
