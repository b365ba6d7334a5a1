// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Generic application-log tailing driven by `log-watchlist.json`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::{Event, EventSink};
use crate::logs::tailer::LogSource;
use crate::logs::{POLL_INTERVAL, RESCAN_INTERVAL};

const DEDUP_WINDOW: Duration = Duration::from_secs(5);
const DEFAULT_LEVEL: &str = "INFO";

const AUTO_PATTERNS: &[(&str, &str)] = &[
    ("nginx", r#"^(\S+) - - \[(.*?)\] "(.*?)" (\d+) (\d+) "(.*?)" "(.*?)""#),
    ("pm2", r"^\[(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})\] \[([A-Z]+)\] (.+)$"),
    ("redis", r"^\d{2} \w{3} \d{2}:\d{2}:\d{2} (\w+): (.*)$"),
    ("mysql", r"^\d{6} \s+\d{1,2}:\d{2}:\d{2} \[\w+\] (\w+): (.*)$"),
    ("docker", r"^(\S{24}) (\S+) (\S+) (\[.*?\]) (.*)$"),
    (
        "postgresql",
        r"^(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2} [A-Z]+) \[(\d+)\]: \[([A-Z]+)\] (.+)$",
    ),
    (
        "mongodb",
        r"^(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}.\d+Z) (\[.*?\]) (\S+) (.*)$",
    ),
];
const DEFAULT_AUTO_PATTERN: &str = r"^(.*?)\s+(\w+):\s+(.*)$";
const LEVEL_PATTERN: &str =
    r"(?i)\b(INFO|WARNING|ERROR|DEBUG|FATAL|CRITICAL|NOTICE|TRACE|VERBOSE|I|E|W|F|D|C|N)\b";

#[derive(Debug, thiserror::Error)]
pub enum WatchlistError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid pattern for {name}: {source}")]
    Pattern { name: String, source: regex::Error },
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchTarget {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WatchlistFile {
    #[serde(default)]
    logs: Vec<WatchTarget>,
}

#[derive(Debug, Clone)]
pub enum LineFormat {
    /// Line forwarded as is.
    Plain,
    /// Built-in pattern chosen by service.
    Auto,
    /// User pattern with `date`, `level` and `message` groups.
    Custom(Regex),
}

#[derive(Debug, Clone)]
pub struct CompiledTarget {
    pub target: WatchTarget,
    pub format: LineFormat,
}

#[derive(Debug, Clone)]
pub struct Watchlist {
    pub targets: Vec<CompiledTarget>,
}

impl Watchlist {
    /// `Ok(None)` when the file does not exist.
    pub async fn load(path: &Path) -> Result<Option<Self>, WatchlistError> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(WatchlistError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let file: WatchlistFile =
            serde_json::from_str(&contents).map_err(|source| WatchlistError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::compile(file.logs).map(Some)
    }

    /// Makes names unique and compiles custom patterns. One bad pattern
    /// rejects the whole list.
    pub fn compile(mut targets: Vec<WatchTarget>) -> Result<Self, WatchlistError> {
        dedupe_names(&mut targets);
        let targets = targets
            .into_iter()
            .map(|target| {
                let format = match (target.format.as_deref(), target.pattern.as_deref()) {
                    (Some("custom"), Some(pattern)) => LineFormat::Custom(
                        Regex::new(pattern).map_err(|source| WatchlistError::Pattern {
                            name: target.name.clone(),
                            source,
                        })?,
                    ),
                    (Some("auto"), _) => LineFormat::Auto,
                    _ => LineFormat::Plain,
                };
                Ok(CompiledTarget { target, format })
            })
            .collect::<Result<Vec<_>, WatchlistError>>()?;
        Ok(Self { targets })
    }
}

/// Repeated names become `name (1)`, `name (2)`, ...
fn dedupe_names(targets: &mut [WatchTarget]) {
    let mut used = HashSet::new();
    for target in targets.iter_mut() {
        let mut name = target.name.clone();
        let mut counter = 1;
        while used.contains(&name) {
            name = format!("{} ({counter})", target.name);
            counter += 1;
        }
        used.insert(name.clone());
        target.name = name;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchlistEntry {
    pub date: String,
    pub level: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub name: String,
}

/// Messages emitted within the dedup window.
#[derive(Debug, Default)]
pub struct RecentMessages {
    seen: HashMap<String, Instant>,
}

impl RecentMessages {
    pub fn admit(&mut self, message: &str, now: Instant) -> bool {
        self.seen
            .retain(|_, at| now.saturating_duration_since(*at) < DEDUP_WINDOW);
        if self.seen.contains_key(message) {
            return false;
        }
        self.seen.insert(message.to_string(), now);
        true
    }
}

/// Best effort timestamp parsing. Naive times are taken as UTC.
pub fn parse_loose_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(date) = DateTime::parse_from_rfc3339(value) {
        return Some(date.with_timezone(&Utc));
    }
    if let Ok(date) = DateTime::parse_from_str(value, "%d/%b/%Y:%H:%M:%S %z") {
        return Some(date.with_timezone(&Utc));
    }
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn iso(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub struct LineParser {
    auto: HashMap<&'static str, Regex>,
    fallback: Regex,
    level: Regex,
}

impl LineParser {
    pub fn new() -> Result<Self, regex::Error> {
        let auto = AUTO_PATTERNS
            .iter()
            .map(|(service, pattern)| Ok((*service, Regex::new(pattern)?)))
            .collect::<Result<HashMap<_, _>, regex::Error>>()?;
        Ok(Self {
            auto,
            fallback: Regex::new(DEFAULT_AUTO_PATTERN)?,
            level: Regex::new(LEVEL_PATTERN)?,
        })
    }

    /// First level keyword of `text`, short forms expanded.
    pub fn detect_level(&self, text: &str) -> String {
        let Some(found) = self.level.captures(text).and_then(|c| c.get(1)) else {
            return DEFAULT_LEVEL.to_string();
        };
        let level = found.as_str().to_uppercase();
        match level.as_str() {
            "I" => "INFO",
            "E" => "ERROR",
            "W" => "WARNING",
            "F" => "FATAL",
            "D" => "DEBUG",
            "C" => "CRITICAL",
            "N" => "NOTICE",
            other => other,
        }
        .to_string()
    }

    pub fn parse(
        &self,
        target: &CompiledTarget,
        line: &str,
        recent: &mut RecentMessages,
    ) -> Option<WatchlistEntry> {
        self.parse_at(target, line, recent, Utc::now(), Instant::now())
    }

    fn parse_at(
        &self,
        target: &CompiledTarget,
        line: &str,
        recent: &mut RecentMessages,
        now: DateTime<Utc>,
        instant: Instant,
    ) -> Option<WatchlistEntry> {
        if line.trim().is_empty() {
            return None;
        }
        let mut entry = WatchlistEntry {
            date: iso(now),
            level: DEFAULT_LEVEL.to_string(),
            message: line.to_string(),
            service: target.target.service.clone(),
            name: target.target.name.clone(),
        };

        match &target.format {
            LineFormat::Plain => {}
            LineFormat::Custom(pattern) => {
                if let Some(captures) = pattern.captures(line) {
                    if let Some(date) = captures
                        .name("date")
                        .and_then(|d| parse_loose_date(&d.as_str().replace('/', "-")))
                    {
                        entry.date = iso(date);
                    }
                    if let Some(level) = captures.name("level").filter(|l| !l.as_str().is_empty())
                    {
                        entry.level = level.as_str().to_string();
                    }
                    if let Some(message) = captures
                        .name("message")
                        .map(|m| m.as_str().trim())
                        .filter(|m| !m.is_empty())
                    {
                        entry.message = message.to_string();
                    }
                    if !recent.admit(&entry.message, instant) {
                        return None;
                    }
                }
            }
            LineFormat::Auto => {
                let pattern = target
                    .target
                    .service
                    .as_deref()
                    .and_then(|service| self.auto.get(service))
                    .unwrap_or(&self.fallback);
                if let Some(captures) = pattern.captures(line) {
                    let group = |i: usize| captures.get(i).map(|m| m.as_str()).filter(|s| !s.is_empty());
                    if let Some(date) = group(1).and_then(parse_loose_date) {
                        entry.date = iso(date);
                    }
                    entry.level = self.detect_level(group(2).or(group(3)).unwrap_or(line));
                    if let Some(message) = group(3) {
                        entry.message = message.to_string();
                    }
                }
            }
        }
        Some(entry)
    }
}

struct Tail {
    target: CompiledTarget,
    source: LogSource,
    recent: RecentMessages,
}

pub struct WatchlistMonitor {
    parser: LineParser,
    tails: Vec<Tail>,
    sink: Arc<dyn EventSink>,
}

impl WatchlistMonitor {
    /// Opens every target. Paths that do not exist are skipped.
    pub async fn open(watchlist: Watchlist, sink: Arc<dyn EventSink>) -> Result<Self, regex::Error> {
        let mut tails = Vec::new();
        for target in watchlist.targets {
            match LogSource::open(&target.target.path, None).await {
                Ok(source) => {
                    info!(
                        "WATCHLIST | Monitoring {} ({})",
                        target.target.name,
                        target.target.path.display()
                    );
                    tails.push(Tail {
                        target,
                        source,
                        recent: RecentMessages::default(),
                    });
                }
                Err(e) => warn!(
                    "WATCHLIST | Skipping {}: {e}",
                    target.target.path.display()
                ),
            }
        }
        Ok(Self {
            parser: LineParser::new()?,
            tails,
            sink,
        })
    }

    pub fn watched(&self) -> Vec<&str> {
        self.tails
            .iter()
            .map(|tail| tail.target.target.name.as_str())
            .collect()
    }

    pub async fn poll(&mut self) {
        for tail in &mut self.tails {
            let lines = match tail.source.poll().await {
                Ok(lines) => lines,
                Err(e) => {
                    debug!("WATCHLIST | Tail error for {}: {e}", tail.target.target.name);
                    continue;
                }
            };
            for line in lines {
                if let Some(entry) = self.parser.parse(&tail.target, &line, &mut tail.recent) {
                    self.sink.emit(Event::Watchlist(entry));
                }
            }
        }
    }

    pub async fn rescan(&mut self) {
        for tail in &mut self.tails {
            if let Err(e) = tail.source.rescan().await {
                debug!("WATCHLIST | Rescan of {} failed: {e}", tail.target.target.name);
            }
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        if self.tails.is_empty() {
            info!("WATCHLIST | Nothing to monitor");
            return;
        }
        let mut poll_tick = interval(POLL_INTERVAL);
        let mut rescan_tick = interval(RESCAN_INTERVAL);
        poll_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        rescan_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        rescan_tick.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = poll_tick.tick() => self.poll().await,
                _ = rescan_tick.tick() => self.rescan().await,
            }
        }
    }
}
