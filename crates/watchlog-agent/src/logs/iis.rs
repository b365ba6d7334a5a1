// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! IIS W3C log monitor with a site run-state side channel.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, IntegrationDescriptor};
use crate::event::{Event, EventSink};
use crate::logs::access::{AccessBuffer, AccessEntry, AccessSource};
use crate::logs::normalize::PathNormalizer;
use crate::logs::tailer::DirectoryFollower;
use crate::logs::{FLUSH_INTERVAL, POLL_INTERVAL, RESCAN_INTERVAL};

pub const DEFAULT_LOG_ROOT: &str = r"C:\inetpub\logs\LogFiles";
const STATE_INTERVAL: Duration = Duration::from_secs(5);
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);
const FIELDS_DIRECTIVE: &str = "#Fields:";

#[derive(Debug, Default, Deserialize)]
struct StaticFieldIndexes {
    #[serde(rename = "sc-status")]
    status: Option<usize>,
    #[serde(rename = "time-taken")]
    time_taken: Option<usize>,
    #[serde(rename = "cs-method")]
    method: Option<usize>,
    #[serde(rename = "cs-uri-stem")]
    url: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IisSettings {
    log_root: Option<PathBuf>,
    field_indexes: Option<StaticFieldIndexes>,
}

/// Column positions of the fields a request line is reduced to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLayout {
    pub status: usize,
    pub time_taken: Option<usize>,
    pub method: Option<usize>,
    pub url: Option<usize>,
}

impl FieldLayout {
    /// Reads a `#Fields:` directive. `None` when `sc-status` is not listed.
    pub fn from_header(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.strip_prefix("#Fields:")?.split_whitespace().collect();
        let position = |name: &str| fields.iter().position(|field| *field == name);
        Some(Self {
            status: position("sc-status")?,
            time_taken: position("time-taken"),
            method: position("cs-method"),
            url: position("cs-uri-stem"),
        })
    }

    fn widest(&self) -> usize {
        [Some(self.status), self.method, self.url]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(self.status)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IisConfig {
    pub log_root: PathBuf,
    /// Used for files that carry no `#Fields:` header.
    pub field_indexes: Option<FieldLayout>,
}

impl IisConfig {
    pub fn from_descriptor(descriptor: &IntegrationDescriptor) -> Result<Self, ConfigError> {
        let settings: IisSettings =
            descriptor
                .settings_as()
                .map_err(|e| ConfigError::Integration {
                    service: "iis",
                    reason: e.to_string(),
                })?;
        let field_indexes = match settings.field_indexes {
            None => None,
            Some(indexes) => {
                let Some(status) = indexes.status else {
                    return Err(ConfigError::Integration {
                        service: "iis",
                        reason: "fieldIndexes is missing sc-status".to_string(),
                    });
                };
                Some(FieldLayout {
                    status,
                    time_taken: indexes.time_taken,
                    method: indexes.method,
                    url: indexes.url,
                })
            }
        };
        Ok(Self {
            log_root: settings
                .log_root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_ROOT)),
            field_indexes,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    /// No header seen yet for the current file.
    Pending,
    Known(FieldLayout),
    /// The header lacks `sc-status`.
    Unusable,
}

/// Per-file line parser. Tracks the `#Fields:` directive of the file.
#[derive(Debug)]
pub struct W3cParser {
    layout: Layout,
    fallback: Option<FieldLayout>,
}

impl W3cParser {
    pub fn new(fallback: Option<FieldLayout>) -> Self {
        Self {
            layout: Layout::Pending,
            fallback,
        }
    }

    /// Forgets the header of the previous file.
    pub fn reset(&mut self) {
        self.layout = Layout::Pending;
    }

    /// Takes the columns from a `#Fields:` directive.
    pub fn prime(&mut self, header: &str) {
        self.layout = match FieldLayout::from_header(header) {
            Some(layout) => Layout::Known(layout),
            None => Layout::Unusable,
        };
    }

    pub fn parse(
        &mut self,
        line: &str,
        origin: &str,
        timestamp: &str,
        normalizer: &PathNormalizer,
    ) -> Option<AccessEntry> {
        if line.starts_with(FIELDS_DIRECTIVE) {
            self.prime(line);
            return None;
        }
        if line.starts_with('#') {
            return None;
        }

        let layout = match self.layout {
            Layout::Known(layout) => layout,
            Layout::Unusable => return None,
            Layout::Pending => match self.fallback {
                Some(layout) => {
                    self.layout = Layout::Known(layout);
                    layout
                }
                None => {
                    debug!("IIS | No #Fields header or fieldIndexes for {origin}, skipping line");
                    return None;
                }
            },
        };

        let line = line.trim();
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() <= layout.widest() {
            return None;
        }
        let status = parts[layout.status].parse::<u16>().ok()?;
        let duration_ms = layout
            .time_taken
            .and_then(|i| parts.get(i))
            .and_then(|value| value.parse::<f64>().ok())
            .unwrap_or(0.0);
        let method = layout.method.and_then(|i| parts.get(i)).unwrap_or(&"UNKNOWN");
        let url = layout.url.and_then(|i| parts.get(i)).unwrap_or(&"/");

        Some(AccessEntry {
            timestamp: timestamp.to_string(),
            origin: origin.to_string(),
            method: (*method).to_string(),
            path: normalizer.normalize(url),
            status,
            duration_ms,
            raw: line.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteState {
    pub name: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteStatusChange {
    pub name: String,
    pub old_state: Option<String>,
    pub new_state: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiteSnapshot {
    pub timestamp: String,
    pub sites: Vec<SiteState>,
}

/// Last known run state per site.
#[derive(Debug, Default)]
pub struct SiteStateTracker {
    known: HashMap<String, String>,
}

impl SiteStateTracker {
    /// Changes for sites that are new or whose state moved.
    pub fn observe(&mut self, sites: &[SiteState], timestamp: &str) -> Vec<SiteStatusChange> {
        let mut changes = Vec::new();
        for site in sites {
            let previous = self.known.insert(site.name.clone(), site.state.clone());
            if previous.as_deref() != Some(site.state.as_str()) {
                changes.push(SiteStatusChange {
                    name: site.name.clone(),
                    old_state: previous,
                    new_state: site.state.clone(),
                    timestamp: timestamp.to_string(),
                });
            }
        }
        changes
    }
}

/// The web server's site registry.
#[async_trait]
pub trait SiteDirectory: Send + Sync {
    /// Log folder name (`W3SVC<id>`) to site name.
    async fn folder_names(&self) -> BTreeMap<String, String>;

    async fn site_states(&self) -> Vec<SiteState>;
}

/// Queries `Get-Website` through PowerShell.
#[derive(Debug, Default)]
pub struct PowerShellSites;

impl PowerShellSites {
    async fn query(&self, script: &str) -> Option<String> {
        let output = Command::new("powershell")
            .args(["-NoProfile", "-Command", script])
            .output()
            .await;
        match output {
            Ok(output) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(output) => {
                debug!("IIS | `{script}` exited with {}", output.status);
                None
            }
            Err(e) => {
                debug!("IIS | Could not run powershell: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl SiteDirectory for PowerShellSites {
    async fn folder_names(&self) -> BTreeMap<String, String> {
        self.query("Get-Website | Select-Object ID, Name | ConvertTo-Json")
            .await
            .map(|stdout| parse_site_map(&stdout))
            .unwrap_or_default()
    }

    async fn site_states(&self) -> Vec<SiteState> {
        self.query("Get-Website | Select-Object Name, State | ConvertTo-Json")
            .await
            .map(|stdout| parse_site_states(&stdout))
            .unwrap_or_default()
    }
}

/// `ConvertTo-Json` prints a bare object for a single site.
fn json_list(stdout: &str) -> Vec<Value> {
    match serde_json::from_str::<Value>(stdout.trim()) {
        Ok(Value::Array(items)) => items,
        Ok(item @ Value::Object(_)) => vec![item],
        Ok(_) => Vec::new(),
        Err(e) => {
            warn!("IIS | Failed to parse Get-Website output: {e}");
            Vec::new()
        }
    }
}

fn field<'a>(item: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| item.get(*name)).filter(|v| !v.is_null())
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn parse_site_map(stdout: &str) -> BTreeMap<String, String> {
    json_list(stdout)
        .iter()
        .filter_map(|site| {
            let id = field(site, &["ID", "id", "Id"]).and_then(text)?;
            let name = field(site, &["Name", "name"]).and_then(text)?;
            Some((format!("W3SVC{id}"), name))
        })
        .collect()
}

pub fn parse_site_states(stdout: &str) -> Vec<SiteState> {
    json_list(stdout)
        .iter()
        .filter_map(|site| {
            let name = field(site, &["Name", "name"]).and_then(text)?;
            let state = field(site, &["State", "state"])
                .and_then(text)
                .unwrap_or_else(|| "Unknown".to_string());
            Some(SiteState { name, state })
        })
        .collect()
}

/// The last `#Fields:` directive already present in `path`. Only the
/// header is kept; the request lines before it are not replayed.
pub async fn last_fields_directive(path: &Path) -> io::Result<Option<String>> {
    let mut reader = BufReader::new(tokio::fs::File::open(path).await?);
    let mut line = Vec::new();
    let mut last = None;
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        if line.starts_with(FIELDS_DIRECTIVE.as_bytes()) {
            last = Some(String::from_utf8_lossy(&line).trim_end().to_string());
        }
    }
    Ok(last)
}

struct SiteTail {
    name: String,
    follower: DirectoryFollower,
    parser: W3cParser,
    buffer: AccessBuffer,
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub struct IisMonitor {
    config: IisConfig,
    directory: Arc<dyn SiteDirectory>,
    sink: Arc<dyn EventSink>,
    normalizer: PathNormalizer,
    /// Keyed by log folder.
    sites: BTreeMap<String, SiteTail>,
    states: SiteStateTracker,
    last_states: Option<Vec<SiteState>>,
}

impl IisMonitor {
    pub fn new(
        config: IisConfig,
        directory: Arc<dyn SiteDirectory>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            config,
            directory,
            sink,
            normalizer: PathNormalizer::new()?,
            sites: BTreeMap::new(),
            states: SiteStateTracker::default(),
            last_states: None,
        })
    }

    pub fn site_names(&self) -> Vec<&str> {
        self.sites.values().map(|site| site.name.as_str()).collect()
    }

    /// Attaches to site folders not followed yet. Folders without a known
    /// site keep their folder name.
    pub async fn discover(&mut self) {
        let mut entries = match tokio::fs::read_dir(&self.config.log_root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    "IIS | Cannot read log root {}: {e}",
                    self.config.log_root.display()
                );
                return;
            }
        };

        let mut folders = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
                    let folder = entry.file_name().to_string_lossy().into_owned();
                    if is_dir && !self.sites.contains_key(&folder) {
                        folders.push(folder);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("IIS | Error listing log root: {e}");
                    break;
                }
            }
        }
        if folders.is_empty() {
            return;
        }

        let names = self.directory.folder_names().await;
        for folder in folders {
            let path = self.config.log_root.join(&folder);
            let name = names.get(&folder).cloned().unwrap_or_else(|| folder.clone());
            match DirectoryFollower::attach(&path, Some("log")).await {
                Ok(follower) => {
                    info!("IIS | Tailing site {name} from {}", path.display());
                    // the tail starts at the end, the header sits at the top
                    let mut parser = W3cParser::new(self.config.field_indexes);
                    if let Some(current) = follower.current() {
                        match last_fields_directive(current).await {
                            Ok(Some(header)) => parser.prime(&header),
                            Ok(None) => {}
                            Err(e) => debug!(
                                "IIS | Cannot read header of {}: {e}",
                                current.display()
                            ),
                        }
                    }
                    self.sites.insert(
                        folder,
                        SiteTail {
                            name,
                            follower,
                            parser,
                            buffer: AccessBuffer::new(AccessSource::Iis),
                        },
                    );
                }
                Err(e) => warn!("IIS | Cannot follow {}: {e}", path.display()),
            }
        }
    }

    /// Switches each site to its newest log file and picks up new sites.
    pub async fn rescan(&mut self) {
        for site in self.sites.values_mut() {
            match site.follower.rescan().await {
                Ok(true) => site.parser.reset(),
                Ok(false) => {}
                Err(e) => debug!("IIS | Rescan of {} failed: {e}", site.name),
            }
        }
        self.discover().await;
    }

    pub async fn poll_logs(&mut self) {
        let timestamp = now_iso();
        for site in self.sites.values_mut() {
            let lines = match site.follower.poll().await {
                Ok(lines) => lines,
                Err(e) => {
                    debug!("IIS | Tail error for {}: {e}", site.name);
                    continue;
                }
            };
            for line in lines {
                if let Some(entry) =
                    site.parser
                        .parse(&line, &site.name, &timestamp, &self.normalizer)
                {
                    site.buffer.push(entry, self.sink.as_ref());
                }
            }
        }
    }

    pub fn flush(&mut self) {
        for site in self.sites.values_mut() {
            site.buffer.flush(self.sink.as_ref());
        }
    }

    pub async fn check_states(&mut self) {
        let sites = self.directory.site_states().await;
        for change in self.states.observe(&sites, &now_iso()) {
            self.sink.emit(Event::SiteStatus(change));
        }
        self.last_states = Some(sites);
    }

    /// Republishes the latest polled states. Nothing before the first poll.
    pub fn emit_snapshot(&self) {
        if let Some(sites) = &self.last_states {
            self.sink.emit(Event::SiteSnapshot(SiteSnapshot {
                timestamp: now_iso(),
                sites: sites.clone(),
            }));
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!("IIS | Watching {}", self.config.log_root.display());
        self.discover().await;

        let mut poll_tick = interval(POLL_INTERVAL);
        let mut flush_tick = interval(FLUSH_INTERVAL);
        let mut state_tick = interval(STATE_INTERVAL);
        let mut snapshot_tick = interval(SNAPSHOT_INTERVAL);
        let mut rescan_tick = interval(RESCAN_INTERVAL);
        for tick in [
            &mut poll_tick,
            &mut flush_tick,
            &mut state_tick,
            &mut snapshot_tick,
            &mut rescan_tick,
        ] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }
        flush_tick.tick().await;
        snapshot_tick.tick().await;
        rescan_tick.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = poll_tick.tick() => self.poll_logs().await,
                _ = flush_tick.tick() => self.flush(),
                _ = state_tick.tick() => self.check_states().await,
                _ = snapshot_tick.tick() => self.emit_snapshot(),
                _ = rescan_tick.tick() => self.rescan().await,
            }
        }
        self.flush();
    }
}
