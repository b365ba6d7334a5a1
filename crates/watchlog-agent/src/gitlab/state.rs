// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! High-water marks and seen ids per (kind, project), persisted between runs.
//!
//! On disk the state keeps the flat layout
//! `{"lastSeen":{kind:{project:iso}},"seenUpdated":{kind:{project:{id:iso}}}}`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Ids remembered per (kind, project) before the oldest are evicted.
pub const SEEN_IDS_LIMIT: usize = 5000;
/// How many of the oldest ids are dropped once the limit is exceeded.
pub const SEEN_IDS_EVICTION: usize = 1000;

const OVERLAP: ChronoDuration = ChronoDuration::seconds(60);
const FIRST_POLL_LOOKBACK: ChronoDuration = ChronoDuration::hours(1);

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to access state file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("corrupt state file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Insertion ordered `id -> updated_at` map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeenIds {
    order: VecDeque<String>,
    updated: HashMap<String, DateTime<Utc>>,
}

impl SeenIds {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<DateTime<Utc>> {
        self.updated.get(id).copied()
    }

    /// Records `updated` for `id` unless an equal or newer value is already known.
    pub fn accept(&mut self, id: &str, updated: DateTime<Utc>) -> bool {
        match self.updated.get_mut(id) {
            Some(previous) if *previous >= updated => return false,
            Some(previous) => *previous = updated,
            None => {
                self.updated.insert(id.to_string(), updated);
                self.order.push_back(id.to_string());
            }
        }
        if self.order.len() > SEEN_IDS_LIMIT {
            for evicted in self.order.drain(..SEEN_IDS_EVICTION) {
                self.updated.remove(&evicted);
            }
        }
        true
    }
}

impl Serialize for SeenIds {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.order.len()))?;
        for id in &self.order {
            if let Some(updated) = self.updated.get(id) {
                map.serialize_entry(id, updated)?;
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for SeenIds {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SeenIdsVisitor;

        impl<'de> Visitor<'de> for SeenIdsVisitor {
            type Value = SeenIds;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of id to timestamp")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<SeenIds, A::Error> {
                let mut seen = SeenIds::default();
                while let Some((id, updated)) = access.next_entry::<String, DateTime<Utc>>()? {
                    seen.accept(&id, updated);
                }
                Ok(seen)
            }
        }

        deserializer.deserialize_map(SeenIdsVisitor)
    }
}

/// State of one kind for one project.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KindState {
    pub last_seen: Option<DateTime<Utc>>,
    pub seen: SeenIds,
}

impl KindState {
    /// Lower bound for the next fetch: the watermark (or an hour ago on the
    /// first poll) minus a one minute overlap.
    pub fn since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.last_seen.unwrap_or(now - FIRST_POLL_LOOKBACK) - OVERLAP
    }

    /// Moves the watermark forward; an older timestamp is ignored.
    pub fn advance(&mut self, newest: DateTime<Utc>) {
        if self.last_seen.map_or(true, |last| newest > last) {
            self.last_seen = Some(newest);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectState {
    pub pipelines: KindState,
    pub jobs: KindState,
    pub mrs: KindState,
    pub deployments: KindState,
}

impl ProjectState {
    fn kinds(&self) -> [(&'static str, &KindState); 4] {
        [
            ("pipelines", &self.pipelines),
            ("jobs", &self.jobs),
            ("mrs", &self.mrs),
            ("deployments", &self.deployments),
        ]
    }

    fn kind_mut(&mut self, kind: &str) -> Option<&mut KindState> {
        match kind {
            "pipelines" => Some(&mut self.pipelines),
            "jobs" => Some(&mut self.jobs),
            "mrs" => Some(&mut self.mrs),
            "deployments" => Some(&mut self.deployments),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    #[serde(default)]
    last_seen: BTreeMap<String, BTreeMap<String, DateTime<Utc>>>,
    #[serde(default)]
    seen_updated: BTreeMap<String, BTreeMap<String, SeenIds>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectorState {
    projects: BTreeMap<String, ProjectState>,
}

impl CollectorState {
    pub fn project(&self, project: &str) -> Option<&ProjectState> {
        self.projects.get(project)
    }

    pub fn project_mut(&mut self, project: &str) -> &mut ProjectState {
        self.projects.entry(project.to_string()).or_default()
    }

    /// A missing file yields an empty state.
    pub async fn load(path: &Path) -> Result<Self, StateError> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(StateError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::from_json(&contents).map_err(|source| StateError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Writes next to `path` first and renames, so a crash never leaves half a file.
    pub async fn save(&self, path: &Path) -> Result<(), StateError> {
        let io_err = |source| StateError::Io {
            path: path.to_path_buf(),
            source,
        };
        let contents = self.to_json().map_err(|source| StateError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, contents).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(io_err)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let mut snapshot = Snapshot::default();
        for (project, state) in &self.projects {
            for (kind, kind_state) in state.kinds() {
                if let Some(last_seen) = kind_state.last_seen {
                    snapshot
                        .last_seen
                        .entry(kind.to_string())
                        .or_default()
                        .insert(project.clone(), last_seen);
                }
                if !kind_state.seen.is_empty() {
                    snapshot
                        .seen_updated
                        .entry(kind.to_string())
                        .or_default()
                        .insert(project.clone(), kind_state.seen.clone());
                }
            }
        }
        serde_json::to_string(&snapshot)
    }

    pub fn from_json(contents: &str) -> Result<Self, serde_json::Error> {
        let snapshot: Snapshot = serde_json::from_str(contents)?;
        let mut state = Self::default();
        for (kind, projects) in snapshot.last_seen {
            for (project, last_seen) in projects {
                if let Some(kind_state) = state.project_mut(&project).kind_mut(&kind) {
                    kind_state.last_seen = Some(last_seen);
                }
            }
        }
        for (kind, projects) in snapshot.seen_updated {
            for (project, seen) in projects {
                if let Some(kind_state) = state.project_mut(&project).kind_mut(&kind) {
                    kind_state.seen = seen;
                }
            }
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn accepts_only_strictly_newer_updates() {
        let mut seen = SeenIds::default();
        assert!(seen.accept("1", at(10)));
        assert!(!seen.accept("1", at(10)));
        assert!(!seen.accept("1", at(5)));
        assert!(seen.accept("1", at(11)));
        assert_eq!(seen.get("1"), Some(at(11)));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn evicts_oldest_inserted_ids_past_the_limit() {
        let mut seen = SeenIds::default();
        for i in 0..=SEEN_IDS_LIMIT {
            seen.accept(&i.to_string(), at(i as i64));
        }
        assert_eq!(seen.len(), SEEN_IDS_LIMIT + 1 - SEEN_IDS_EVICTION);
        assert_eq!(seen.get("0"), None);
        assert_eq!(seen.get("999"), None);
        assert!(seen.get("1000").is_some());
        assert!(seen.get(&SEEN_IDS_LIMIT.to_string()).is_some());
    }

    #[test]
    fn since_uses_overlap_and_first_poll_lookback() {
        let now = at(10_000);
        let mut state = KindState::default();
        assert_eq!(state.since(now), now - ChronoDuration::seconds(3660));
        state.advance(at(500));
        assert_eq!(state.since(now), at(440));
    }

    #[test]
    fn watermark_never_moves_backwards() {
        let mut state = KindState::default();
        state.advance(at(100));
        state.advance(at(50));
        assert_eq!(state.last_seen, Some(at(100)));
        state.advance(at(150));
        assert_eq!(state.last_seen, Some(at(150)));
    }

    #[test]
    fn json_layout_round_trips() {
        let mut state = CollectorState::default();
        let project = state.project_mut("42");
        project.pipelines.advance(at(10));
        project.pipelines.seen.accept("7", at(10));
        project.mrs.seen.accept("3", at(4));

        let json = state.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(
            value["lastSeen"]["pipelines"]["42"],
            "2023-11-14T22:13:30Z"
        );
        assert!(value["seenUpdated"]["mrs"]["42"]["3"].is_string());

        assert_eq!(CollectorState::from_json(&json).unwrap(), state);
    }

    #[test]
    fn reads_millisecond_timestamps() {
        let state = CollectorState::from_json(
            r#"{"lastSeen":{"jobs":{"group/app":"2024-05-01T10:00:00.000Z"}},
                "seenUpdated":{"jobs":{"group/app":{"9":"2024-05-01T09:59:00.000Z"}},"unknown":{}}}"#,
        )
        .unwrap();
        let project = state.project("group/app").unwrap();
        assert_eq!(
            project.jobs.last_seen.unwrap().to_rfc3339(),
            "2024-05-01T10:00:00+00:00"
        );
        assert_eq!(project.jobs.seen.len(), 1);
    }

    #[tokio::test]
    async fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gitlab-state.json");
        assert_eq!(
            CollectorState::load(&path).await.unwrap(),
            CollectorState::default()
        );

        let mut state = CollectorState::default();
        state.project_mut("1").deployments.advance(at(1));
        state.save(&path).await.unwrap();
        assert_eq!(CollectorState::load(&path).await.unwrap(), state);

        tokio::fs::write(&path, "{broken").await.unwrap();
        assert!(matches!(
            CollectorState::load(&path).await,
            Err(StateError::Corrupt { .. })
        ));
    }
}
