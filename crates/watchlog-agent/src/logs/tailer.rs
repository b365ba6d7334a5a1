// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Polling tailers: one for a single file, one that follows the newest file
//! of a directory.

use std::io;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

const READ_CHUNK: usize = 64 * 1024;
/// Bytes read by one poll at most; the rest is picked up by the next polls.
pub const MAX_READ_PER_POLL: u64 = 4 * 1024 * 1024;
/// A line growing past this without a newline is dropped.
pub const MAX_PARTIAL_LINE: usize = 1024 * 1024;

/// Reads what was appended to a file since the previous poll.
#[derive(Debug)]
pub struct FileTailer {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
    /// Inside an oversized line, skipping to its newline.
    discarding: bool,
}

impl FileTailer {
    /// Starts at the current end of the file; existing content is skipped.
    pub async fn attach_at_end(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let offset = tokio::fs::metadata(&path).await?.len();
        Ok(Self {
            path,
            offset,
            partial: Vec::new(),
            discarding: false,
        })
    }

    pub fn attach_at_start(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            partial: Vec::new(),
            discarding: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Complete lines appended since the last call, reading at most
    /// [`MAX_READ_PER_POLL`] bytes. A trailing line without newline is kept
    /// until it is finished. A file that shrank is read again from the start.
    pub async fn poll(&mut self) -> io::Result<Vec<String>> {
        let len = tokio::fs::metadata(&self.path).await?.len();
        if len < self.offset {
            debug!(
                "TAILER | {} shrank from {} to {len} bytes, restarting",
                self.path.display(),
                self.offset
            );
            self.offset = 0;
            self.partial.clear();
            self.discarding = false;
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut remaining = (len - self.offset).min(MAX_READ_PER_POLL);
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut lines = Vec::new();
        while remaining > 0 {
            let want = chunk.len().min(remaining as usize);
            let read = file.read(&mut chunk[..want]).await?;
            if read == 0 {
                break;
            }
            self.offset += read as u64;
            remaining -= read as u64;
            lines.extend(self.absorb(&chunk[..read]));
        }
        Ok(lines)
    }

    fn absorb(&mut self, mut bytes: &[u8]) -> Vec<String> {
        if self.discarding {
            let Some(newline) = bytes.iter().position(|byte| *byte == b'\n') else {
                return Vec::new();
            };
            bytes = &bytes[newline + 1..];
            self.discarding = false;
        }
        self.partial.extend_from_slice(bytes);
        let lines = self.complete_lines();
        if self.partial.len() > MAX_PARTIAL_LINE {
            warn!(
                "TAILER | Dropping a line longer than {MAX_PARTIAL_LINE} bytes in {}",
                self.path.display()
            );
            self.partial.clear();
            self.discarding = true;
        }
        lines
    }

    fn complete_lines(&mut self) -> Vec<String> {
        let Some(last_newline) = self.partial.iter().rposition(|byte| *byte == b'\n') else {
            return Vec::new();
        };
        let rest = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, rest);
        complete
            .split(|byte| *byte == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
            .filter(|line| !line.is_empty())
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect()
    }
}

fn has_extension(path: &Path, extension: Option<&str>) -> bool {
    match extension {
        None => true,
        Some(wanted) => path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(wanted)),
    }
}

/// Most recently modified regular file in `dir`, optionally filtered by extension.
pub async fn newest_file(dir: &Path, extension: Option<&str>) -> io::Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !has_extension(&path, extension) {
            continue;
        }
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if newest.as_ref().map_or(true, |(best, _)| modified > *best) {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

/// Tails the newest matching file of a directory and moves on when a newer
/// one shows up.
#[derive(Debug)]
pub struct DirectoryFollower {
    dir: PathBuf,
    extension: Option<String>,
    tailer: Option<FileTailer>,
}

impl DirectoryFollower {
    /// The file current at attach time is tailed from its end.
    pub async fn attach(dir: impl Into<PathBuf>, extension: Option<&str>) -> io::Result<Self> {
        let dir = dir.into();
        let tailer = match newest_file(&dir, extension).await? {
            Some(path) => Some(FileTailer::attach_at_end(path).await?),
            None => None,
        };
        Ok(Self {
            dir,
            extension: extension.map(str::to_string),
            tailer,
        })
    }

    pub fn current(&self) -> Option<&Path> {
        self.tailer.as_ref().map(FileTailer::path)
    }

    /// Switches to a newer file if there is one. A file picked up this way
    /// is read from its start. Returns whether the followed file changed.
    pub async fn rescan(&mut self) -> io::Result<bool> {
        let Some(newest) = newest_file(&self.dir, self.extension.as_deref()).await? else {
            return Ok(false);
        };
        if self.current() == Some(newest.as_path()) {
            return Ok(false);
        }
        debug!("TAILER | Following {}", newest.display());
        self.tailer = Some(FileTailer::attach_at_start(newest));
        Ok(true)
    }

    pub async fn poll(&mut self) -> io::Result<Vec<String>> {
        match self.tailer.as_mut() {
            Some(tailer) => tailer.poll().await,
            None => Ok(Vec::new()),
        }
    }
}

/// A configured log path: a file, or a directory whose newest file is followed.
#[derive(Debug)]
pub enum LogSource {
    File(FileTailer),
    Directory(DirectoryFollower),
}

impl LogSource {
    pub async fn open(path: &Path, extension: Option<&str>) -> io::Result<Self> {
        if tokio::fs::metadata(path).await?.is_dir() {
            Ok(LogSource::Directory(
                DirectoryFollower::attach(path, extension).await?,
            ))
        } else {
            Ok(LogSource::File(FileTailer::attach_at_end(path).await?))
        }
    }

    pub async fn poll(&mut self) -> io::Result<Vec<String>> {
        match self {
            LogSource::File(tailer) => tailer.poll().await,
            LogSource::Directory(follower) => follower.poll().await,
        }
    }

    pub async fn rescan(&mut self) -> io::Result<bool> {
        match self {
            LogSource::File(_) => Ok(false),
            LogSource::Directory(follower) => follower.rescan().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use std::time::Duration;

    fn append(path: &Path, text: &str) {
        let mut file = OpenOptions::new().append(true).create(true).open(path).unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn test_reads_only_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        fs::write(&path, "old line\n").unwrap();

        let mut tailer = FileTailer::attach_at_end(&path).await.unwrap();
        assert!(tailer.poll().await.unwrap().is_empty());

        append(&path, "first\nsecond\r\n\n");
        assert_eq!(tailer.poll().await.unwrap(), vec!["first", "second"]);
        assert!(tailer.poll().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_line_waits_for_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "").unwrap();
        let mut tailer = FileTailer::attach_at_end(&path).await.unwrap();

        append(&path, "hal");
        assert!(tailer.poll().await.unwrap().is_empty());
        append(&path, "f\nnext");
        assert_eq!(tailer.poll().await.unwrap(), vec!["half"]);
        append(&path, "\n");
        assert_eq!(tailer.poll().await.unwrap(), vec!["next"]);
    }

    #[tokio::test]
    async fn test_oversized_line_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "").unwrap();
        let mut tailer = FileTailer::attach_at_end(&path).await.unwrap();

        append(&path, &"x".repeat(MAX_PARTIAL_LINE + 10));
        assert!(tailer.poll().await.unwrap().is_empty());
        assert!(tailer.partial.is_empty());
        append(&path, &format!("{}\nafter\n", "y".repeat(100)));
        assert_eq!(tailer.poll().await.unwrap(), vec!["after"]);
    }

    #[tokio::test]
    async fn test_large_backlog_is_read_over_several_polls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "").unwrap();
        let mut tailer = FileTailer::attach_at_end(&path).await.unwrap();

        let line = "z".repeat(1023);
        let count = (MAX_READ_PER_POLL / 1024) as usize + 100;
        append(&path, &format!("{line}\n").repeat(count));

        let first = tailer.poll().await.unwrap();
        assert_eq!(first.len(), (MAX_READ_PER_POLL / 1024) as usize);
        assert_eq!(tailer.offset(), MAX_READ_PER_POLL);
        let second = tailer.poll().await.unwrap();
        assert_eq!(first.len() + second.len(), count);
        assert!(tailer.poll().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_truncation_restarts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "a long first line that will go away\n").unwrap();
        let mut tailer = FileTailer::attach_at_end(&path).await.unwrap();

        fs::write(&path, "fresh\n").unwrap();
        assert_eq!(tailer.poll().await.unwrap(), vec!["fresh"]);
        assert_eq!(tailer.offset(), 6);
    }

    #[tokio::test]
    async fn test_directory_follows_newest_file() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("u_ex240101.log");
        fs::write(&old, "before attach\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored\n").unwrap();

        let mut follower = DirectoryFollower::attach(dir.path(), Some("log")).await.unwrap();
        assert_eq!(follower.current(), Some(old.as_path()));
        append(&old, "on old\n");
        assert_eq!(follower.poll().await.unwrap(), vec!["on old"]);

        let new = dir.path().join("u_ex240102.log");
        fs::write(&new, "on new\n").unwrap();
        fs::File::options()
            .write(true)
            .open(&new)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();

        assert!(follower.rescan().await.unwrap());
        assert_eq!(follower.current(), Some(new.as_path()));
        assert_eq!(follower.poll().await.unwrap(), vec!["on new"]);
        assert!(!follower.rescan().await.unwrap());
    }

    #[tokio::test]
    async fn test_source_open_detects_directories() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("one.log");
        fs::write(&file, "").unwrap();

        assert!(matches!(
            LogSource::open(dir.path(), None).await.unwrap(),
            LogSource::Directory(_)
        ));
        assert!(matches!(
            LogSource::open(&file, None).await.unwrap(),
            LogSource::File(_)
        ));
        assert!(LogSource::open(&dir.path().join("missing.log"), None).await.is_err());
    }
}
