// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable position markers for resumable readers.
//!
//! A cursor file holds exactly one record: the token written at offset 0 and
//! zero-padded to `CURSOR_SLOT_LEN` bytes. Commits overwrite the slot in place.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::errors::CursorError;

/// Size of the on-disk cursor record.
pub const CURSOR_SLOT_LEN: usize = 256;

pub trait CursorTracker: Send {
    /// Persists `cursor` as the last processed position.
    fn commit_cursor(&mut self, cursor: &str) -> Result<(), CursorError>;

    /// Returns the last committed cursor, or `None` when nothing was ever
    /// committed.
    fn last_cursor(&mut self) -> Result<Option<String>, CursorError>;
}

/// Tracker for readers configured without persistence.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCursorTracker;

impl CursorTracker for NoopCursorTracker {
    fn commit_cursor(&mut self, _cursor: &str) -> Result<(), CursorError> {
        Ok(())
    }

    fn last_cursor(&mut self) -> Result<Option<String>, CursorError> {
        Ok(None)
    }
}

#[derive(Debug)]
pub struct FileCursorTracker {
    file: File,
    sync_every: u64,
    commits: u64,
}

impl FileCursorTracker {
    /// Opens or creates the cursor file. `sync_every` forces the record to
    /// disk every N commits; 0 leaves flushing to the OS.
    pub fn open(path: impl AsRef<Path>, sync_every: u64) -> Result<Self, CursorError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(FileCursorTracker {
            file,
            sync_every,
            commits: 0,
        })
    }

    #[must_use]
    pub fn commits(&self) -> u64 {
        self.commits
    }
}

impl CursorTracker for FileCursorTracker {
    fn commit_cursor(&mut self, cursor: &str) -> Result<(), CursorError> {
        let mut slot = [0u8; CURSOR_SLOT_LEN];
        let mut len = cursor.len().min(CURSOR_SLOT_LEN);
        while !cursor.is_char_boundary(len) {
            len -= 1;
        }
        slot[..len].copy_from_slice(&cursor.as_bytes()[..len]);

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&slot)?;

        self.commits += 1;
        if self.sync_every > 0 && self.commits % self.sync_every == 0 {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn last_cursor(&mut self) -> Result<Option<String>, CursorError> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut slot = Vec::with_capacity(CURSOR_SLOT_LEN);
        (&mut self.file)
            .take(CURSOR_SLOT_LEN as u64)
            .read_to_end(&mut slot)?;

        let end = slot.iter().position(|b| *b == 0).unwrap_or(slot.len());
        let cursor = std::str::from_utf8(&slot[..end]).map_err(|_| CursorError::InvalidUtf8)?;
        let cursor = cursor.trim();
        if cursor.is_empty() {
            Ok(None)
        } else {
            Ok(Some(cursor.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_has_no_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = FileCursorTracker::open(dir.path().join("cursor"), 0).unwrap();
        assert_eq!(tracker.last_cursor().unwrap(), None);
    }

    #[test]
    fn test_cursor_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor");

        let mut tracker = FileCursorTracker::open(&path, 1).unwrap();
        tracker.commit_cursor("s=abc;i=1").unwrap();
        tracker.commit_cursor("s=abc;i=2").unwrap();
        drop(tracker);

        let mut tracker = FileCursorTracker::open(&path, 1).unwrap();
        assert_eq!(tracker.last_cursor().unwrap().as_deref(), Some("s=abc;i=2"));
    }

    #[test]
    fn test_shorter_cursor_overwrites_longer_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = FileCursorTracker::open(dir.path().join("cursor"), 0).unwrap();

        tracker.commit_cursor("s=0123456789abcdef;i=100").unwrap();
        tracker.commit_cursor("s=0;i=2").unwrap();

        assert_eq!(tracker.last_cursor().unwrap().as_deref(), Some("s=0;i=2"));
        assert_eq!(
            std::fs::metadata(dir.path().join("cursor")).unwrap().len(),
            CURSOR_SLOT_LEN as u64
        );
    }

    #[test]
    fn test_long_cursor_is_truncated_to_slot() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = FileCursorTracker::open(dir.path().join("cursor"), 0).unwrap();
        let long = "x".repeat(CURSOR_SLOT_LEN + 40);

        tracker.commit_cursor(&long).unwrap();

        assert_eq!(
            tracker.last_cursor().unwrap().map(|c| c.len()),
            Some(CURSOR_SLOT_LEN)
        );
    }

    #[test]
    fn test_truncation_keeps_whole_characters() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = FileCursorTracker::open(dir.path().join("cursor"), 0).unwrap();
        let long = format!("x{}", "é".repeat(CURSOR_SLOT_LEN));

        tracker.commit_cursor(&long).unwrap();

        let stored = tracker.last_cursor().unwrap().unwrap();
        assert_eq!(stored.len(), CURSOR_SLOT_LEN - 1);
        assert!(long.starts_with(&stored));
    }

    #[test]
    fn test_whitespace_only_file_has_no_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor");
        std::fs::write(&path, "  \n").unwrap();

        let mut tracker = FileCursorTracker::open(&path, 0).unwrap();
        assert_eq!(tracker.last_cursor().unwrap(), None);
    }

    #[test]
    fn test_commit_counter() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = FileCursorTracker::open(dir.path().join("cursor"), 2).unwrap();
        for i in 0..5 {
            tracker.commit_cursor(&format!("i={i}")).unwrap();
        }
        assert_eq!(tracker.commits(), 5);
    }

    #[test]
    fn test_open_fails_for_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let result = FileCursorTracker::open(dir.path().join("missing").join("cursor"), 0);
        assert!(matches!(result, Err(CursorError::Io(_))));
    }

    #[test]
    fn test_noop_tracker() {
        let mut tracker = NoopCursorTracker;
        tracker.commit_cursor("anything").unwrap();
        assert_eq!(tracker.last_cursor().unwrap(), None);
    }
}
