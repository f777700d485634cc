//! Durable resume cursors.
//!
//! The cursor advances only after Switchboard accepts an event; a
//! crash between provider receipt and acceptance replays the event,
//! and the dedupe key absorbs the replay. Writes are
//! atomic (temp file + rename) so a torn write never corrupts the
//! cursor. Concurrent connector instances use distinct cursor files.

use std::path::{Path, PathBuf};

use crate::error::ConnectorResult;

/// A file-backed cursor.
#[derive(Debug, Clone)]
pub struct FileCursor {
    path: PathBuf,
}

impl FileCursor {
    /// Create a cursor at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The cursor file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored position, `None` when never written.
    ///
    /// # Errors
    ///
    /// Returns IO failures other than not-found.
    pub fn load(&self) -> ConnectorResult<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(value) => {
                let trimmed = value.trim().to_owned();
                Ok((!trimmed.is_empty()).then_some(trimmed))
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a new position atomically.
    ///
    /// # Errors
    ///
    /// Returns IO failures.
    pub fn store(&self, position: &str) -> ConnectorResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, position)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_cursor_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = FileCursor::new(dir.path().join("telegram.cursor"));
        assert_eq!(cursor.load().unwrap(), None);
    }

    #[test]
    fn store_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = FileCursor::new(dir.path().join("telegram.cursor"));
        cursor.store("42").unwrap();
        assert_eq!(cursor.load().unwrap().as_deref(), Some("42"));
        cursor.store("43").unwrap();
        assert_eq!(cursor.load().unwrap().as_deref(), Some("43"));
    }

    #[test]
    fn store_creates_missing_parents() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = FileCursor::new(dir.path().join("nested/deeper/email.cursor"));
        cursor.store("<msg-1@mail>").unwrap();
        assert_eq!(cursor.load().unwrap().as_deref(), Some("<msg-1@mail>"));
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = FileCursor::new(dir.path().join("c.cursor"));
        cursor.store("1").unwrap();
        assert!(!dir.path().join("c.tmp").exists());
    }
}
