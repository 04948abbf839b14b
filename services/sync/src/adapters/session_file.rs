//! services/sync/src/adapters/session_file.rs
//!
//! An adapter that implements the `SessionPersistence` port over a small JSON
//! token file on local disk. Reads and writes are plain synchronous file I/O so
//! the session store can seed itself without touching the network.

use spirit_core::domain::AuthSession;
use spirit_core::ports::{PortError, PortResult, SessionPersistence};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct FileSessionAdapter {
    path: PathBuf,
}

impl FileSessionAdapter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn io_error(e: std::io::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

impl SessionPersistence for FileSessionAdapter {
    fn load(&self) -> PortResult<Option<AuthSession>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| PortError::Decode(format!("{}: {}", self.path.display(), e)))
    }

    fn save(&self, session: &AuthSession) -> PortResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let json = serde_json::to_vec_pretty(session)
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        // Write-then-rename so a crash never leaves a half-written token.
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, json).map_err(io_error)?;
        fs::rename(&staging, &self.path).map_err(io_error)?;
        debug!(path = %self.path.display(), "Session persisted");
        Ok(())
    }

    fn clear(&self) -> PortResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn adapter() -> (FileSessionAdapter, TempDir) {
        let dir = TempDir::new().unwrap();
        let adapter = FileSessionAdapter::new(dir.path().join("auth").join("session.json"));
        (adapter, dir)
    }

    #[test]
    fn test_missing_file_means_no_session() {
        let (adapter, _dir) = adapter();
        assert_eq!(adapter.load().unwrap(), None);
    }

    #[test]
    fn test_save_then_load() {
        let (adapter, _dir) = adapter();
        let session = AuthSession {
            user_id: Uuid::new_v4(),
            expires_at: None,
        };

        adapter.save(&session).unwrap();
        assert_eq!(adapter.load().unwrap(), Some(session));
        assert!(!adapter.path().with_extension("tmp").exists());
    }

    #[test]
    fn test_clear_is_idempotent() {
        let (adapter, _dir) = adapter();
        adapter
            .save(&AuthSession {
                user_id: Uuid::new_v4(),
                expires_at: None,
            })
            .unwrap();

        adapter.clear().unwrap();
        adapter.clear().unwrap();
        assert_eq!(adapter.load().unwrap(), None);
    }

    #[test]
    fn test_corrupt_file_is_a_decode_error() {
        let (adapter, _dir) = adapter();
        fs::create_dir_all(adapter.path().parent().unwrap()).unwrap();
        fs::write(adapter.path(), b"{not json").unwrap();

        assert!(matches!(adapter.load(), Err(PortError::Decode(_))));
    }
}
