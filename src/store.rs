//! Persistence for the active session and launch presets.

use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;
use crate::protocol::{ActiveSession, LaunchPreset, LaunchRequest};

/// Load/save/clear over the single active session.
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Result<Option<ActiveSession>, StoreError>;
    fn save(&self, session: &ActiveSession) -> Result<(), StoreError>;
    fn clear(&self) -> Result<(), StoreError>;
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let body = match std::fs::read(path) {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(path, e)),
    };
    Ok(Some(serde_json::from_slice(&body)?))
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let body = serde_json::to_vec_pretty(value)?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| io_error(dir, e))?;
    std::io::Write::write_all(&mut tmp, &body).map_err(|e| io_error(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| io_error(path, e.error))?;
    Ok(())
}

/// Session stored as pretty JSON in a single file, replaced atomically.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for JsonFileStore {
    fn load(&self) -> Result<Option<ActiveSession>, StoreError> {
        read_json(&self.path)
    }

    fn save(&self, session: &ActiveSession) -> Result<(), StoreError> {
        write_json_atomic(&self.path, session)
    }

    fn clear(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&self.path, e)),
        }
    }
}

/// In-process store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    session: Mutex<Option<ActiveSession>>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `save` calls so far.
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

impl SessionStore for MemoryStore {
    fn load(&self) -> Result<Option<ActiveSession>, StoreError> {
        Ok(self.session.lock().clone())
    }

    fn save(&self, session: &ActiveSession) -> Result<(), StoreError> {
        *self.session.lock() = Some(session.clone());
        *self.saves.lock() += 1;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.session.lock() = None;
        Ok(())
    }
}

/// Named launch presets kept in one JSON file, sorted by name.
#[derive(Debug, Clone)]
pub struct PresetStore {
    path: PathBuf,
}

impl PresetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn list(&self) -> Result<Vec<LaunchPreset>, StoreError> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    pub fn get(&self, name: &str) -> Result<Option<LaunchPreset>, StoreError> {
        Ok(self.list()?.into_iter().find(|p| p.name == name))
    }

    /// Save `request` under `name`, replacing any preset with the same name.
    pub fn save(&self, name: &str, request: LaunchRequest) -> Result<LaunchPreset, StoreError> {
        let mut presets = self.list()?;
        presets.retain(|p| p.name != name);
        let preset = LaunchPreset {
            name: name.to_string(),
            request,
            saved_at: Utc::now(),
        };
        presets.push(preset.clone());
        presets.sort_by(|a, b| a.name.cmp(&b.name));
        write_json_atomic(&self.path, &presets)?;
        Ok(preset)
    }

    /// Returns whether a preset was removed.
    pub fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let mut presets = self.list()?;
        let before = presets.len();
        presets.retain(|p| p.name != name);
        if presets.len() == before {
            return Ok(false);
        }
        write_json_atomic(&self.path, &presets)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{LaunchItem, LayoutPreset};

    fn request(tool: &str) -> LaunchRequest {
        LaunchRequest {
            layout: LayoutPreset::Wide,
            items: vec![LaunchItem {
                tool_id: tool.into(),
                directory: PathBuf::from("/tmp"),
                count: 2,
                agent_name: String::new(),
                role: String::new(),
                objective: String::new(),
                tone: String::new(),
                start_slot: None,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn file_store_round_trips_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("session.json"));
        assert!(store.load().unwrap().is_none());

        let session = ActiveSession::new(request("claude"), Utc::now());
        store.save(&session).unwrap();
        assert_eq!(store.load().unwrap(), Some(session));

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        store.clear().unwrap();
    }

    #[test]
    fn corrupt_session_file_is_a_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = JsonFileStore::new(&path).load().unwrap_err();
        assert!(matches!(err, StoreError::Json(_)));
    }

    #[test]
    fn memory_store_counts_saves() {
        let store = MemoryStore::new();
        let session = ActiveSession::new(LaunchRequest::default(), Utc::now());
        store.save(&session).unwrap();
        store.save(&session).unwrap();
        assert_eq!(store.save_count(), 2);
        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn presets_overwrite_by_name_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let presets = PresetStore::new(dir.path().join("presets.json"));
        assert!(presets.list().unwrap().is_empty());

        presets.save("review", request("claude")).unwrap();
        presets.save("alpha", request("codex")).unwrap();
        presets.save("review", request("gemini")).unwrap();

        let all = presets.list().unwrap();
        let names: Vec<_> = all.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "review"]);
        let review = presets.get("review").unwrap().unwrap();
        assert_eq!(review.request.items[0].tool_id, "gemini");

        assert!(presets.delete("alpha").unwrap());
        assert!(!presets.delete("alpha").unwrap());
        assert!(presets.get("alpha").unwrap().is_none());
    }
}
