//! ---
//! bms_section: "03-persistence-logging"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Persistence abstractions and storage bindings."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::{PersistenceError, Result};

/// A JSON array of records kept in a single file.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    /// Bind the store to a file path; nothing is touched until load/save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the history file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all records. `Ok(None)` means the file does not exist yet.
    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<Vec<T>>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(Some(Vec::new()));
        }
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| PersistenceError::Corrupt {
                path: self.path.clone(),
                source,
            })
    }

    /// Replace the stored records. A temporary sibling file is written and
    /// renamed so a crash mid-write leaves the previous history intact.
    pub fn save<T: Serialize>(&self, records: &[T]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let staging = self.staging_path();
        {
            let file = File::create(&staging)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, records)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&staging, &self.path)?;
        debug!(path = %self.path.display(), records = records.len(), "history saved");
        Ok(())
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        id: u32,
        text: String,
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("alarms.json"));
        assert!(store.load::<Record>().unwrap().is_none());
    }

    #[test]
    fn save_then_load_preserves_order() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("state/alarms.json"));
        let records = vec![
            Record {
                id: 2,
                text: "newest".into(),
            },
            Record {
                id: 1,
                text: "oldest".into(),
            },
        ];
        store.save(&records).unwrap();
        assert!(!dir.path().join("state/alarms.json.tmp").exists());
        assert_eq!(store.load::<Record>().unwrap().unwrap(), records);
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alarms.json");
        fs::write(&path, "[{\"id\": 1,").unwrap();
        let store = HistoryStore::new(&path);
        assert!(matches!(
            store.load::<Record>(),
            Err(PersistenceError::Corrupt { .. })
        ));
    }
}
