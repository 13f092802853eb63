use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use super::{Snapshot, Storage, StorageError};

/// One JSON file per room under a base directory.
///
/// Saves write to a sibling temp file first and rename over the target, so a
/// crash mid-save leaves the previous snapshot intact.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl AsRef<Path>, room_id: &str) -> Self {
        let file = format!("{}.json", sanitize(room_id));
        Self {
            path: dir.as_ref().join(file),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Storage for FileStorage {
    fn load(&mut self) -> Result<Option<Snapshot>, StorageError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let snapshot = serde_json::from_str(&raw)?;
        Ok(Some(snapshot))
    }

    fn save(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let raw = serde_json::to_string(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.path)?;
        debug!("saved room snapshot to {}", self.path.display());
        Ok(())
    }
}

/// Room ids come from connection URLs; keep the file name boring.
fn sanitize(room_id: &str) -> String {
    room_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
