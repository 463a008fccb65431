use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Persisted state of one segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSnapshot {
    pub max: i64,
    pub step: i64,
    /// The cursor.
    pub value: i64,
}

/// Persisted state of a whole buffer, written on graceful shutdown.
///
/// `segs` is indexed by physical slot, so `segs[pos]` is the segment that was
/// serving.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSnapshot {
    pub key: String,
    pub step: i64,
    pub min_step: i64,
    pub pos: usize,
    pub segs: [SegmentSnapshot; 2],
}

/// A directory holding one `<key>.json` snapshot per buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The file backing `key`.
    ///
    /// # Errors
    ///
    /// Rejects keys that would escape the directory or are not plain file
    /// names.
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        let unsafe_name = key.is_empty()
            || key == "."
            || key == ".."
            || key.contains(['/', '\\', '\0']);
        if unsafe_name {
            return Err(Error::snapshot(format!(
                "key `{key}` is not a valid file name"
            )));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }

    /// Reads the snapshot for `key`, or `None` if none was written.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&self, key: &str) -> Result<Option<BufferSnapshot>> {
        let path = self.path_for(key)?;
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// Writes `snapshot`, replacing any previous one atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, the path exists
    /// but is not a directory, or the file cannot be written.
    pub fn save(&self, snapshot: &BufferSnapshot) -> Result<PathBuf> {
        let path = self.path_for(&snapshot.key)?;
        if self.dir.exists() && !self.dir.is_dir() {
            return Err(Error::snapshot(format!(
                "path `{}` is not a dir",
                self.dir.display()
            )));
        }
        fs::create_dir_all(&self.dir)?;

        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&serde_json::to_vec(snapshot)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(path)
    }

    /// Deletes the snapshot for `key` if present.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be removed.
    pub fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
