//! Where the store's record families live. One JSON image per backend.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use parking_lot::Mutex;

/// Key-value persistence under the [`crate::store::Store`].
pub trait StoreBackend: Send + Sync {
    /// Read one family. `Ok(None)` when never written.
    fn load(&self, key: &str) -> Result<Option<String>, StoreError>;
    /// Apply every entry of `batch` as one atomic write. `None` deletes the key.
    fn commit(&self, batch: &[(&str, Option<String>)]) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] io::Error),
    #[error("store image: {0}")]
    Image(#[from] serde_json::Error),
}

fn apply(image: &mut BTreeMap<String, String>, batch: &[(&str, Option<String>)]) {
    for (key, value) in batch {
        match value {
            Some(v) => {
                image.insert((*key).to_string(), v.clone());
            }
            None => {
                image.remove(*key);
            }
        }
    }
}

/// Volatile backend for tests and in-process hosts.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    image: Mutex<BTreeMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreBackend for MemoryBackend {
    fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.image.lock().get(key).cloned())
    }

    fn commit(&self, batch: &[(&str, Option<String>)]) -> Result<(), StoreError> {
        apply(&mut self.image.lock(), batch);
        Ok(())
    }
}

/// Single JSON file. Each commit rewrites the image through a temp file + rename.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    image: Mutex<BTreeMap<String, String>>,
}

impl FileBackend {
    /// Open `path`. A missing file starts empty; an unreadable image is discarded.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let image = match fs::read_to_string(&path) {
            Ok(s) => match serde_json::from_str(&s) {
                Ok(image) => image,
                Err(e) => {
                    log::warn!("discarding corrupt store image {}: {}", path.display(), e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            image: Mutex::new(image),
        })
    }

    fn write_image(&self, image: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let bytes = serde_json::to_vec_pretty(image)?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl StoreBackend for FileBackend {
    fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.image.lock().get(key).cloned())
    }

    fn commit(&self, batch: &[(&str, Option<String>)]) -> Result<(), StoreError> {
        let mut image = self.image.lock();
        let mut next = image.clone();
        apply(&mut next, batch);
        self.write_image(&next)?;
        *image = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_commit_and_delete() {
        let b = MemoryBackend::new();
        b.commit(&[("a", Some("1".into())), ("b", Some("2".into()))]).unwrap();
        assert_eq!(b.load("a").unwrap().as_deref(), Some("1"));
        b.commit(&[("a", None)]).unwrap();
        assert!(b.load("a").unwrap().is_none());
        assert_eq!(b.load("b").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn file_image_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/store.json");
        {
            let b = FileBackend::open(&path).unwrap();
            b.commit(&[("peer", Some("{}".into()))]).unwrap();
        }
        let b = FileBackend::open(&path).unwrap();
        assert_eq!(b.load("peer").unwrap().as_deref(), Some("{}"));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, b"{not json").unwrap();
        let b = FileBackend::open(&path).unwrap();
        assert!(b.load("registrations").unwrap().is_none());
        b.commit(&[("event_counter", Some("3".into()))]).unwrap();
        let reopened = FileBackend::open(&path).unwrap();
        assert_eq!(reopened.load("event_counter").unwrap().as_deref(), Some("3"));
    }

    #[test]
    fn failed_write_keeps_previous_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let b = FileBackend::open(&path).unwrap();
        b.commit(&[("a", Some("1".into()))]).unwrap();
        // A directory in place of the temp file makes the next write fail.
        fs::create_dir(path.with_extension("tmp")).unwrap();
        assert!(b.commit(&[("a", Some("2".into()))]).is_err());
        assert_eq!(b.load("a").unwrap().as_deref(), Some("1"));
    }
}
