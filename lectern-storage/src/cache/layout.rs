//! Sharded blob paths.
//!
//! `blobs/<hex[0..2]>/<hex[2..4]>/<hex>` keeps every directory small no
//! matter how many entries the cache holds.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use lectern_core::ContentKey;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct BlobLayout {
    blobs_dir: PathBuf,
}

impl BlobLayout {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            blobs_dir: root.as_ref().join("blobs"),
        }
    }

    pub fn blobs_dir(&self) -> &Path {
        &self.blobs_dir
    }

    pub fn path_for(&self, key: &ContentKey) -> PathBuf {
        let (outer, inner) = key.shard_prefixes();
        self.blobs_dir.join(outer).join(inner).join(key.as_str())
    }

    /// Write the blob through a temp file in the same directory, then rename.
    /// Readers see either the old payload or the new one, never a torn file.
    pub fn write_atomic(&self, key: &ContentKey, bytes: &[u8]) -> io::Result<()> {
        let target = self.path_for(key);
        let dir = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "blob path has no parent"))?;
        fs::create_dir_all(dir)?;

        let tmp = dir.join(format!(".{}.{}.tmp", key.as_str(), Uuid::now_v7().simple()));
        let result = (|| {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_data()?;
            fs::rename(&tmp, &target)
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    /// Remove the blob. A blob that is already gone is not an error.
    pub fn remove(&self, key: &ContentKey) -> io::Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
