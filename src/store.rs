use anyhow::{Context, Result};
use std::path::PathBuf;

/// Key/value persistence for trained weights.
pub trait WeightStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn save(&self, key: &str, bytes: &[u8]) -> Result<()>;
}

/// One file per key under `dir`.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.onnx"))
    }
}

impl WeightStore for FileStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(key);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    fn save(&self, key: &str, bytes: &[u8]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.path(key);
        std::fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!("Saved {} bytes to {}", bytes.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_none_and_save_creates_dir() {
        let dir = std::env::temp_dir().join(format!("rusty_gaze_store_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let store = FileStore::new(dir.join("nested"));

        assert_eq!(store.load("model").unwrap(), None);
        store.save("model", b"weights").unwrap();
        assert_eq!(store.load("model").unwrap(), Some(b"weights".to_vec()));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
