use log::{debug, info};
use std::path::{Component, Path, PathBuf};
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;

use crate::utils::{P2PError, Result};

/// Files this node serves (`shared_dir`) and files it has fetched (`download_dir`).
#[derive(Debug, Clone)]
pub struct FileStore {
    shared_dir: PathBuf,
    download_dir: PathBuf,
}

impl FileStore {
    pub fn new(shared_dir: PathBuf, download_dir: PathBuf) -> Self {
        Self {
            shared_dir,
            download_dir,
        }
    }

    pub fn shared_dir(&self) -> &Path {
        &self.shared_dir
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Map a requested path onto `shared_dir`. Absolute paths and anything
    /// that climbs out with `..` map to nothing.
    pub fn resolve_shared(&self, requested: &str) -> Option<PathBuf> {
        let relative = Path::new(requested);
        let mut resolved = self.shared_dir.clone();
        let mut depth = 0usize;

        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }

        if depth == 0 { None } else { Some(resolved) }
    }

    /// Read a shared file in full. Anything that is not a regular file under
    /// `shared_dir` is `FileNotFound`.
    pub async fn load(&self, requested: &str) -> Result<Vec<u8>> {
        let path = self
            .resolve_shared(requested)
            .ok_or_else(|| P2PError::FileNotFound(requested.to_string()))?;

        match async_fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            _ => return Err(P2PError::FileNotFound(requested.to_string())),
        }

        let content = async_fs::read(&path)
            .await
            .map_err(|e| P2PError::IoError(format!("Failed to read {}: {}", path.display(), e)))?;
        debug!("Loaded {} ({} bytes)", path.display(), content.len());
        Ok(content)
    }

    /// Write a fetched file to `download_dir/<file name of requested>`.
    pub async fn save(&self, requested: &str, content: &[u8]) -> Result<PathBuf> {
        let name = Path::new(requested)
            .file_name()
            .ok_or_else(|| P2PError::IoError(format!("No file name in {:?}", requested)))?;

        async_fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|e| P2PError::IoError(format!("Failed to create directory: {}", e)))?;

        let output_path = self.download_dir.join(name);
        let mut file = async_fs::File::create(&output_path)
            .await
            .map_err(|e| P2PError::IoError(format!("Failed to create output file: {}", e)))?;
        file.write_all(content)
            .await
            .map_err(|e| P2PError::IoError(format!("Failed to write file: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| P2PError::IoError(format!("Failed to flush file: {}", e)))?;

        info!("File saved: {:?}", output_path);
        Ok(output_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_store() -> FileStore {
        let root = std::env::temp_dir().join(format!("peer-overlay-store-{}", Uuid::new_v4()));
        FileStore::new(root.join("shared"), root.join("downloads"))
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let store = FileStore::new(PathBuf::from("/srv/shared"), PathBuf::from("/tmp/dl"));

        assert_eq!(
            store.resolve_shared("docs/a.txt"),
            Some(PathBuf::from("/srv/shared/docs/a.txt"))
        );
        assert_eq!(
            store.resolve_shared("./a.txt"),
            Some(PathBuf::from("/srv/shared/a.txt"))
        );
        assert_eq!(store.resolve_shared("../etc/passwd"), None);
        assert_eq!(store.resolve_shared("docs/../../x"), None);
        assert_eq!(store.resolve_shared("/etc/passwd"), None);
        assert_eq!(store.resolve_shared(""), None);
        assert_eq!(store.resolve_shared("."), None);
    }

    #[tokio::test]
    async fn test_load_and_save() {
        let store = temp_store();
        async_fs::create_dir_all(store.shared_dir().join("sub")).await.unwrap();
        async_fs::write(store.shared_dir().join("sub/data.bin"), b"contents")
            .await
            .unwrap();

        let content = store.load("sub/data.bin").await.unwrap();
        assert_eq!(content, b"contents");

        let saved = store.save("sub/data.bin", &content).await.unwrap();
        assert_eq!(saved, store.download_dir().join("data.bin"));
        assert_eq!(async_fs::read(&saved).await.unwrap(), b"contents");
    }

    #[tokio::test]
    async fn test_missing_and_directory_are_not_found() {
        let store = temp_store();
        async_fs::create_dir_all(store.shared_dir().join("dir")).await.unwrap();

        assert!(matches!(
            store.load("nope.txt").await,
            Err(P2PError::FileNotFound(_))
        ));
        assert!(matches!(store.load("dir").await, Err(P2PError::FileNotFound(_))));
        assert!(matches!(
            store.load("../shared/dir").await,
            Err(P2PError::FileNotFound(_))
        ));
    }
}
