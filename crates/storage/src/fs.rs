//! Filesystem-backed object store.
//!
//! Layout under the root directory:
//! - `data/<key>`       committed object bytes
//! - `meta/<key>.json`  size and MIME sidecar
//! - `tmp/<uuid>`       in-progress writes, renamed into `data/` on commit

use std::path::{Path, PathBuf};

use {
    async_trait::async_trait,
    tokio::{fs, io::AsyncWriteExt},
    tracing::{debug, warn},
};

use crate::{
    Error, Result,
    store::{ObjectMeta, ObjectReader, ObjectStore, ObjectWriter, normalize_key},
};

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for sub in ["data", "meta", "tmp"] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| Error::io(format!("create {}", dir.display()), e))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.root.join("data").join(key)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join("meta").join(format!("{key}.json"))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn head(&self, key: &str) -> Result<ObjectMeta> {
        let key = normalize_key(key)?;
        match fs::read(self.meta_path(&key)).await {
            Ok(raw) => return Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(Error::io(format!("read metadata for {key}"), e)),
        }
        // Objects placed in data/ by hand have no sidecar.
        match fs::metadata(self.data_path(&key)).await {
            Ok(md) if md.is_file() => Ok(ObjectMeta {
                key,
                size: md.len(),
                mime: None,
            }),
            Ok(_) => Err(Error::not_found(key)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::not_found(key)),
            Err(e) => Err(Error::io(format!("stat {key}"), e)),
        }
    }

    async fn create(&self, key: &str, mime: Option<&str>) -> Result<Box<dyn ObjectWriter>> {
        let key = normalize_key(key)?;
        let tmp_path = self.root.join("tmp").join(uuid::Uuid::new_v4().to_string());
        let file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| Error::io(format!("create {}", tmp_path.display()), e))?;
        debug!(key = %key, tmp = %tmp_path.display(), "object write started");
        Ok(Box::new(FsObjectWriter {
            data_path: self.data_path(&key),
            meta_path: self.meta_path(&key),
            key,
            mime: mime.map(str::to_string),
            tmp_path,
            file,
            written: 0,
        }))
    }

    async fn open(&self, key: &str) -> Result<ObjectReader> {
        let key = normalize_key(key)?;
        match fs::File::open(self.data_path(&key)).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::not_found(key)),
            Err(e) => Err(Error::io(format!("open {key}"), e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let key = normalize_key(key)?;
        let removed = match fs::remove_file(self.data_path(&key)).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(Error::io(format!("delete {key}"), e)),
        };
        if let Err(e) = fs::remove_file(self.meta_path(&key)).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(key = %key, error = %e, "failed to remove metadata sidecar");
        }
        Ok(removed)
    }
}

struct FsObjectWriter {
    key: String,
    mime: Option<String>,
    tmp_path: PathBuf,
    data_path: PathBuf,
    meta_path: PathBuf,
    file: fs::File,
    written: u64,
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(format!("create {}", parent.display()), e))?;
    }
    Ok(())
}

#[async_trait]
impl ObjectWriter for FsObjectWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file
            .write_all(data)
            .await
            .map_err(|e| Error::io(format!("write {}", self.key), e))?;
        self.written += data.len() as u64;
        Ok(())
    }

    fn written(&self) -> u64 {
        self.written
    }

    async fn commit(mut self: Box<Self>) -> Result<ObjectMeta> {
        self.file
            .flush()
            .await
            .map_err(|e| Error::io(format!("flush {}", self.key), e))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| Error::io(format!("sync {}", self.key), e))?;

        let meta = ObjectMeta {
            key: self.key.clone(),
            size: self.written,
            mime: self.mime.clone(),
        };
        ensure_parent(&self.data_path).await?;
        ensure_parent(&self.meta_path).await?;
        fs::write(&self.meta_path, serde_json::to_vec(&meta)?)
            .await
            .map_err(|e| Error::io(format!("write metadata for {}", self.key), e))?;
        fs::rename(&self.tmp_path, &self.data_path)
            .await
            .map_err(|e| Error::io(format!("commit {}", self.key), e))?;
        debug!(key = %self.key, size = self.written, "object committed");
        Ok(meta)
    }

    async fn abort(self: Box<Self>) {
        let Self { file, tmp_path, .. } = *self;
        drop(file);
        if let Err(e) = fs::remove_file(&tmp_path).await {
            warn!(tmp = %tmp_path.display(), error = %e, "failed to remove aborted write");
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_chunk;

    #[tokio::test]
    async fn commit_makes_object_visible() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path()).await.unwrap();

        let mut w = store.create("/docs/a.txt", Some("text/plain")).await.unwrap();
        w.write(b"hello ").await.unwrap();
        assert!(matches!(
            store.head("docs/a.txt").await,
            Err(Error::NotFound { .. })
        ));
        w.write(b"world").await.unwrap();
        let meta = w.commit().await.unwrap();
        assert_eq!(meta.size, 11);

        let head = store.head("docs/a.txt").await.unwrap();
        assert_eq!(head, meta);
        assert_eq!(head.mime.as_deref(), Some("text/plain"));

        let mut r = store.open("docs/a.txt").await.unwrap();
        assert_eq!(&read_chunk(&mut r, 64).await.unwrap().unwrap()[..], b"hello world");
    }

    #[tokio::test]
    async fn abort_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path()).await.unwrap();

        let mut w = store.create("x.bin", None).await.unwrap();
        w.write(&[0u8; 32]).await.unwrap();
        w.abort().await;

        assert!(store.head("x.bin").await.is_err());
        let tmp_entries = std::fs::read_dir(dir.path().join("tmp")).unwrap().count();
        assert_eq!(tmp_entries, 0);
    }

    #[tokio::test]
    async fn head_falls_back_to_file_size_without_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("data/raw.dat"), [1, 2, 3]).unwrap();

        let meta = store.head("raw.dat").await.unwrap();
        assert_eq!(meta.size, 3);
        assert!(meta.mime.is_none());
    }

    #[tokio::test]
    async fn delete_reports_whether_object_existed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path()).await.unwrap();
        let w = store.create("k", None).await.unwrap();
        w.commit().await.unwrap();

        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path()).await.unwrap();
        assert!(matches!(
            store.create("../../evil", None).await,
            Err(Error::InvalidKey { .. })
        ));
    }
}
