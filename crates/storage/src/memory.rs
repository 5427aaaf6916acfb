use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use {async_trait::async_trait, bytes::Bytes};

use crate::{
    Error, Result,
    store::{ObjectMeta, ObjectReader, ObjectStore, ObjectWriter, normalize_key},
};

#[derive(Clone)]
struct StoredObject {
    data: Bytes,
    mime: Option<String>,
}

type Objects = Arc<Mutex<HashMap<String, StoredObject>>>;

/// In-memory object store for tests and ephemeral deployments.
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    objects: Objects,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object directly, bypassing the writer.
    pub fn insert(&self, key: &str, data: impl Into<Bytes>, mime: Option<&str>) -> Result<()> {
        let key = normalize_key(key)?;
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, StoredObject {
                data: data.into(),
                mime: mime.map(str::to_string),
            });
        Ok(())
    }

    /// Raw bytes of a committed object.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let key = normalize_key(key).ok()?;
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .map(|o| o.data.clone())
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn head(&self, key: &str) -> Result<ObjectMeta> {
        let key = normalize_key(key)?;
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let obj = objects.get(&key).ok_or_else(|| Error::not_found(&key))?;
        Ok(ObjectMeta {
            size: obj.data.len() as u64,
            mime: obj.mime.clone(),
            key,
        })
    }

    async fn create(&self, key: &str, mime: Option<&str>) -> Result<Box<dyn ObjectWriter>> {
        Ok(Box::new(MemoryObjectWriter {
            key: normalize_key(key)?,
            mime: mime.map(str::to_string),
            buf: Vec::new(),
            objects: Arc::clone(&self.objects),
        }))
    }

    async fn open(&self, key: &str) -> Result<ObjectReader> {
        let key = normalize_key(key)?;
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let obj = objects.get(&key).ok_or_else(|| Error::not_found(&key))?;
        Ok(Box::pin(std::io::Cursor::new(obj.data.clone())))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let key = normalize_key(key)?;
        Ok(self
            .objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key)
            .is_some())
    }
}

struct MemoryObjectWriter {
    key: String,
    mime: Option<String>,
    buf: Vec<u8>,
    objects: Objects,
}

#[async_trait]
impl ObjectWriter for MemoryObjectWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn written(&self) -> u64 {
        self.buf.len() as u64
    }

    async fn commit(self: Box<Self>) -> Result<ObjectMeta> {
        let Self {
            key,
            mime,
            buf,
            objects,
        } = *self;
        let meta = ObjectMeta {
            key: key.clone(),
            size: buf.len() as u64,
            mime: mime.clone(),
        };
        objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, StoredObject {
                data: Bytes::from(buf),
                mime,
            });
        Ok(meta)
    }

    async fn abort(self: Box<Self>) {}
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_chunk;

    #[tokio::test]
    async fn uncommitted_writes_are_invisible() {
        let store = MemoryObjectStore::new();
        let mut w = store.create("a", Some("text/plain")).await.unwrap();
        w.write(b"abc").await.unwrap();
        assert!(store.is_empty());
        w.commit().await.unwrap();
        assert_eq!(store.get("/a").unwrap(), Bytes::from_static(b"abc"));
    }

    #[tokio::test]
    async fn open_streams_inserted_bytes() {
        let store = MemoryObjectStore::new();
        store.insert("b/c", vec![7u8; 5], None).unwrap();
        let mut r = store.open("b/c").await.unwrap();
        assert_eq!(read_chunk(&mut r, 3).await.unwrap().unwrap().len(), 3);
        assert_eq!(read_chunk(&mut r, 3).await.unwrap().unwrap().len(), 2);
        assert!(read_chunk(&mut r, 3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let store = MemoryObjectStore::new();
        assert!(matches!(
            store.head("nope").await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(store.open("nope").await, Err(Error::NotFound { .. })));
    }
}
