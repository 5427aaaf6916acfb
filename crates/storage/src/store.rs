use std::pin::Pin;

use {
    async_trait::async_trait,
    bytes::{Bytes, BytesMut},
    serde::{Deserialize, Serialize},
    tokio::io::{AsyncRead, AsyncReadExt},
};

use crate::{Error, Result};

/// Size and type of a committed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// A blob store addressed by slash-separated keys.
///
/// Objects only become visible to `head`/`open` once their writer commits.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn head(&self, key: &str) -> Result<ObjectMeta>;
    async fn create(&self, key: &str, mime: Option<&str>) -> Result<Box<dyn ObjectWriter>>;
    async fn open(&self, key: &str) -> Result<ObjectReader>;
    /// Returns `false` when nothing was stored under `key`.
    async fn delete(&self, key: &str) -> Result<bool>;
}

/// An in-progress object write.
#[async_trait]
pub trait ObjectWriter: Send {
    async fn write(&mut self, data: &[u8]) -> Result<()>;
    fn written(&self) -> u64;
    async fn commit(self: Box<Self>) -> Result<ObjectMeta>;
    async fn abort(self: Box<Self>);
}

/// Canonical form of an object key: no leading slash, no empty, `.` or
/// `..` segments, no backslashes or NULs.
pub fn normalize_key(key: &str) -> Result<String> {
    if key.contains('\0') || key.contains('\\') {
        return Err(Error::invalid_key(key, "illegal character"));
    }
    let mut segments = Vec::new();
    for segment in key.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(Error::invalid_key(key, "parent segment")),
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        return Err(Error::invalid_key(key, "empty key"));
    }
    Ok(segments.join("/"))
}

/// Read up to `max` bytes, returning `None` at end of stream.
pub async fn read_chunk(reader: &mut ObjectReader, max: usize) -> Result<Option<Bytes>> {
    let mut buf = BytesMut::zeroed(max);
    let mut filled = 0;
    while filled < max {
        let n = reader
            .read(&mut buf[filled..])
            .await
            .map_err(|e| Error::io("read object", e))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled == 0 {
        return Ok(None);
    }
    buf.truncate(filled);
    Ok(Some(buf.freeze()))
}
