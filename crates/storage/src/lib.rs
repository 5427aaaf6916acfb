//! The router's own object store: keyed blobs with a size and MIME type,
//! written through an exact-size sink and read back in chunks.

pub mod error;
pub mod fs;
pub mod memory;
pub mod mime;
pub mod sink;
pub mod store;

pub use {
    error::{Error, Result},
    fs::FsObjectStore,
    memory::MemoryObjectStore,
    sink::{PendingChunk, SizedSink},
    store::{ObjectMeta, ObjectReader, ObjectStore, ObjectWriter, normalize_key, read_chunk},
};
