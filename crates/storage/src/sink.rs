//! Exact-size write sink.
//!
//! Chunks are accepted synchronously (size accounting only) and handed to a
//! background writer through a bounded queue, so the caller never holds a
//! lock across a store write and a slow store pushes back on the sender.
//! The sink refuses any chunk that would exceed the declared size and fails
//! `finish` when fewer bytes arrived. Nothing is committed in either case.

use std::sync::Arc;

use {
    bytes::Bytes,
    tokio::{sync::mpsc, task::JoinHandle},
    tracing::{debug, warn},
};

use crate::{
    Error, Result,
    store::{ObjectMeta, ObjectStore, ObjectWriter},
};

/// Chunks queued ahead of the store writer.
const QUEUE_DEPTH: usize = 8;

enum SinkMsg {
    Data(Bytes),
    Finish,
    Abort,
}

pub struct SizedSink {
    key: String,
    expected: u64,
    pushed: u64,
    tx: mpsc::Sender<SinkMsg>,
    task: JoinHandle<Result<ObjectMeta>>,
}

/// A chunk the sink has counted but not yet queued for the writer.
#[must_use = "an accepted chunk is only written once `send` is awaited"]
pub struct PendingChunk {
    tx: mpsc::Sender<SinkMsg>,
    data: Bytes,
}

impl PendingChunk {
    /// Queue the chunk, waiting while the writer is behind.
    pub async fn send(self) -> Result<()> {
        self.tx
            .send(SinkMsg::Data(self.data))
            .await
            .map_err(|_| Error::Aborted)
    }
}

impl SizedSink {
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        key: &str,
        expected: u64,
        mime: Option<&str>,
    ) -> Result<Self> {
        let writer = store.create(key, mime).await?;
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let task = tokio::spawn(run_writer(writer, rx, expected));
        Ok(Self {
            key: key.to_string(),
            expected,
            pushed: 0,
            tx,
            task,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    /// Bytes accepted so far.
    pub fn received(&self) -> u64 {
        self.pushed
    }

    /// Count a chunk against the declared size. Fails immediately if it would
    /// overrun or the writer task already stopped on an error. The returned
    /// chunk must be sent, in order, before the next one is accepted.
    pub fn accept(&mut self, data: Bytes) -> Result<PendingChunk> {
        let attempted = self.pushed + data.len() as u64;
        if attempted > self.expected {
            return Err(Error::Overflow {
                expected: self.expected,
                attempted,
            });
        }
        if self.tx.is_closed() {
            return Err(Error::Aborted);
        }
        self.pushed = attempted;
        Ok(PendingChunk {
            tx: self.tx.clone(),
            data,
        })
    }

    /// Accept and queue a chunk in one step.
    pub async fn push(&mut self, data: Bytes) -> Result<()> {
        self.accept(data)?.send().await
    }

    /// Flush outstanding chunks and commit, or fail on a short write.
    pub async fn finish(self) -> Result<ObjectMeta> {
        // A closed channel means the task already exited; its result says why.
        let _ = self.tx.send(SinkMsg::Finish).await;
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(Error::io(
                format!("sink writer for {}", self.key),
                std::io::Error::other(e),
            )),
        }
    }

    /// Discard everything written so far. The writer cleans up in the
    /// background; with a full queue it sees the channel close instead.
    pub fn abort(self) {
        let _ = self.tx.try_send(SinkMsg::Abort);
    }
}

async fn run_writer(
    mut writer: Box<dyn ObjectWriter>,
    mut rx: mpsc::Receiver<SinkMsg>,
    expected: u64,
) -> Result<ObjectMeta> {
    while let Some(msg) = rx.recv().await {
        match msg {
            SinkMsg::Data(chunk) => {
                if let Err(e) = writer.write(&chunk).await {
                    warn!(error = %e, "sink write failed");
                    writer.abort().await;
                    return Err(e);
                }
            },
            SinkMsg::Finish => {
                let written = writer.written();
                if written != expected {
                    writer.abort().await;
                    return Err(Error::ShortWrite { expected, written });
                }
                return writer.commit().await;
            },
            SinkMsg::Abort => break,
        }
    }
    debug!("sink aborted");
    writer.abort().await;
    Err(Error::Aborted)
}
