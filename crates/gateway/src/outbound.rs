//! Frames queued for a connection's write loop, and deliveries addressed by
//! logical id that are resolved against the live registry at send time.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use {
    bytes::Bytes,
    serde::Serialize,
    serde_json::Value,
    tokio::sync::Notify,
    tracing::warn,
};

use switchyard_protocol::ResponseFrame;

/// One frame for a connection's write loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Binary(Bytes),
    Close { code: u16, reason: String },
}

impl Outbound {
    /// Serialize a JSON frame. Serialization of the protocol types cannot
    /// fail in practice; a failure is logged and the frame skipped.
    pub fn frame<T: Serialize>(frame: &T) -> Option<Self> {
        match serde_json::to_string(frame) {
            Ok(text) => Some(Self::Text(text)),
            Err(e) => {
                warn!(error = %e, "failed to serialize outbound frame");
                None
            },
        }
    }

    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Self::Close {
            code,
            reason: reason.into(),
        }
    }
}

/// Binary bytes queued for a connection that its write loop has not yet
/// handed to the socket.
///
/// Streams wait on this before queueing more, so a slow reader holds at most
/// a bounded window in memory.
#[derive(Debug, Clone, Default)]
pub struct Backlog(Arc<BacklogInner>);

#[derive(Debug, Default)]
struct BacklogInner {
    bytes: AtomicUsize,
    closed: AtomicBool,
    changed: Notify,
}

impl Backlog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queued(&self) -> usize {
        self.0.bytes.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }

    pub fn add(&self, bytes: usize) {
        self.0.bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    /// The write loop handed `bytes` to the socket.
    pub fn written(&self, bytes: usize) {
        let _ = self
            .0
            .bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| {
                Some(b.saturating_sub(bytes))
            });
        self.0.changed.notify_waiters();
    }

    /// The write loop is gone; nothing queued will drain.
    pub fn close(&self) {
        self.0.closed.store(true, Ordering::Release);
        self.0.changed.notify_waiters();
    }

    /// Wait until fewer than `limit` bytes are queued. Returns `false` if the
    /// write loop stopped first.
    pub async fn wait_below(&self, limit: usize) -> bool {
        loop {
            let changed = self.0.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            if self.is_closed() {
                return false;
            }
            if self.queued() < limit {
                return true;
            }
            changed.await;
        }
    }
}

/// Who a [`Delivery`] is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Whatever connection currently holds this node id.
    Node(String),
    /// A client, but only if it is still on the connection that made the
    /// original request.
    Client { client_id: String, conn_id: String },
}

#[derive(Debug, Clone)]
pub enum Payload {
    Event { event: &'static str, payload: Value },
    Response(ResponseFrame),
    Binary(Bytes),
}

/// A frame addressed by logical id rather than by connection handle.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub target: Target,
    pub payload: Payload,
}

impl Delivery {
    pub fn event_to_node(node_id: impl Into<String>, event: &'static str, payload: Value) -> Self {
        Self {
            target: Target::Node(node_id.into()),
            payload: Payload::Event { event, payload },
        }
    }

    pub fn binary_to_node(node_id: impl Into<String>, frame: Bytes) -> Self {
        Self {
            target: Target::Node(node_id.into()),
            payload: Payload::Binary(frame),
        }
    }

    pub fn response_to_client(
        client_id: impl Into<String>,
        conn_id: impl Into<String>,
        frame: ResponseFrame,
    ) -> Self {
        Self {
            target: Target::Client {
                client_id: client_id.into(),
                conn_id: conn_id.into(),
            },
            payload: Payload::Response(frame),
        }
    }
}
