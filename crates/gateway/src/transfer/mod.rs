//! Binary transfers between two endpoints.
//!
//! An endpoint is a connected node plus a path on it, or the router's own
//! object store (`node = "@storage"`). The coordinator drives each transfer
//! through `meta-wait → accept-wait → streaming → completing` and removes the
//! record once it finishes or fails; late frames for a removed transfer are
//! ignored.

mod coordinator;

pub use coordinator::TransferCoordinator;

use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
    tokio::sync::oneshot,
};

use {
    switchyard_protocol::{ErrorShape, ResponseFrame, STORAGE_ENDPOINT},
    switchyard_storage::normalize_key,
};

use crate::outbound::Delivery;

/// One side of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub node: String,
    pub path: String,
}

impl Endpoint {
    pub fn new(node: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            path: path.into(),
        }
    }

    pub fn storage(key: impl Into<String>) -> Self {
        Self::new(STORAGE_ENDPOINT, key)
    }

    pub fn is_storage(&self) -> bool {
        self.node == STORAGE_ENDPOINT
    }

    /// The node id, unless this is the object store.
    pub fn node_id(&self) -> Option<&str> {
        (!self.is_storage()).then_some(self.node.as_str())
    }

    /// Canonicalise a storage key; node paths are passed through untouched.
    pub(crate) fn normalized(self) -> Result<Self, ErrorShape> {
        if self.node.is_empty() {
            return Err(ErrorShape::bad_request("endpoint node is required"));
        }
        if self.is_storage() {
            let key = normalize_key(&self.path)?;
            return Ok(Self::storage(key));
        }
        if self.path.is_empty() {
            return Err(ErrorShape::bad_request("endpoint path is required"));
        }
        Ok(self)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.node, self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferState {
    MetaWait,
    AcceptWait,
    Streaming,
    Completing,
}

/// What the initiator receives when a transfer finishes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSummary {
    pub source: Endpoint,
    pub destination: Endpoint,
    pub bytes_transferred: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

pub type TransferOutcome = Result<TransferSummary, ErrorShape>;

/// Who is told how a transfer ended.
#[derive(Debug)]
pub enum TransferWaiter {
    /// A client's deferred `transfer.begin`.
    Client {
        client_id: String,
        conn_id: String,
        frame_id: String,
    },
    /// An in-process initiator.
    Local(oneshot::Sender<TransferOutcome>),
}

impl TransferWaiter {
    /// Resolve the waiter. Client waiters become a delivery for the caller to
    /// route; local waiters are answered in place.
    pub(crate) fn settle(self, outcome: TransferOutcome) -> Option<Delivery> {
        match self {
            Self::Client {
                client_id,
                conn_id,
                frame_id,
            } => {
                let result = outcome.and_then(|summary| {
                    serde_json::to_value(summary).map_err(|e| ErrorShape::internal(e.to_string()))
                });
                Some(Delivery::response_to_client(
                    client_id,
                    conn_id,
                    ResponseFrame::from_result(frame_id, result),
                ))
            },
            Self::Local(tx) => {
                // The initiator may have stopped waiting.
                let _ = tx.send(outcome);
                None
            },
        }
    }
}

/// Snapshot of a live transfer for status output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferInfo {
    pub transfer_id: u32,
    pub source: Endpoint,
    pub destination: Endpoint,
    pub state: TransferState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    pub bytes: u64,
}

// ── Control-frame params ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeginParams {
    pub source: Endpoint,
    pub destination: Endpoint,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaParams {
    pub transfer_id: u32,
    pub size: Option<u64>,
    pub mime: Option<String>,
    pub error: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptParams {
    pub transfer_id: u32,
    pub error: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteParams {
    pub transfer_id: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneParams {
    pub transfer_id: u32,
    pub bytes_written: Option<u64>,
    pub error: Option<Value>,
}

/// Render a peer-reported error, which may be a string or an error object.
pub(crate) fn describe_peer_error(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, switchyard_protocol::error_codes};

    #[test]
    fn storage_keys_are_normalized() {
        let ep = Endpoint::storage("/docs//a.txt").normalized().unwrap();
        assert_eq!(ep.path, "docs/a.txt");
        assert!(ep.node_id().is_none());

        let err = Endpoint::storage("../x").normalized().unwrap_err();
        assert_eq!(err.code, error_codes::BAD_REQUEST);
    }

    #[test]
    fn node_endpoint_needs_a_path() {
        let err = Endpoint::new("laptop", "").normalized().unwrap_err();
        assert_eq!(err.code, error_codes::BAD_REQUEST);
        let ep = Endpoint::new("laptop", "/tmp/x").normalized().unwrap();
        assert_eq!(ep.node_id(), Some("laptop"));
        assert_eq!(ep.path, "/tmp/x");
    }

    #[test]
    fn peer_errors_render_as_text() {
        assert_eq!(describe_peer_error(&serde_json::json!("disk full")), "disk full");
        assert_eq!(
            describe_peer_error(&serde_json::json!({"code": 5, "message": "EACCES"})),
            "EACCES"
        );
        assert_eq!(describe_peer_error(&serde_json::json!(true)), "true");
    }

    #[test]
    fn client_waiter_settles_into_response() {
        let waiter = TransferWaiter::Client {
            client_id: "ui".into(),
            conn_id: "c1".into(),
            frame_id: "9".into(),
        };
        let delivery = waiter
            .settle(Ok(TransferSummary {
                source: Endpoint::new("laptop", "/a"),
                destination: Endpoint::storage("a"),
                bytes_transferred: 3,
                mime: None,
            }))
            .unwrap();
        match delivery.payload {
            crate::outbound::Payload::Response(frame) => {
                assert!(frame.ok);
                assert_eq!(frame.id, "9");
                assert_eq!(frame.payload.unwrap()["bytesTransferred"], 3);
            },
            other => panic!("expected response, got {other:?}"),
        }
    }
}
