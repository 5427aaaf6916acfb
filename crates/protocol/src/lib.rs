//! Router wire protocol definitions.
//!
//! Protocol version 1. Control traffic is JSON frames over a WebSocket;
//! transfer payload travels as binary frames on the same socket.
//!
//! Frame types:
//! - `RequestFrame` - peer → router RPC call (and router → peer never)
//! - `ResponseFrame` - router → peer RPC result, possibly deferred
//! - `EventFrame`   - router → peer push (invocations, transfer signals, presence)
//!
//! Binary frames carry a 4-byte little-endian transfer id followed by raw
//! bytes, see [`chunk`].

use serde::{Deserialize, Serialize};

pub mod chunk;

pub use chunk::{BinaryChunk, ChunkError, decode_chunk, encode_chunk};

// ── Constants ────────────────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_PAYLOAD_BYTES: usize = 524_288; // 512 KB
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000; // 10s
pub const DEFAULT_CHUNK_SIZE: usize = 65_536; // 64 KB

/// Endpoint name that designates the router's own object store.
pub const STORAGE_ENDPOINT: &str = "@storage";

/// Separator between the owning node id and the tool name in the catalog.
pub const TOOL_NAMESPACE_SEPARATOR: &str = "__";

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod error_codes {
    pub const NOT_CONNECTED: i32 = 101;
    pub const UNSUPPORTED_PROTOCOL: i32 = 102;
    pub const INVALID_FIELD: i32 = 103;
    pub const BAD_REQUEST: i32 = 400;
    pub const FORBIDDEN: i32 = 403;
    pub const NOT_FOUND: i32 = 404;
    pub const INTERNAL: i32 = 500;
    pub const UNAVAILABLE: i32 = 503;
}

/// WebSocket close codes used by the router.
pub mod close_codes {
    pub const REPLACED: u16 = 4000;
    pub const UNAUTHORIZED: u16 = 4001;
    pub const PROTOCOL_ERROR: u16 = 4002;
}

// ── Method and event names ───────────────────────────────────────────────────

pub mod methods {
    pub const CONNECT: &str = "connect";
    pub const HEALTH: &str = "health";
    pub const STATUS: &str = "status";
    pub const TOOLS_LIST: &str = "tools.list";
    pub const TOOLS_INVOKE: &str = "tools.invoke";
    pub const TOOL_INVOKE: &str = "tool.invoke";
    pub const TOOL_REQUEST: &str = "tool.request";
    pub const TOOL_RESULT: &str = "tool.result";
    pub const LOGS_GET: &str = "logs.get";
    pub const LOGS_RESULT: &str = "logs.result";
    pub const NODE_LIST: &str = "node.list";
    pub const NODE_PROBE_RESULT: &str = "node.probe.result";
    pub const NODE_EXEC_EVENT: &str = "node.exec.event";
    pub const TRANSFER_BEGIN: &str = "transfer.begin";
    pub const TRANSFER_META: &str = "transfer.meta";
    pub const TRANSFER_ACCEPT: &str = "transfer.accept";
    pub const TRANSFER_COMPLETE: &str = "transfer.complete";
    pub const TRANSFER_DONE: &str = "transfer.done";
    pub const CHANNELS_STATUS: &str = "channels.status";
    pub const CHANNEL_INBOUND: &str = "channel.inbound";
    pub const CHANNEL_SEND: &str = "channel.send";
}

pub mod events {
    pub const TOOL_INVOKE: &str = "tool.invoke";
    pub const LOGS_GET: &str = "logs.get";
    pub const NODE_PROBE: &str = "node.probe";
    pub const PRESENCE: &str = "presence";
    pub const TRANSFER_REQUEST: &str = "transfer.request";
    pub const TRANSFER_START: &str = "transfer.start";
    pub const TRANSFER_RECEIVE: &str = "transfer.receive";
    pub const TRANSFER_END: &str = "transfer.end";
    pub const TRANSFER_ABORT: &str = "transfer.abort";
    pub const CHANNEL_OUTBOUND: &str = "channel.outbound";

    /// Every event the router may push, advertised in `hello-ok`.
    pub const ALL: &[&str] = &[
        TOOL_INVOKE,
        LOGS_GET,
        NODE_PROBE,
        PRESENCE,
        TRANSFER_REQUEST,
        TRANSFER_START,
        TRANSFER_RECEIVE,
        TRANSFER_END,
        TRANSFER_ABORT,
        CHANNEL_OUTBOUND,
    ];
}

// ── Error shape ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: i32,
    pub message: String,
}

impl ErrorShape {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(error_codes::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(error_codes::NOT_FOUND, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(error_codes::FORBIDDEN, message)
    }

    pub fn not_connected(message: impl Into<String>) -> Self {
        Self::new(error_codes::NOT_CONNECTED, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(error_codes::UNAVAILABLE, message)
    }
}

impl std::fmt::Display for ErrorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// Peer → router RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub r#type: String, // always "req"
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl RequestFrame {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            r#type: "req".into(),
            id: id.into(),
            method: method.into(),
            params: Some(params),
        }
    }
}

/// Router → peer RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub r#type: String, // always "res"
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            r#type: "res".into(),
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: ErrorShape) -> Self {
        Self {
            r#type: "res".into(),
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }

    /// Build a response from a handler outcome.
    pub fn from_result(
        id: impl Into<String>,
        result: Result<serde_json::Value, ErrorShape>,
    ) -> Self {
        match result {
            Ok(payload) => Self::ok(id, payload),
            Err(error) => Self::err(id, error),
        }
    }
}

/// Router → peer server-push event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub r#type: String, // always "evt"
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: serde_json::Value, seq: u64) -> Self {
        Self {
            r#type: "evt".into(),
            event: event.into(),
            payload: Some(payload),
            seq: Some(seq),
        }
    }
}

/// Discriminated union of all frame types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayFrame {
    #[serde(rename = "req")]
    Request(RequestFrameInner),
    #[serde(rename = "res")]
    Response(ResponseFrameInner),
    #[serde(rename = "evt")]
    Event(EventFrameInner),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrameInner {
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrameInner {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrameInner {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

// ── Connect handshake ────────────────────────────────────────────────────────

/// Parameters sent by a peer in the initial `connect` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "minProtocol")]
    pub min_protocol: u32,
    #[serde(rename = "maxProtocol", skip_serializing_if = "Option::is_none")]
    pub max_protocol: Option<u32>,
    pub client: ClientInfo,
    /// Advertised tools; only meaningful for `mode = "node"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume: Option<ResumeInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(rename = "accountId", skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(rename = "displayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectAuth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Asks the router to reuse the connection id of a previous socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeInfo {
    #[serde(rename = "connectionId")]
    pub connection_id: String,
}

/// A capability advertised by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: serde_json::Value,
}

/// Sent by the router after a successful handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloOk {
    pub r#type: String, // always "hello-ok"
    pub protocol: u32,
    pub server: ServerInfo,
    pub features: Features,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub resumed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    #[serde(rename = "connectionId")]
    pub connection_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Features {
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

// ── Roles ────────────────────────────────────────────────────────────────────

/// The three peer classes a connection can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Client,
    Node,
    Channel,
}

impl Mode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "client" => Some(Self::Client),
            "node" => Some(Self::Node),
            "channel" => Some(Self::Channel),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Node => "node",
            Self::Channel => "channel",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_frames() {
        let req: GatewayFrame = serde_json::from_str(
            r#"{"type":"req","id":"1","method":"tools.invoke","params":{"tool":"a__b"}}"#,
        )
        .unwrap();
        match req {
            GatewayFrame::Request(r) => {
                assert_eq!(r.method, "tools.invoke");
                assert_eq!(r.params.unwrap()["tool"], "a__b");
            },
            other => panic!("expected request, got {other:?}"),
        }

        let evt: GatewayFrame =
            serde_json::from_str(r#"{"type":"evt","event":"presence"}"#).unwrap();
        assert!(matches!(evt, GatewayFrame::Event(_)));

        assert!(serde_json::from_str::<GatewayFrame>(r#"{"type":"event","event":"x"}"#).is_err());
    }

    #[test]
    fn response_error_shape_uses_numeric_code() {
        let frame = ResponseFrame::err("42", ErrorShape::forbidden("node mismatch"));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "res");
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"]["code"], 403);
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn connect_params_accept_minimal_node_handshake() {
        let params: ConnectParams = serde_json::from_value(serde_json::json!({
            "minProtocol": 1,
            "client": { "id": "laptop", "mode": "node" },
            "tools": [{ "name": "Read" }]
        }))
        .unwrap();
        assert_eq!(params.max_protocol, None);
        let tools = params.tools.unwrap();
        assert_eq!(tools[0].name, "Read");
        assert_eq!(tools[0].description, "");
        assert!(tools[0].input_schema.is_null());
    }

    #[test]
    fn hello_omits_resumed_when_false() {
        let hello = HelloOk {
            r#type: "hello-ok".into(),
            protocol: PROTOCOL_VERSION,
            server: ServerInfo {
                version: "0.0.0".into(),
                connection_id: "c1".into(),
                host: None,
            },
            features: Features {
                methods: vec![],
                events: vec![],
            },
            resumed: false,
        };
        let json = serde_json::to_value(&hello).unwrap();
        assert!(json.get("resumed").is_none());
        assert_eq!(json["server"]["connectionId"], "c1");
    }

    #[test]
    fn mode_parse_rejects_unknown_roles() {
        assert_eq!(Mode::parse("node"), Some(Mode::Node));
        assert_eq!(Mode::parse("operator"), None);
        assert_eq!(Mode::Channel.to_string(), "channel");
    }
}
