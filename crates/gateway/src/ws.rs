use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    axum::extract::ws::{CloseFrame, Message, WebSocket},
    bytes::Bytes,
    futures::{
        SinkExt,
        stream::{SplitStream, StreamExt},
    },
    serde_json::Value,
    tokio::{sync::mpsc, task::JoinHandle},
    tracing::{debug, info, warn},
};

use {
    switchyard_channels::channel_key,
    switchyard_protocol::{
        ConnectParams, ErrorShape, Features, GatewayFrame, HelloOk, Mode, PROTOCOL_VERSION,
        ResponseFrame, ServerInfo, close_codes, error_codes, events, methods as method_names,
    },
};

use crate::{
    attachments::ConnectionAttachment,
    auth,
    broadcast::broadcast_presence,
    connections::{Connection, ConnectionRole},
    methods::{Caller, MethodContext, MethodRegistry},
    outbound::{Backlog, Outbound},
    state::{GatewayState, now_ms},
};

/// Close code for an oversized text frame.
const CLOSE_TOO_BIG: u16 = 1009;

/// How long cleanup waits for queued frames to flush.
const WRITER_DRAIN: Duration = Duration::from_secs(2);

fn top_level_param_keys(params: &Option<Value>) -> Vec<String> {
    params
        .as_ref()
        .and_then(Value::as_object)
        .map(|obj| obj.keys().cloned().collect())
        .unwrap_or_default()
}

fn queue<T: serde::Serialize>(tx: &mpsc::UnboundedSender<Outbound>, frame: &T) {
    if let Some(out) = Outbound::frame(frame) {
        let _ = tx.send(out);
    }
}

/// Validate the descriptor in a `connect` request and derive the role the
/// connection will be registered under.
pub fn role_from_connect(params: &ConnectParams) -> Result<ConnectionRole, ErrorShape> {
    let invalid = |msg: String| ErrorShape::new(error_codes::INVALID_FIELD, msg);
    let client = &params.client;
    let mode = Mode::parse(&client.mode)
        .ok_or_else(|| invalid(format!("invalid mode: {}", client.mode)))?;
    if client.id.trim().is_empty() {
        return Err(invalid("client.id is required".into()));
    }
    Ok(match mode {
        Mode::Client => ConnectionRole::Client {
            id: client.id.clone(),
        },
        Mode::Node => ConnectionRole::Node {
            id: client.id.clone(),
            tools: params.tools.clone().unwrap_or_default(),
        },
        Mode::Channel => {
            let (Some(channel), Some(account_id)) = (
                client.channel.as_deref().filter(|s| !s.is_empty()),
                client.account_id.as_deref().filter(|s| !s.is_empty()),
            ) else {
                return Err(invalid(
                    "channel connections require channel and accountId".into(),
                ));
            };
            ConnectionRole::Channel {
                key: channel_key(channel, account_id),
                channel: channel.to_string(),
                account_id: account_id.to_string(),
            }
        },
    })
}

/// Handle a single WebSocket connection through its full lifecycle:
/// handshake (with auth) → message loop → cleanup.
pub async fn handle_connection(
    socket: WebSocket,
    state: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
    remote_addr: SocketAddr,
) {
    let fresh_id = uuid::Uuid::new_v4().to_string();
    let remote_ip = remote_addr.ip().to_string();
    debug!(conn_id = %fresh_id, remote_ip = %remote_ip, "ws: new connection");

    let (ws_tx, mut ws_rx) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
    let backlog = Backlog::new();
    let writer = spawn_writer(ws_tx, rx, backlog.clone(), fresh_id.clone());

    // ── Handshake phase ──────────────────────────────────────────────────

    let timeout = Duration::from_millis(state.limits.handshake_timeout_ms);
    let (request_id, raw_params) =
        match tokio::time::timeout(timeout, wait_for_connect(&mut ws_rx, &tx)).await {
            Ok(Some(found)) => found,
            Ok(None) => {
                debug!(conn_id = %fresh_id, "ws: closed before handshake");
                finish(tx, writer).await;
                return;
            },
            Err(_) => {
                warn!(conn_id = %fresh_id, "ws: handshake timeout");
                let _ = tx.send(Outbound::close(close_codes::PROTOCOL_ERROR, "handshake timeout"));
                finish(tx, writer).await;
                return;
            },
        };

    if state.ws_request_logs {
        info!(
            conn_id = %fresh_id,
            request_id = %request_id,
            method = method_names::CONNECT,
            param_keys = ?top_level_param_keys(&raw_params),
            "ws: received request frame"
        );
    }

    let reject = |error: ErrorShape, close: u16, reason: &str| {
        queue(&tx, &ResponseFrame::err(&request_id, error));
        let _ = tx.send(Outbound::close(close, reason));
    };

    let params: ConnectParams =
        match serde_json::from_value(raw_params.unwrap_or(Value::Null)) {
            Ok(p) => p,
            Err(e) => {
                warn!(conn_id = %fresh_id, error = %e, "ws: malformed connect params");
                reject(
                    ErrorShape::new(error_codes::INVALID_FIELD, format!("invalid connect params: {e}")),
                    close_codes::PROTOCOL_ERROR,
                    "invalid handshake",
                );
                finish(tx, writer).await;
                return;
            },
        };

    if params.min_protocol != PROTOCOL_VERSION {
        warn!(conn_id = %fresh_id, requested = params.min_protocol, "ws: unsupported protocol");
        reject(
            ErrorShape::new(
                error_codes::UNSUPPORTED_PROTOCOL,
                format!(
                    "unsupported protocol: server={PROTOCOL_VERSION}, client={}",
                    params.min_protocol
                ),
            ),
            close_codes::PROTOCOL_ERROR,
            "unsupported protocol",
        );
        finish(tx, writer).await;
        return;
    }

    let token = params.auth.as_ref().and_then(|a| a.token.as_deref());
    let auth_result = auth::authorize_connect(&state.auth, token);
    if !auth_result.ok {
        warn!(
            conn_id = %fresh_id,
            remote_ip = %remote_ip,
            reason = auth_result.reason.unwrap_or("unknown"),
            "ws: auth failed"
        );
        reject(
            ErrorShape::forbidden("unauthorized"),
            close_codes::UNAUTHORIZED,
            "unauthorized",
        );
        finish(tx, writer).await;
        return;
    }

    let mut role = match role_from_connect(&params) {
        Ok(role) => role,
        Err(err) => {
            warn!(conn_id = %fresh_id, error = %err, "ws: invalid client descriptor");
            reject(err, close_codes::PROTOCOL_ERROR, "invalid handshake");
            finish(tx, writer).await;
            return;
        },
    };

    // ── Registration ─────────────────────────────────────────────────────

    let (conn_id, previous) = resolve_connection_id(&state, &params, &role, fresh_id).await;
    let resumed = previous.is_some();
    if let Some(attachment) = previous {
        role = attachment.restore(role, params.tools.is_some());
    }

    let hello = HelloOk {
        r#type: "hello-ok".into(),
        protocol: PROTOCOL_VERSION,
        server: ServerInfo {
            version: state.version.clone(),
            connection_id: conn_id.clone(),
            host: Some(state.hostname.clone()),
        },
        features: Features {
            methods: methods.method_names(),
            events: events::ALL.iter().map(|e| (*e).to_string()).collect(),
        },
        resumed,
    };
    match serde_json::to_value(&hello) {
        Ok(payload) => queue(&tx, &ResponseFrame::ok(&request_id, payload)),
        Err(e) => {
            warn!(conn_id = %conn_id, error = %e, "ws: failed to encode hello");
            finish(tx, writer).await;
            return;
        },
    }

    let mut conn = Connection::new(conn_id.clone(), role.clone(), tx.clone());
    conn.backlog = backlog.clone();
    conn.display_name = params.client.display_name.clone();
    conn.platform = params.client.platform.clone();
    conn.version = params.client.version.clone();
    conn.remote_ip = Some(remote_ip.clone());

    let replaced = {
        let mut inner = state.inner.write().await;
        match &role {
            ConnectionRole::Node { id, tools } => inner.tools.set_node_tools(id, tools.clone()),
            ConnectionRole::Channel {
                channel,
                account_id,
                ..
            } => {
                inner
                    .channels
                    .mark_connected(channel, account_id, now_ms() as u64);
            },
            ConnectionRole::Client { .. } => {},
        }
        inner.connections.register(conn)
    };
    if let Some(old) = replaced {
        info!(conn_id = %old.conn_id, logical_id = %role.logical_id(), "ws: connection replaced");
        old.send(Outbound::close(close_codes::REPLACED, "replaced"));
    }

    let attachment = ConnectionAttachment::new(&conn_id, &role, now_ms());
    if let Err(e) = state.attachments.save(&attachment).await {
        warn!(conn_id = %conn_id, error = %e, "ws: failed to persist attachment");
    }

    info!(
        conn_id = %conn_id,
        mode = %role.mode(),
        id = %role.logical_id(),
        client_version = params.client.version.as_deref().unwrap_or("unknown"),
        resumed,
        "ws: handshake complete"
    );

    if state.claim_scheduler_start() {
        let services = state.services.clone();
        tokio::spawn(async move { services.start_scheduler().await });
    }

    broadcast_presence(&state, &role, true).await;
    if let ConnectionRole::Node { id, .. } = &role {
        state
            .send_event_to_node(id, events::NODE_PROBE, serde_json::json!({}))
            .await;
    }

    // ── Message loop ─────────────────────────────────────────────────────

    let caller = Caller {
        mode: role.mode(),
        id: role.logical_id().to_string(),
    };

    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "ws: read error");
                break;
            },
        };

        let text = match msg {
            Message::Text(t) => t,
            Message::Binary(data) => {
                route_binary(&state, &conn_id, &caller, data).await;
                continue;
            },
            Message::Close(_) => break,
            _ => continue,
        };

        if text.as_str().len() > state.limits.max_payload_bytes {
            warn!(conn_id = %conn_id, size = text.as_str().len(), "ws: payload too large");
            let _ = tx.send(Outbound::close(CLOSE_TOO_BIG, "payload too large"));
            break;
        }

        let frame: GatewayFrame = match serde_json::from_str(text.as_str()) {
            Ok(f) => f,
            Err(e) => {
                warn!(conn_id = %conn_id, error = %e, "ws: invalid frame");
                continue;
            },
        };

        touch(&state, &conn_id).await;

        match frame {
            GatewayFrame::Request(req) => {
                if state.ws_request_logs {
                    info!(
                        conn_id = %conn_id,
                        request_id = %req.id,
                        method = %req.method,
                        param_keys = ?top_level_param_keys(&req.params),
                        "ws: received request frame"
                    );
                }
                let ctx = MethodContext {
                    request_id: req.id.clone(),
                    method: req.method.clone(),
                    params: req.params.unwrap_or(Value::Null),
                    conn_id: conn_id.clone(),
                    caller: caller.clone(),
                    state: Arc::clone(&state),
                };
                let Some(response) = methods.dispatch(ctx).await else {
                    continue;
                };
                if state.ws_request_logs {
                    info!(
                        conn_id = %conn_id,
                        request_id = %req.id,
                        method = %req.method,
                        ok = response.ok,
                        "ws: sent response frame"
                    );
                }
                queue(&tx, &response);
            },
            _ => {
                debug!(conn_id = %conn_id, "ws: ignoring non-request frame");
            },
        }
    }

    // ── Cleanup ──────────────────────────────────────────────────────────

    let departed = {
        let mut inner = state.inner.write().await;
        let removed = inner.connections.unregister(&conn_id);
        if let Some(ConnectionRole::Channel { key, .. }) = removed.as_ref().map(|c| &c.role) {
            inner.channels.mark_disconnected(key);
        }
        removed
    };

    // A replaced connection leaves its logical id to the successor, and its
    // attachment goes with it. Otherwise the attachment stays for a resume.
    let attachment_result = match &departed {
        Some(conn) => {
            let seen = ConnectionAttachment::new(&conn_id, &conn.role, now_ms());
            state.attachments.save(&seen).await
        },
        None => state.attachments.delete(&conn_id).await,
    };
    if let Err(e) = attachment_result {
        warn!(conn_id = %conn_id, error = %e, "ws: failed to update attachment");
    }

    if let Some(conn) = departed {
        if let ConnectionRole::Node { id, .. } = &conn.role {
            state.handle_node_loss(id).await;
        }
        broadcast_presence(&state, &conn.role, false).await;
        info!(
            conn_id = %conn_id,
            mode = %conn.role.mode(),
            id = %conn.role.logical_id(),
            duration_secs = conn.connected_at.elapsed().as_secs(),
            "ws: connection closed"
        );
    } else {
        debug!(conn_id = %conn_id, "ws: replaced connection closed");
    }

    backlog.close();
    finish(tx, writer).await;
}

/// Pick the connection id: a stored attachment for the same role and logical
/// id lends its id to a resuming peer, unless that id is still live. The
/// attachment comes back with the id so its metadata can be restored.
async fn resolve_connection_id(
    state: &GatewayState,
    params: &ConnectParams,
    role: &ConnectionRole,
    fresh_id: String,
) -> (String, Option<ConnectionAttachment>) {
    let Some(resume) = params.resume.as_ref() else {
        return (fresh_id, None);
    };
    let requested = resume.connection_id.as_str();
    if state.inner.read().await.connections.contains(requested) {
        debug!(conn_id = %requested, "ws: resume target still live");
        return (fresh_id, None);
    }
    match state.attachments.load(requested).await {
        Ok(Some(attachment)) if attachment.matches(role) => {
            info!(conn_id = %requested, id = %role.logical_id(), "ws: resuming connection");
            (requested.to_string(), Some(attachment))
        },
        Ok(_) => (fresh_id, None),
        Err(e) => {
            warn!(conn_id = %requested, error = %e, "ws: failed to load attachment");
            (fresh_id, None)
        },
    }
}

/// Hand a binary frame to the transfer coordinator. Only a node that still
/// holds its registration may stream; a replaced socket no longer speaks for
/// its node id. Returns whether the frame was routed.
async fn route_binary(state: &GatewayState, conn_id: &str, caller: &Caller, data: Bytes) -> bool {
    if caller.mode != Mode::Node {
        debug!(conn_id = %conn_id, mode = %caller.mode, "ws: ignoring binary frame");
        return false;
    }
    if !touch(state, conn_id).await {
        debug!(conn_id = %conn_id, "ws: binary frame from unregistered connection dropped");
        return false;
    }
    state.transfers.on_chunk(state, &caller.id, data).await;
    true
}

/// Mark activity. `false` when the connection is no longer registered.
async fn touch(state: &GatewayState, conn_id: &str) -> bool {
    match state.inner.write().await.connections.get_mut(conn_id) {
        Some(conn) => {
            conn.touch();
            true
        },
        None => false,
    }
}

/// Forward queued frames to the socket. A close frame ends the loop.
fn spawn_writer(
    mut ws_tx: futures::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    backlog: Backlog,
    conn_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let (msg, binary_len, last) = match out {
                Outbound::Text(text) => (Message::Text(text.into()), 0, false),
                Outbound::Binary(data) => {
                    let len = data.len();
                    (Message::Binary(data), len, false)
                },
                Outbound::Close { code, reason } => (
                    Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })),
                    0,
                    true,
                ),
            };
            let sent = ws_tx.send(msg).await;
            if binary_len > 0 {
                backlog.written(binary_len);
            }
            if sent.is_err() {
                debug!(conn_id = %conn_id, "ws: write loop closed");
                break;
            }
            if last {
                break;
            }
        }
        backlog.close();
    })
}

/// Drop our sender and give the writer a moment to flush before aborting it.
async fn finish(tx: mpsc::UnboundedSender<Outbound>, mut writer: JoinHandle<()>) {
    drop(tx);
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
}

/// Wait for the first `connect` request. Requests for other methods are
/// answered with "not connected" and waiting continues.
async fn wait_for_connect(
    rx: &mut SplitStream<WebSocket>,
    tx: &mpsc::UnboundedSender<Outbound>,
) -> Option<(String, Option<Value>)> {
    while let Some(msg) = rx.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t,
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        };
        match serde_json::from_str::<GatewayFrame>(text.as_str()) {
            Ok(GatewayFrame::Request(req)) if req.method == method_names::CONNECT => {
                return Some((req.id, req.params));
            },
            Ok(GatewayFrame::Request(req)) => {
                debug!(method = %req.method, "ws: request before handshake");
                queue(
                    tx,
                    &ResponseFrame::err(
                        &req.id,
                        ErrorShape::not_connected("handshake required: send connect first"),
                    ),
                );
            },
            Ok(_) => debug!("ws: ignoring non-request frame before handshake"),
            Err(e) => warn!(error = %e, "ws: invalid frame before handshake"),
        }
    }
    None
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        switchyard_protocol::encode_chunk,
        switchyard_service_traits::Services,
        tokio::sync::oneshot,
    };

    use {
        super::*,
        crate::{
            auth::ResolvedAuth,
            transfer::{Endpoint, MetaParams, TransferWaiter},
        },
    };

    fn connect(client: Value) -> ConnectParams {
        serde_json::from_value(serde_json::json!({
            "minProtocol": 1,
            "maxProtocol": 1,
            "client": client,
            "tools": [{"name": "Read"}],
        }))
        .unwrap()
    }

    #[test]
    fn node_role_carries_tools() {
        let role = role_from_connect(&connect(serde_json::json!({"id": "laptop", "mode": "node"})))
            .unwrap();
        match role {
            ConnectionRole::Node { id, tools } => {
                assert_eq!(id, "laptop");
                assert_eq!(tools[0].name, "Read");
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn client_role_ignores_tools() {
        let role =
            role_from_connect(&connect(serde_json::json!({"id": "ui", "mode": "client"}))).unwrap();
        assert_eq!(role, ConnectionRole::Client { id: "ui".into() });
    }

    #[test]
    fn channel_role_is_keyed_by_account() {
        let role = role_from_connect(&connect(serde_json::json!({
            "id": "bridge", "mode": "channel", "channel": "slack", "accountId": "T1"
        })))
        .unwrap();
        assert_eq!(role.logical_id(), "slack:T1");
    }

    #[tokio::test]
    async fn binary_from_replaced_socket_is_dropped() {
        let state = GatewayState::new(ResolvedAuth::default(), Services::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        state
            .inner
            .write()
            .await
            .connections
            .register(Connection::new("current", ConnectionRole::Node {
                id: "laptop".into(),
                tools: vec![],
            }, tx));

        let coord = &state.transfers;
        let (done_tx, _done) = oneshot::channel();
        let id = coord
            .begin(
                &state,
                Endpoint::new("laptop", "/a"),
                Endpoint::storage("a"),
                TransferWaiter::Local(done_tx),
            )
            .await
            .unwrap();
        coord
            .on_meta(&state, "laptop", MetaParams {
                transfer_id: id,
                size: Some(4),
                mime: None,
                error: None,
            })
            .await
            .unwrap();

        let laptop = Caller {
            mode: Mode::Node,
            id: "laptop".into(),
        };
        assert!(!route_binary(&state, "stale", &laptop, encode_chunk(id, b"evil")).await);
        assert_eq!(coord.list()[0].bytes, 0);

        assert!(route_binary(&state, "current", &laptop, encode_chunk(id, b"good")).await);
        assert_eq!(coord.list()[0].bytes, 4);
    }

    #[tokio::test]
    async fn binary_from_clients_is_ignored() {
        let state = GatewayState::new(ResolvedAuth::default(), Services::default());
        let ui = Caller {
            mode: Mode::Client,
            id: "ui".into(),
        };
        assert!(!route_binary(&state, "c1", &ui, Bytes::from_static(b"\x01\0\0\0x")).await);
    }

    #[test]
    fn invalid_descriptors_are_rejected() {
        for client in [
            serde_json::json!({"id": "x", "mode": "admin"}),
            serde_json::json!({"id": " ", "mode": "client"}),
            serde_json::json!({"id": "b", "mode": "channel", "channel": "slack"}),
        ] {
            let err = role_from_connect(&connect(client)).unwrap_err();
            assert_eq!(err.code, error_codes::INVALID_FIELD);
        }
    }
}
