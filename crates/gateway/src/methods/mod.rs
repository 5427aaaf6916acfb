use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use {
    serde::de::DeserializeOwned,
    serde_json::Value,
    tracing::{debug, warn},
};

use switchyard_protocol::{ErrorShape, Mode, ResponseFrame, error_codes, methods};

use crate::{state::GatewayState, transfer::describe_peer_error};

mod channel;
mod gateway;
mod logs;
mod node;
mod tools;
mod transfer;

// ── Types ────────────────────────────────────────────────────────────────────

/// The authenticated peer behind a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub mode: Mode,
    /// Client id, node id, or channel key.
    pub id: String,
}

/// Context passed to every method handler.
pub struct MethodContext {
    pub request_id: String,
    pub method: String,
    pub params: Value,
    pub conn_id: String,
    pub caller: Caller,
    pub state: Arc<GatewayState>,
}

impl MethodContext {
    pub fn parse_params<T: DeserializeOwned>(&self) -> Result<T, ErrorShape> {
        parse_params(&self.params)
    }
}

/// What a handler did with the request.
#[derive(Debug, Clone, PartialEq)]
pub enum MethodReply {
    /// Send this payload now.
    Answered(Value),
    /// No response now; a later frame from another connection completes the
    /// request under its original id.
    Deferred,
}

impl From<Value> for MethodReply {
    fn from(value: Value) -> Self {
        Self::Answered(value)
    }
}

/// The result a method handler produces.
pub type MethodResult = Result<MethodReply, ErrorShape>;

/// A boxed async method handler.
pub type HandlerFn =
    Box<dyn Fn(MethodContext) -> Pin<Box<dyn Future<Output = MethodResult> + Send>> + Send + Sync>;

// ── Role authorization ───────────────────────────────────────────────────────

pub(crate) const ANY: &[Mode] = &[Mode::Client, Mode::Node, Mode::Channel];
pub(crate) const CLIENT: &[Mode] = &[Mode::Client];
pub(crate) const NODE: &[Mode] = &[Mode::Node];
pub(crate) const CHANNEL: &[Mode] = &[Mode::Channel];

fn authorize(method: &str, roles: &[Mode], caller: &Caller) -> Option<ErrorShape> {
    if roles.contains(&caller.mode) {
        return None;
    }
    let allowed: Vec<&str> = roles.iter().map(|m| m.as_str()).collect();
    Some(ErrorShape::forbidden(format!(
        "{method} is not available to {} connections (requires {})",
        caller.mode,
        allowed.join(" or ")
    )))
}

// ── Param helpers ────────────────────────────────────────────────────────────

pub(crate) fn parse_params<T: DeserializeOwned>(params: &Value) -> Result<T, ErrorShape> {
    serde_json::from_value(params.clone())
        .map_err(|e| ErrorShape::bad_request(format!("invalid params: {e}")))
}

/// Error reported by a peer: `{code, message}` keeps its code, anything
/// else becomes a 500.
pub(crate) fn peer_error(error: &Value) -> ErrorShape {
    let code = error
        .get("code")
        .and_then(Value::as_i64)
        .and_then(|c| i32::try_from(c).ok());
    match code {
        Some(code) => ErrorShape::new(code, describe_peer_error(error)),
        None => ErrorShape::internal(describe_peer_error(error)),
    }
}

/// Acknowledgement for a completion frame; `dropped` when nobody was left
/// to receive it.
pub(crate) fn ack(delivered: bool) -> Value {
    if delivered {
        serde_json::json!({ "ok": true })
    } else {
        serde_json::json!({ "ok": true, "dropped": true })
    }
}

// ── Method registry ──────────────────────────────────────────────────────────

struct MethodEntry {
    roles: &'static [Mode],
    handler: HandlerFn,
}

pub struct MethodRegistry {
    handlers: HashMap<String, MethodEntry>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        let mut reg = Self {
            handlers: HashMap::new(),
        };
        reg.register_defaults();
        reg
    }

    pub fn register(
        &mut self,
        method: impl Into<String>,
        roles: &'static [Mode],
        handler: HandlerFn,
    ) {
        self.handlers
            .insert(method.into(), MethodEntry { roles, handler });
    }

    /// Route a request. `None` means the handler deferred its answer.
    pub async fn dispatch(&self, ctx: MethodContext) -> Option<ResponseFrame> {
        let method = ctx.method.clone();
        let request_id = ctx.request_id.clone();
        let conn_id = ctx.conn_id.clone();

        if method == methods::CONNECT {
            return Some(ResponseFrame::err(
                &request_id,
                ErrorShape::bad_request("already connected"),
            ));
        }

        let Some(entry) = self.handlers.get(&method) else {
            warn!(method, conn_id = %conn_id, "unknown method");
            return Some(ResponseFrame::err(
                &request_id,
                ErrorShape::not_found(format!("unknown method: {method}")),
            ));
        };

        if let Some(err) = authorize(&method, entry.roles, &ctx.caller) {
            warn!(method, conn_id = %conn_id, role = %ctx.caller.mode, "method role denied");
            return Some(ResponseFrame::err(&request_id, err));
        }

        // A replaced connection may still have frames in flight.
        if !ctx.state.inner.read().await.connections.contains(&conn_id) {
            debug!(method, conn_id = %conn_id, "request from unregistered connection");
            return Some(ResponseFrame::err(
                &request_id,
                ErrorShape::not_connected("connection is no longer registered"),
            ));
        }

        debug!(method, request_id = %request_id, conn_id = %conn_id, "dispatching method");
        match (entry.handler)(ctx).await {
            Ok(MethodReply::Answered(payload)) => {
                debug!(method, request_id = %request_id, "method ok");
                Some(ResponseFrame::ok(&request_id, payload))
            },
            Ok(MethodReply::Deferred) => {
                debug!(method, request_id = %request_id, "method deferred");
                None
            },
            Err(err) => {
                if err.code == error_codes::NOT_CONNECTED || err.code == error_codes::UNAVAILABLE {
                    debug!(method, request_id = %request_id, code = %err.code, msg = %err.message, "method unavailable");
                } else {
                    warn!(method, request_id = %request_id, code = %err.code, msg = %err.message, "method error");
                }
                Some(ResponseFrame::err(&request_id, err))
            },
        }
    }

    /// Every method a peer can call, including `connect`.
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.push(methods::CONNECT.to_string());
        names.sort();
        names
    }

    fn register_defaults(&mut self) {
        gateway::register(self);
        tools::register(self);
        logs::register(self);
        node::register(self);
        transfer::register(self);
        channel::register(self);
    }
}
