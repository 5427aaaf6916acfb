use std::time::Instant;

use {
    serde::Deserialize,
    serde_json::{Map, Value, json},
};

use switchyard_protocol::{ErrorShape, events, methods};

use crate::pending::PendingLogCall;

use super::{CLIENT, MethodRegistry, MethodReply, NODE, ack, peer_error};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetParams {
    node_id: Option<String>,
    /// Filter options forwarded to the node untouched.
    #[serde(flatten)]
    options: Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultParams {
    call_id: String,
    logs: Option<Value>,
    error: Option<Value>,
}

pub(super) fn register(reg: &mut MethodRegistry) {
    // logs.get
    reg.register(
        methods::LOGS_GET,
        CLIENT,
        Box::new(|ctx| {
            Box::pin(async move {
                let params: GetParams = if ctx.params.is_null() {
                    GetParams {
                        node_id: None,
                        options: Map::new(),
                    }
                } else {
                    ctx.parse_params()?
                };
                let call_id = uuid::Uuid::new_v4().to_string();

                let node_id = {
                    let mut inner = ctx.state.inner.write().await;
                    let node_id = match params.node_id {
                        Some(id) if inner.connections.is_node_connected(&id) => id,
                        Some(id) => {
                            return Err(ErrorShape::not_connected(format!(
                                "node not connected: {id}"
                            )));
                        },
                        None => match inner.connections.node_ids().as_slice() {
                            [] => return Err(ErrorShape::not_connected("no nodes connected")),
                            [only] => (*only).to_string(),
                            _ => {
                                return Err(ErrorShape::bad_request(
                                    "multiple nodes connected, nodeId required",
                                ));
                            },
                        },
                    };
                    inner.ledger.logs.insert(PendingLogCall {
                        call_id: call_id.clone(),
                        node_id: node_id.clone(),
                        client_id: ctx.caller.id.clone(),
                        conn_id: ctx.conn_id.clone(),
                        frame_id: ctx.request_id.clone(),
                        created_at: Instant::now(),
                    });
                    node_id
                };

                let mut payload = params.options;
                payload.insert("callId".into(), Value::String(call_id.clone()));
                let sent = ctx
                    .state
                    .send_event_to_node(&node_id, events::LOGS_GET, Value::Object(payload))
                    .await;
                if !sent && ctx.state.inner.write().await.ledger.logs.remove(&call_id).is_some() {
                    return Err(ErrorShape::not_connected(format!(
                        "node not connected: {node_id}"
                    )));
                }
                Ok(MethodReply::Deferred)
            })
        }),
    );

    // logs.result
    reg.register(
        methods::LOGS_RESULT,
        NODE,
        Box::new(|ctx| {
            Box::pin(async move {
                let params: ResultParams = ctx.parse_params()?;
                let call = ctx
                    .state
                    .inner
                    .write()
                    .await
                    .ledger
                    .logs
                    .take(&params.call_id, &ctx.caller.id)?;
                let outcome = match params.error {
                    Some(error) => Err(peer_error(&error)),
                    None => Ok(json!({
                        "nodeId": call.node_id,
                        "logs": params.logs.unwrap_or_else(|| json!([])),
                    })),
                };
                let delivered = ctx.state.complete_log_call(call, outcome).await;
                Ok(ack(delivered).into())
            })
        }),
    );
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use {
        switchyard_protocol::{EventFrame, Mode, ResponseFrame, error_codes},
        switchyard_service_traits::Services,
        tokio::sync::mpsc,
    };

    use {
        super::*,
        crate::{
            auth::ResolvedAuth,
            connections::{Connection, ConnectionRole},
            methods::{Caller, MethodContext},
            outbound::Outbound,
            state::GatewayState,
        },
    };

    fn node(id: &str, tx: mpsc::UnboundedSender<Outbound>) -> Connection {
        Connection::new(
            format!("conn-{id}"),
            ConnectionRole::Node {
                id: id.into(),
                tools: vec![],
            },
            tx,
        )
    }

    fn ctx(state: &Arc<GatewayState>, method: &str, params: Value, conn: &str, caller: Caller) -> MethodContext {
        MethodContext {
            request_id: "r1".into(),
            method: method.into(),
            params,
            conn_id: conn.into(),
            caller,
            state: Arc::clone(state),
        }
    }

    fn client() -> Caller {
        Caller {
            mode: Mode::Client,
            id: "ui".into(),
        }
    }

    fn node_caller(id: &str) -> Caller {
        Caller {
            mode: Mode::Node,
            id: id.into(),
        }
    }

    fn text<T: serde::de::DeserializeOwned>(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> T {
        match rx.try_recv().unwrap() {
            Outbound::Text(t) => serde_json::from_str(&t).unwrap(),
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn logs_are_forwarded_and_returned() {
        let state = GatewayState::new(ResolvedAuth::default(), Services::default());
        let reg = MethodRegistry::new();
        let (ctx_tx, mut crx) = mpsc::unbounded_channel();
        let (ntx, mut nrx) = mpsc::unbounded_channel();
        {
            let mut inner = state.inner.write().await;
            inner
                .connections
                .register(Connection::new("cc", ConnectionRole::Client { id: "ui".into() }, ctx_tx));
            inner.connections.register(node("laptop", ntx));
        }

        let res = reg
            .dispatch(ctx(&state, methods::LOGS_GET, json!({"lines": 50}), "cc", client()))
            .await;
        assert!(res.is_none());

        let evt: EventFrame = text(&mut nrx);
        let payload = evt.payload.unwrap();
        assert_eq!(payload["lines"], 50);
        let call_id = payload["callId"].as_str().unwrap().to_string();

        reg.dispatch(ctx(
            &state,
            methods::LOGS_RESULT,
            json!({"callId": call_id, "logs": ["a", "b"]}),
            "conn-laptop",
            node_caller("laptop"),
        ))
        .await
        .unwrap();

        let res: ResponseFrame = text(&mut crx);
        assert_eq!(res.id, "r1");
        let payload = res.payload.unwrap();
        assert_eq!(payload["nodeId"], "laptop");
        assert_eq!(payload["logs"][1], "b");
    }

    #[tokio::test]
    async fn another_node_cannot_answer() {
        let state = GatewayState::new(ResolvedAuth::default(), Services::default());
        let reg = MethodRegistry::new();
        let (ctx_tx, mut crx) = mpsc::unbounded_channel();
        let (atx, mut arx) = mpsc::unbounded_channel();
        let (btx, _brx) = mpsc::unbounded_channel();
        {
            let mut inner = state.inner.write().await;
            inner
                .connections
                .register(Connection::new("cc", ConnectionRole::Client { id: "ui".into() }, ctx_tx));
            inner.connections.register(node("a", atx));
            inner.connections.register(node("b", btx));
        }

        reg.dispatch(ctx(&state, methods::LOGS_GET, json!({"nodeId": "a"}), "cc", client()))
            .await;
        let evt: EventFrame = text(&mut arx);
        let call_id = evt.payload.unwrap()["callId"].as_str().unwrap().to_string();

        let res = reg
            .dispatch(ctx(
                &state,
                methods::LOGS_RESULT,
                json!({"callId": call_id, "logs": []}),
                "conn-b",
                node_caller("b"),
            ))
            .await
            .unwrap();
        assert_eq!(res.error.unwrap().code, error_codes::FORBIDDEN);
        assert!(crx.try_recv().is_err());
        assert!(state.inner.read().await.ledger.logs.contains(&call_id));
    }

    #[tokio::test]
    async fn node_selection_errors() {
        let state = GatewayState::new(ResolvedAuth::default(), Services::default());
        let reg = MethodRegistry::new();
        let (ctx_tx, _crx) = mpsc::unbounded_channel();
        state
            .inner
            .write()
            .await
            .connections
            .register(Connection::new("cc", ConnectionRole::Client { id: "ui".into() }, ctx_tx));

        let res = reg
            .dispatch(ctx(&state, methods::LOGS_GET, Value::Null, "cc", client()))
            .await
            .unwrap();
        assert_eq!(res.error.unwrap().code, error_codes::NOT_CONNECTED);

        let (atx, _arx) = mpsc::unbounded_channel();
        let (btx, _brx) = mpsc::unbounded_channel();
        {
            let mut inner = state.inner.write().await;
            inner.connections.register(node("a", atx));
            inner.connections.register(node("b", btx));
        }
        let res = reg
            .dispatch(ctx(&state, methods::LOGS_GET, json!({}), "cc", client()))
            .await
            .unwrap();
        assert_eq!(res.error.unwrap().code, error_codes::BAD_REQUEST);

        let res = reg
            .dispatch(ctx(&state, methods::LOGS_GET, json!({"nodeId": "zzz"}), "cc", client()))
            .await
            .unwrap();
        assert_eq!(res.error.unwrap().code, error_codes::NOT_CONNECTED);
    }
}
