use {
    serde::Deserialize,
    serde_json::{Value, json},
    tracing::{debug, warn},
};

use switchyard_protocol::{ErrorShape, methods};

use crate::connections::ConnectionRole;

use super::{CLIENT, MethodRegistry, NODE};

/// Sub-process statuses after which no further events arrive.
const TERMINAL_EXEC_STATUSES: &[&str] = &["exited", "completed", "failed", "killed"];

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecEventParams {
    process_id: String,
    status: Option<String>,
}

pub(super) fn register(reg: &mut MethodRegistry) {
    // node.list
    reg.register(
        methods::NODE_LIST,
        CLIENT,
        Box::new(|ctx| {
            Box::pin(async move {
                let inner = ctx.state.inner.read().await;
                let nodes: Vec<Value> = inner
                    .connections
                    .nodes()
                    .into_iter()
                    .filter_map(|conn| {
                        let ConnectionRole::Node { id, tools } = &conn.role else {
                            return None;
                        };
                        Some(json!({
                            "nodeId": id,
                            "connId": conn.conn_id,
                            "displayName": conn.display_name,
                            "platform": conn.platform,
                            "version": conn.version,
                            "remoteIp": conn.remote_ip,
                            "connectedMs": conn.connected_at.elapsed().as_millis() as u64,
                            "tools": tools,
                            "probe": conn.probe,
                        }))
                    })
                    .collect();
                Ok(json!({ "nodes": nodes }).into())
            })
        }),
    );

    // node.probe.result
    reg.register(
        methods::NODE_PROBE_RESULT,
        NODE,
        Box::new(|ctx| {
            Box::pin(async move {
                let mut inner = ctx.state.inner.write().await;
                if let Some(conn) = inner.connections.node_mut(&ctx.caller.id) {
                    conn.probe = Some(ctx.params.clone());
                    debug!(node_id = %ctx.caller.id, "stored probe result");
                }
                Ok(json!({ "ok": true }).into())
            })
        }),
    );

    // node.exec.event
    reg.register(
        methods::NODE_EXEC_EVENT,
        NODE,
        Box::new(|ctx| {
            Box::pin(async move {
                let params: ExecEventParams = ctx.parse_params()?;
                let node_id = ctx.caller.id.as_str();
                let terminal = params
                    .status
                    .as_deref()
                    .is_some_and(|s| TERMINAL_EXEC_STATUSES.contains(&s));

                let route = {
                    let mut inner = ctx.state.inner.write().await;
                    if terminal {
                        inner.ledger.remove_exec(node_id, &params.process_id)
                    } else {
                        inner
                            .ledger
                            .exec_route(node_id, &params.process_id)
                            .cloned()
                    }
                };
                let Some(route) = route else {
                    debug!(node_id, process_id = %params.process_id, "exec event for untracked process");
                    return Ok(json!({ "ok": true, "dropped": true }).into());
                };

                ctx.state
                    .services
                    .session
                    .exec_event(&route.session_key, &route.call_id, node_id, ctx.params.clone())
                    .await
                    .map_err(|e| {
                        warn!(node_id, session_key = %route.session_key, error = %e, "session rejected exec event");
                        ErrorShape::from(e)
                    })?;
                Ok(json!({ "ok": true }).into())
            })
        }),
    );
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use {
        switchyard_protocol::Mode,
        switchyard_service_traits::{ChannelSessionService, SessionEvent, Services},
        tokio::sync::mpsc,
    };

    use {
        super::*,
        crate::{
            auth::ResolvedAuth,
            connections::Connection,
            methods::{Caller, MethodContext},
            pending::ExecRoute,
            state::GatewayState,
        },
    };

    fn ctx(state: &Arc<GatewayState>, method: &str, params: Value) -> MethodContext {
        MethodContext {
            request_id: "1".into(),
            method: method.into(),
            params,
            conn_id: "nc".into(),
            caller: Caller {
                mode: Mode::Node,
                id: "laptop".into(),
            },
            state: Arc::clone(state),
        }
    }

    async fn with_node(state: &Arc<GatewayState>) -> mpsc::UnboundedReceiver<crate::outbound::Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        state.inner.write().await.connections.register(Connection::new(
            "nc",
            ConnectionRole::Node {
                id: "laptop".into(),
                tools: vec![],
            },
            tx,
        ));
        rx
    }

    #[tokio::test]
    async fn exec_events_follow_route_until_terminal() {
        let (session, mut rx) = ChannelSessionService::new();
        let state = GatewayState::new(
            ResolvedAuth::default(),
            Services::default().with_session(Arc::new(session)),
        );
        let _n = with_node(&state).await;
        state.inner.write().await.ledger.record_exec("laptop", "p1", ExecRoute {
            session_key: "s1".into(),
            call_id: "c1".into(),
        });
        let reg = MethodRegistry::new();

        let res = reg
            .dispatch(ctx(&state, methods::NODE_EXEC_EVENT, json!({"processId": "p1", "stdout": "hi"})))
            .await
            .unwrap();
        assert!(res.ok);
        match rx.recv().await.unwrap() {
            SessionEvent::ExecEvent {
                session_key,
                call_id,
                payload,
                ..
            } => {
                assert_eq!(session_key, "s1");
                assert_eq!(call_id, "c1");
                assert_eq!(payload["stdout"], "hi");
            },
            other => panic!("unexpected {other:?}"),
        }

        reg.dispatch(ctx(&state, methods::NODE_EXEC_EVENT, json!({"processId": "p1", "status": "exited"})))
            .await
            .unwrap();
        assert_eq!(state.inner.read().await.ledger.exec_count(), 0);

        let res = reg
            .dispatch(ctx(&state, methods::NODE_EXEC_EVENT, json!({"processId": "p1"})))
            .await
            .unwrap();
        assert_eq!(res.payload.unwrap()["dropped"], true);
    }

    #[tokio::test]
    async fn probe_result_is_kept_on_connection() {
        let state = GatewayState::new(ResolvedAuth::default(), Services::default());
        let _n = with_node(&state).await;
        let reg = MethodRegistry::new();
        reg.dispatch(ctx(&state, methods::NODE_PROBE_RESULT, json!({"os": "linux"})))
            .await
            .unwrap();
        let inner = state.inner.read().await;
        assert_eq!(inner.connections.node("laptop").unwrap().probe.as_ref().unwrap()["os"], "linux");
    }
}
