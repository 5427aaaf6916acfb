use {
    serde::Deserialize,
    serde_json::json,
    tracing::{debug, warn},
};

use {
    switchyard_channels::channel_key,
    switchyard_protocol::{ErrorShape, events, methods},
};

use crate::state::now_ms;

use super::{CHANNEL, CLIENT, MethodRegistry};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendTarget {
    channel: String,
    account_id: String,
}

pub(super) fn register(reg: &mut MethodRegistry) {
    // channels.status
    reg.register(
        methods::CHANNELS_STATUS,
        CLIENT,
        Box::new(|ctx| {
            Box::pin(async move {
                let channels = ctx.state.inner.read().await.channels.list();
                Ok(json!({ "channels": channels }).into())
            })
        }),
    );

    // channel.inbound: a bridge relays a message from its platform
    reg.register(
        methods::CHANNEL_INBOUND,
        CHANNEL,
        Box::new(|ctx| {
            Box::pin(async move {
                let key = ctx.caller.id.clone();
                ctx.state
                    .inner
                    .write()
                    .await
                    .channels
                    .touch(&key, now_ms() as u64)
                    .map_err(|e| ErrorShape::not_found(e.to_string()))?;
                ctx.state
                    .services
                    .session
                    .channel_inbound(&key, ctx.params.clone())
                    .await
                    .map_err(|e| {
                        warn!(channel_key = %key, error = %e, "inbound message not accepted");
                        ErrorShape::from(e)
                    })?;
                Ok(json!({ "ok": true }).into())
            })
        }),
    );

    // channel.send: push an outbound message to a connected bridge
    reg.register(
        methods::CHANNEL_SEND,
        CLIENT,
        Box::new(|ctx| {
            Box::pin(async move {
                let target: SendTarget = ctx.parse_params()?;
                if target.channel.is_empty() || target.account_id.is_empty() {
                    return Err(ErrorShape::bad_request("channel and accountId are required"));
                }
                let key = channel_key(&target.channel, &target.account_id);
                let Some(frame) = ctx.state.event(events::CHANNEL_OUTBOUND, ctx.params.clone())
                else {
                    return Err(ErrorShape::internal("failed to encode outbound message"));
                };
                let sent = ctx
                    .state
                    .inner
                    .read()
                    .await
                    .connections
                    .channel(&key)
                    .is_some_and(|conn| conn.send(frame));
                if !sent {
                    return Err(ErrorShape::not_connected(format!(
                        "channel not connected: {key}"
                    )));
                }
                debug!(channel_key = %key, "outbound message sent");
                Ok(json!({ "status": "sent", "channelKey": key }).into())
            })
        }),
    );
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use {
        serde_json::Value,
        switchyard_protocol::{EventFrame, Mode, error_codes},
        switchyard_service_traits::{ChannelSessionService, SessionEvent, Services},
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

    fn ctx(state: &Arc<GatewayState>, method: &str, params: Value, conn: &str, caller: Caller) -> MethodContext {
        MethodContext {
            request_id: "1".into(),
            method: method.into(),
            params,
            conn_id: conn.into(),
            caller,
            state: Arc::clone(state),
        }
    }

    async fn setup(services: Services) -> (Arc<GatewayState>, mpsc::UnboundedReceiver<Outbound>) {
        let state = GatewayState::new(ResolvedAuth::default(), services);
        let (ctx_tx, _) = mpsc::unbounded_channel();
        let (btx, brx) = mpsc::unbounded_channel();
        {
            let mut inner = state.inner.write().await;
            inner
                .connections
                .register(Connection::new("cc", ConnectionRole::Client { id: "ui".into() }, ctx_tx));
            inner.connections.register(Connection::new(
                "bc",
                ConnectionRole::Channel {
                    key: "slack:T1".into(),
                    channel: "slack".into(),
                    account_id: "T1".into(),
                },
                btx,
            ));
            inner.channels.mark_connected("slack", "T1", 1);
        }
        (state, brx)
    }

    fn client() -> Caller {
        Caller {
            mode: Mode::Client,
            id: "ui".into(),
        }
    }

    fn bridge() -> Caller {
        Caller {
            mode: Mode::Channel,
            id: "slack:T1".into(),
        }
    }

    #[tokio::test]
    async fn send_reaches_bridge() {
        let (state, mut brx) = setup(Services::default()).await;
        let reg = MethodRegistry::new();
        let res = reg
            .dispatch(ctx(
                &state,
                methods::CHANNEL_SEND,
                json!({"channel": "slack", "accountId": "T1", "text": "hello"}),
                "cc",
                client(),
            ))
            .await
            .unwrap();
        assert_eq!(res.payload.unwrap()["status"], "sent");
        let Outbound::Text(text) = brx.try_recv().unwrap() else {
            panic!("expected text");
        };
        let evt: EventFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(evt.event, events::CHANNEL_OUTBOUND);
        assert_eq!(evt.payload.unwrap()["text"], "hello");

        let res = reg
            .dispatch(ctx(
                &state,
                methods::CHANNEL_SEND,
                json!({"channel": "slack", "accountId": "T2"}),
                "cc",
                client(),
            ))
            .await
            .unwrap();
        assert_eq!(res.error.unwrap().code, error_codes::NOT_CONNECTED);
    }

    #[tokio::test]
    async fn inbound_goes_to_session_service() {
        let (session, mut rx) = ChannelSessionService::new();
        let (state, _brx) = setup(Services::default().with_session(Arc::new(session))).await;
        let reg = MethodRegistry::new();
        let res = reg
            .dispatch(ctx(&state, methods::CHANNEL_INBOUND, json!({"text": "hi"}), "bc", bridge()))
            .await
            .unwrap();
        assert!(res.ok);
        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::ChannelInbound { ref channel_key, .. } if channel_key == "slack:T1"
        ));
        let entry = state.inner.read().await.channels.get("slack:T1").unwrap().clone();
        assert!(entry.last_message_at.is_some());
    }

    #[tokio::test]
    async fn inbound_without_session_service_fails() {
        let (state, _brx) = setup(Services::default()).await;
        let reg = MethodRegistry::new();
        let res = reg
            .dispatch(ctx(&state, methods::CHANNEL_INBOUND, json!({}), "bc", bridge()))
            .await
            .unwrap();
        assert!(!res.ok);
    }
}
