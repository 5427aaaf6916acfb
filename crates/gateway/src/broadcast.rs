use {
    serde_json::{Value, json},
    switchyard_protocol::{EventFrame, events},
    tracing::debug,
};

use crate::{connections::ConnectionRole, outbound::Outbound, state::GatewayState};

/// Push an event to every connected client. Nodes and channels never
/// receive broadcasts.
pub async fn broadcast(state: &GatewayState, event: &str, payload: Value) -> usize {
    let seq = state.next_seq();
    let Some(frame) = Outbound::frame(&EventFrame::new(event, payload, seq)) else {
        return 0;
    };

    let inner = state.inner.read().await;
    let mut sent = 0;
    for client in inner.connections.clients() {
        if client.send(frame.clone()) {
            sent += 1;
        }
    }
    debug!(event, seq, clients = sent, "broadcast event");
    sent
}

/// Presence payload for a node or channel coming or going. Clients do not
/// generate presence.
pub fn presence_payload(role: &ConnectionRole, connected: bool) -> Option<Value> {
    let change = if connected {
        "connected"
    } else {
        "disconnected"
    };
    match role {
        ConnectionRole::Client { .. } => None,
        ConnectionRole::Node { id, tools } => Some(json!({
            "type": format!("node.{change}"),
            "nodeId": id,
            "tools": tools.len(),
        })),
        ConnectionRole::Channel {
            key,
            channel,
            account_id,
        } => Some(json!({
            "type": format!("channel.{change}"),
            "channelKey": key,
            "channel": channel,
            "accountId": account_id,
        })),
    }
}

pub async fn broadcast_presence(state: &GatewayState, role: &ConnectionRole, connected: bool) {
    if let Some(payload) = presence_payload(role, connected) {
        broadcast(state, events::PRESENCE, payload).await;
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {switchyard_service_traits::Services, tokio::sync::mpsc};

    use {
        super::*,
        crate::{auth::ResolvedAuth, connections::Connection},
    };

    #[tokio::test]
    async fn presence_reaches_clients_only() {
        let state = GatewayState::new(ResolvedAuth::default(), Services::default());
        let (ctx, mut crx) = mpsc::unbounded_channel();
        let (ntx, mut nrx) = mpsc::unbounded_channel();
        {
            let mut inner = state.inner.write().await;
            inner.connections.register(Connection::new(
                "c1",
                ConnectionRole::Client { id: "ui".into() },
                ctx,
            ));
            inner.connections.register(Connection::new(
                "n1",
                ConnectionRole::Node {
                    id: "laptop".into(),
                    tools: vec![],
                },
                ntx,
            ));
        }

        let role = ConnectionRole::Node {
            id: "laptop".into(),
            tools: vec![],
        };
        broadcast_presence(&state, &role, true).await;

        let Outbound::Text(text) = crx.try_recv().unwrap() else {
            panic!("expected text frame");
        };
        let evt: EventFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(evt.event, "presence");
        assert_eq!(evt.payload.unwrap()["type"], "node.connected");
        assert!(nrx.try_recv().is_err());
    }

    #[test]
    fn clients_have_no_presence() {
        assert!(presence_payload(&ConnectionRole::Client { id: "x".into() }, true).is_none());
        let payload = presence_payload(
            &ConnectionRole::Channel {
                key: "slack:T1".into(),
                channel: "slack".into(),
                account_id: "T1".into(),
            },
            false,
        )
        .unwrap();
        assert_eq!(payload["type"], "channel.disconnected");
        assert_eq!(payload["accountId"], "T1");
    }
}
