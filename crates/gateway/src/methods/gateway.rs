use {serde_json::json, switchyard_protocol::methods};

use super::{ANY, MethodRegistry};

pub(super) fn register(reg: &mut MethodRegistry) {
    // health
    reg.register(
        methods::HEALTH,
        ANY,
        Box::new(|ctx| {
            Box::pin(async move {
                let counts = ctx.state.inner.read().await.connections.counts();
                Ok(json!({
                    "ok": true,
                    "version": ctx.state.version,
                    "uptimeMs": ctx.state.uptime_ms(),
                    "connections": counts,
                })
                .into())
            })
        }),
    );

    // status
    reg.register(
        methods::STATUS,
        ANY,
        Box::new(|ctx| {
            Box::pin(async move {
                let (counts, tools, logs, execs, channels) = {
                    let inner = ctx.state.inner.read().await;
                    (
                        inner.connections.counts(),
                        inner.ledger.tools.len(),
                        inner.ledger.logs.len(),
                        inner.ledger.exec_count(),
                        inner.channels.connected_count(),
                    )
                };
                Ok(json!({
                    "version": ctx.state.version,
                    "hostname": ctx.state.hostname,
                    "uptimeMs": ctx.state.uptime_ms(),
                    "connections": counts,
                    "pendingCalls": {
                        "tools": tools,
                        "logs": logs,
                        "execs": execs,
                    },
                    "connectedChannels": channels,
                    "transfers": ctx.state.transfers.list(),
                })
                .into())
            })
        }),
    );
}
