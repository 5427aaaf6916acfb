use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use {
    serde_json::Value,
    tokio::sync::RwLock,
    tracing::{debug, info, warn},
};

use {
    switchyard_channels::ChannelRegistry,
    switchyard_config::LimitsConfig,
    switchyard_protocol::{ErrorShape, EventFrame, ResponseFrame},
    switchyard_service_traits::{Services, ToolCallOutcome},
    switchyard_storage::{MemoryObjectStore, ObjectStore},
};

use crate::{
    attachments::{AttachmentStore, MemoryAttachmentStore},
    auth::ResolvedAuth,
    connections::ConnectionRegistry,
    outbound::{Delivery, Outbound, Payload, Target},
    pending::{CallLedger, CallWaiter, Drained, PendingLogCall, PendingToolCall},
    tools::ToolRegistry,
    transfer::TransferCoordinator,
};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// ── Router tables ────────────────────────────────────────────────────────────

/// Registries mutated by the frame handlers, behind one lock.
#[derive(Default)]
pub struct GatewayInner {
    pub connections: ConnectionRegistry,
    pub tools: ToolRegistry,
    pub ledger: CallLedger,
    pub channels: ChannelRegistry,
}

/// Counts removed by one expiry pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub calls: usize,
    pub transfers: usize,
    pub attachments: u64,
}

// ── Gateway state ────────────────────────────────────────────────────────────

/// Shared router runtime state, wrapped in Arc for use across async tasks.
///
/// Lock order: the transfer table is never locked while `inner` is held.
pub struct GatewayState {
    pub inner: RwLock<GatewayInner>,
    /// Live binary transfers.
    pub transfers: TransferCoordinator,
    /// Monotonically increasing sequence counter for events.
    pub seq: AtomicU64,
    /// Server version string.
    pub version: String,
    /// Hostname for HelloOk.
    pub hostname: String,
    pub auth: ResolvedAuth,
    pub limits: LimitsConfig,
    /// External collaborators.
    pub services: Services,
    /// The router's own object store.
    pub objects: Arc<dyn ObjectStore>,
    /// Durable per-connection metadata.
    pub attachments: Arc<dyn AttachmentStore>,
    /// Log every request frame at info level.
    pub ws_request_logs: bool,
    scheduler_started: AtomicBool,
    started_at: Instant,
}

impl GatewayState {
    /// State with in-memory stores and default limits.
    pub fn new(auth: ResolvedAuth, services: Services) -> Arc<Self> {
        Self::with_options(
            auth,
            services,
            LimitsConfig::default(),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(MemoryAttachmentStore::new()),
            false,
        )
    }

    pub fn with_options(
        auth: ResolvedAuth,
        services: Services,
        limits: LimitsConfig,
        objects: Arc<dyn ObjectStore>,
        attachments: Arc<dyn AttachmentStore>,
        ws_request_logs: bool,
    ) -> Arc<Self> {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".into());

        Arc::new(Self {
            inner: RwLock::new(GatewayInner::default()),
            transfers: TransferCoordinator::new(),
            seq: AtomicU64::new(0),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname,
            auth,
            limits,
            services,
            objects,
            attachments,
            ws_request_logs,
            scheduler_started: AtomicBool::new(false),
            started_at: Instant::now(),
        })
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    /// True exactly once: for the caller that should start the scheduler.
    pub fn claim_scheduler_start(&self) -> bool {
        self.scheduler_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn event(&self, event: &str, payload: Value) -> Option<Outbound> {
        Outbound::frame(&EventFrame::new(event, payload, self.next_seq()))
    }

    // ── Delivery ─────────────────────────────────────────────────────────────

    /// Resolve each delivery against the live registry and queue it. Targets
    /// that are gone are skipped. Returns how many were queued.
    pub async fn deliver(&self, deliveries: Vec<Delivery>) -> usize {
        if deliveries.is_empty() {
            return 0;
        }
        let inner = self.inner.read().await;
        let mut sent = 0;
        for delivery in deliveries {
            let conn = match &delivery.target {
                Target::Node(node_id) => inner.connections.node(node_id),
                Target::Client { client_id, conn_id } => inner
                    .connections
                    .client(client_id)
                    .filter(|c| c.conn_id == *conn_id),
            };
            let Some(conn) = conn else {
                debug!(to = ?delivery.target, "delivery target gone, dropped");
                continue;
            };
            let (frame, binary_len) = match delivery.payload {
                Payload::Event { event, payload } => (self.event(event, payload), 0),
                Payload::Response(frame) => (Outbound::frame(&frame), 0),
                Payload::Binary(data) => {
                    let len = data.len();
                    (Some(Outbound::Binary(data)), len)
                },
            };
            let Some(frame) = frame else {
                continue;
            };
            // Counted before the send so the write loop never sees it negative.
            conn.backlog.add(binary_len);
            if conn.send(frame) {
                sent += 1;
            } else {
                conn.backlog.written(binary_len);
            }
        }
        sent
    }

    pub async fn send_event_to_node(&self, node_id: &str, event: &'static str, payload: Value) -> bool {
        self.deliver(vec![Delivery::event_to_node(node_id, event, payload)])
            .await
            == 1
    }

    // ── Call completion ──────────────────────────────────────────────────────

    /// Hand a finished tool call to whoever waits for it. Returns `false` when
    /// the waiting client is gone and the result was dropped.
    pub async fn complete_tool_call(
        &self,
        call: PendingToolCall,
        outcome: Result<Value, ErrorShape>,
    ) -> bool {
        match call.waiter {
            CallWaiter::Client {
                client_id,
                conn_id,
                frame_id,
            } => {
                let frame = ResponseFrame::from_result(
                    frame_id,
                    outcome.map(|result| serde_json::json!({ "result": result })),
                );
                let delivered = self
                    .deliver(vec![Delivery::response_to_client(
                        client_id.as_str(),
                        conn_id,
                        frame,
                    )])
                    .await
                    == 1;
                if !delivered {
                    debug!(call_id = %call.call_id, client_id = %client_id, "client gone, tool result dropped");
                }
                delivered
            },
            CallWaiter::Session { session_key } => {
                let outcome = match outcome {
                    Ok(value) => ToolCallOutcome::Completed(value),
                    Err(err) => ToolCallOutcome::Failed(err),
                };
                if let Err(e) = self
                    .services
                    .session
                    .tool_result(&session_key, &call.call_id, outcome)
                    .await
                {
                    warn!(call_id = %call.call_id, session_key = %session_key, error = %e, "session rejected tool result");
                }
                true
            },
        }
    }

    pub async fn complete_log_call(
        &self,
        call: PendingLogCall,
        outcome: Result<Value, ErrorShape>,
    ) -> bool {
        let frame = ResponseFrame::from_result(call.frame_id, outcome);
        let delivered = self
            .deliver(vec![Delivery::response_to_client(
                call.client_id.as_str(),
                call.conn_id,
                frame,
            )])
            .await
            == 1;
        if !delivered {
            debug!(call_id = %call.call_id, client_id = %call.client_id, "client gone, logs dropped");
        }
        delivered
    }

    /// Complete every drained call with the same error.
    pub async fn fail_calls(&self, drained: Drained, error: ErrorShape) {
        for call in drained.tools {
            self.complete_tool_call(call, Err(error.clone())).await;
        }
        for call in drained.logs {
            self.complete_log_call(call, Err(error.clone())).await;
        }
    }

    /// A node's connection is gone: fail its in-flight calls and transfers.
    pub async fn handle_node_loss(&self, node_id: &str) {
        let drained = self.inner.write().await.ledger.drain_node(node_id);
        if !drained.is_empty() {
            info!(
                node_id,
                tools = drained.tools.len(),
                logs = drained.logs.len(),
                "failing calls for disconnected node"
            );
        }
        let error = ErrorShape::not_connected(format!("node disconnected: {node_id}"));
        self.fail_calls(drained, error).await;
        self.transfers.fail_for_node(self, node_id).await;
    }

    // ── Expiry ───────────────────────────────────────────────────────────────

    /// Expire stale calls, idle transfers and old attachments.
    pub async fn sweep(&self, now: Instant) -> SweepReport {
        let call_ttl = Duration::from_secs(self.limits.pending_call_ttl_secs);
        let drained = self.inner.write().await.ledger.drain_expired(call_ttl, now);
        let calls = drained.tools.len() + drained.logs.len();
        self.fail_calls(drained, ErrorShape::unavailable("timed out"))
            .await;

        let transfer_ttl = Duration::from_secs(self.limits.transfer_ttl_secs);
        let transfers = self.transfers.sweep(self, transfer_ttl, now).await;

        let cutoff = now_ms() - (self.limits.attachment_ttl_secs as i64) * 1000;
        let attachments = match self.attachments.purge_older_than(cutoff).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "failed to purge connection attachments");
                0
            },
        };

        let report = SweepReport {
            calls,
            transfers,
            attachments,
        };
        if report != SweepReport::default() {
            info!(?report, "expired stale entries");
        }
        report
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        switchyard_protocol::error_codes,
        switchyard_service_traits::{ChannelSessionService, SessionEvent},
        tokio::sync::mpsc,
    };

    use {
        super::*,
        crate::connections::{Connection, ConnectionRole},
    };

    async fn add(
        state: &GatewayState,
        conn_id: &str,
        role: ConnectionRole,
    ) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        state
            .inner
            .write()
            .await
            .connections
            .register(Connection::new(conn_id, role, tx));
        rx
    }

    fn client_call(call_id: &str, conn_id: &str, created_at: Instant) -> PendingToolCall {
        PendingToolCall {
            call_id: call_id.into(),
            node_id: "laptop".into(),
            tool: "Read".into(),
            waiter: CallWaiter::Client {
                client_id: "ui".into(),
                conn_id: conn_id.into(),
                frame_id: "7".into(),
            },
            created_at,
        }
    }

    fn response(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> ResponseFrame {
        match rx.try_recv().unwrap() {
            Outbound::Text(t) => serde_json::from_str(&t).unwrap(),
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[test]
    fn scheduler_start_is_claimed_once() {
        let state = GatewayState::new(ResolvedAuth::default(), Services::default());
        assert!(state.claim_scheduler_start());
        assert!(!state.claim_scheduler_start());
    }

    #[tokio::test]
    async fn client_result_goes_to_original_connection_only() {
        let state = GatewayState::new(ResolvedAuth::default(), Services::default());
        let mut rx = add(&state, "c1", ConnectionRole::Client { id: "ui".into() }).await;

        let call = client_call("C1", "c1", Instant::now());
        assert!(
            state
                .complete_tool_call(call, Ok(serde_json::json!({"content": "hi"})))
                .await
        );
        let frame = response(&mut rx);
        assert_eq!(frame.id, "7");
        assert_eq!(frame.payload.unwrap()["result"]["content"], "hi");

        // Same client id, different connection: dropped.
        let call = client_call("C2", "c0", Instant::now());
        assert!(!state.complete_tool_call(call, Ok(Value::Null)).await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn node_loss_fails_session_calls() {
        let (session, mut events) = ChannelSessionService::new();
        let services = Services::default().with_session(Arc::new(session));
        let state = GatewayState::new(ResolvedAuth::default(), services);
        state.inner.write().await.ledger.tools.insert(PendingToolCall {
            call_id: "C1".into(),
            node_id: "laptop".into(),
            tool: "Read".into(),
            waiter: CallWaiter::Session {
                session_key: "s1".into(),
            },
            created_at: Instant::now(),
        });

        state.handle_node_loss("laptop").await;

        match events.recv().await.unwrap() {
            SessionEvent::ToolResult {
                call_id,
                outcome: ToolCallOutcome::Failed(err),
                ..
            } => {
                assert_eq!(call_id, "C1");
                assert_eq!(err.code, error_codes::NOT_CONNECTED);
            },
            other => panic!("unexpected {other:?}"),
        }
        assert!(state.inner.read().await.ledger.tools.is_empty());
    }

    #[tokio::test]
    async fn sweep_expires_old_calls_with_unavailable() {
        let state = GatewayState::new(ResolvedAuth::default(), Services::default());
        let mut rx = add(&state, "c1", ConnectionRole::Client { id: "ui".into() }).await;
        let start = Instant::now();
        state
            .inner
            .write()
            .await
            .ledger
            .tools
            .insert(client_call("C1", "c1", start));

        let report = state
            .sweep(start + Duration::from_secs(state.limits.pending_call_ttl_secs + 1))
            .await;
        assert_eq!(report.calls, 1);
        let frame = response(&mut rx);
        assert!(!frame.ok);
        assert_eq!(frame.error.unwrap().code, error_codes::UNAVAILABLE);
    }

    #[tokio::test]
    async fn events_carry_increasing_seq() {
        let state = GatewayState::new(ResolvedAuth::default(), Services::default());
        let mut rx = add(&state, "n1", ConnectionRole::Node {
            id: "laptop".into(),
            tools: vec![],
        })
        .await;
        assert!(state.send_event_to_node("laptop", "node.probe", Value::Null).await);
        assert!(state.send_event_to_node("laptop", "node.probe", Value::Null).await);
        assert!(!state.send_event_to_node("phone", "node.probe", Value::Null).await);

        let mut seqs = Vec::new();
        while let Ok(Outbound::Text(t)) = rx.try_recv() {
            let evt: EventFrame = serde_json::from_str(&t).unwrap();
            seqs.push(evt.seq.unwrap());
        }
        assert_eq!(seqs.len(), 2);
        assert!(seqs[0] < seqs[1]);
    }
}
