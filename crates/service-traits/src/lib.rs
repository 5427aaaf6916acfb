//! Interfaces of the collaborators the router talks to but does not own.
//!
//! The session actor runs model turns and owns conversation history; the
//! scheduler runs timed jobs. The router only pushes completions into them
//! and starts the scheduler once. Each trait has a `Noop` implementation so
//! the router can run standalone.

use std::sync::Arc;

use {
    async_trait::async_trait,
    serde_json::Value,
    tokio::sync::mpsc,
    tracing::{debug, warn},
};

use switchyard_protocol::ErrorShape;

/// Error type returned by service methods.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{message}")]
    Message { message: String },
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
}

impl ServiceError {
    #[must_use]
    pub fn message(message: impl std::fmt::Display) -> Self {
        Self::Message {
            message: message.to_string(),
        }
    }
}

impl From<String> for ServiceError {
    fn from(value: String) -> Self {
        Self::message(value)
    }
}

impl From<&str> for ServiceError {
    fn from(value: &str) -> Self {
        Self::message(value)
    }
}

impl From<ServiceError> for ErrorShape {
    fn from(err: ServiceError) -> Self {
        Self::internal(err.to_string())
    }
}

pub type ServiceResult<T = Value> = Result<T, ServiceError>;

// ── Session actor ───────────────────────────────────────────────────────────

/// Final outcome of a tool call issued on behalf of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallOutcome {
    Completed(Value),
    Failed(ErrorShape),
}

/// Completions the router pushes into the per-conversation session actor.
#[async_trait]
pub trait SessionService: Send + Sync {
    /// A tool call requested through `tool.request` finished.
    async fn tool_result(
        &self,
        session_key: &str,
        call_id: &str,
        outcome: ToolCallOutcome,
    ) -> ServiceResult<()>;

    /// Progress from a sub-process started by an earlier tool call.
    async fn exec_event(
        &self,
        session_key: &str,
        call_id: &str,
        node_id: &str,
        payload: Value,
    ) -> ServiceResult<()>;

    /// An inbound message from a channel bridge.
    async fn channel_inbound(&self, channel_key: &str, payload: Value) -> ServiceResult<()>;
}

pub struct NoopSessionService;

#[async_trait]
impl SessionService for NoopSessionService {
    async fn tool_result(
        &self,
        session_key: &str,
        call_id: &str,
        _outcome: ToolCallOutcome,
    ) -> ServiceResult<()> {
        debug!(session_key, call_id, "no session service; tool result discarded");
        Ok(())
    }

    async fn exec_event(
        &self,
        session_key: &str,
        call_id: &str,
        _node_id: &str,
        _payload: Value,
    ) -> ServiceResult<()> {
        debug!(session_key, call_id, "no session service; exec event discarded");
        Ok(())
    }

    async fn channel_inbound(&self, channel_key: &str, _payload: Value) -> ServiceResult<()> {
        Err(format!("no session service for inbound message on {channel_key}").into())
    }
}

/// Everything a [`ChannelSessionService`] forwards, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ToolResult {
        session_key: String,
        call_id: String,
        outcome: ToolCallOutcome,
    },
    ExecEvent {
        session_key: String,
        call_id: String,
        node_id: String,
        payload: Value,
    },
    ChannelInbound {
        channel_key: String,
        payload: Value,
    },
}

/// Session service that forwards every completion into an mpsc channel.
///
/// Lets an in-process session actor await results on its own receiver.
pub struct ChannelSessionService {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelSessionService {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: SessionEvent) -> ServiceResult<()> {
        self.tx
            .send(event)
            .map_err(|_| ServiceError::message("session receiver dropped"))
    }
}

#[async_trait]
impl SessionService for ChannelSessionService {
    async fn tool_result(
        &self,
        session_key: &str,
        call_id: &str,
        outcome: ToolCallOutcome,
    ) -> ServiceResult<()> {
        self.forward(SessionEvent::ToolResult {
            session_key: session_key.to_string(),
            call_id: call_id.to_string(),
            outcome,
        })
    }

    async fn exec_event(
        &self,
        session_key: &str,
        call_id: &str,
        node_id: &str,
        payload: Value,
    ) -> ServiceResult<()> {
        self.forward(SessionEvent::ExecEvent {
            session_key: session_key.to_string(),
            call_id: call_id.to_string(),
            node_id: node_id.to_string(),
            payload,
        })
    }

    async fn channel_inbound(&self, channel_key: &str, payload: Value) -> ServiceResult<()> {
        self.forward(SessionEvent::ChannelInbound {
            channel_key: channel_key.to_string(),
            payload,
        })
    }
}

// ── Scheduler ───────────────────────────────────────────────────────────────

/// Background job scheduler, started lazily on the first handshake.
#[async_trait]
pub trait SchedulerService: Send + Sync {
    async fn start(&self) -> ServiceResult<()>;
}

pub struct NoopSchedulerService;

#[async_trait]
impl SchedulerService for NoopSchedulerService {
    async fn start(&self) -> ServiceResult<()> {
        debug!("no scheduler configured");
        Ok(())
    }
}

// ── Services bundle ─────────────────────────────────────────────────────────

/// Bundle of collaborator trait objects held by the router state.
#[derive(Clone)]
pub struct Services {
    pub session: Arc<dyn SessionService>,
    pub scheduler: Arc<dyn SchedulerService>,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            session: Arc::new(NoopSessionService),
            scheduler: Arc::new(NoopSchedulerService),
        }
    }
}

impl Services {
    pub fn with_session(mut self, session: Arc<dyn SessionService>) -> Self {
        self.session = session;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn SchedulerService>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Start the scheduler, logging instead of propagating failures.
    pub async fn start_scheduler(&self) {
        if let Err(e) = self.scheduler.start().await {
            warn!(error = %e, "failed to start scheduler");
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_service_forwards_in_order() {
        let (svc, mut rx) = ChannelSessionService::new();
        svc.tool_result("s1", "c1", ToolCallOutcome::Completed(serde_json::json!(1)))
            .await
            .unwrap();
        svc.exec_event("s1", "c1", "laptop", serde_json::json!({"line": "x"}))
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::ToolResult { ref call_id, .. } if call_id == "c1"
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::ExecEvent { ref node_id, .. } if node_id == "laptop"
        ));
    }

    #[tokio::test]
    async fn channel_service_errors_once_receiver_is_gone() {
        let (svc, rx) = ChannelSessionService::new();
        drop(rx);
        let err = svc
            .channel_inbound("telegram:bot", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "session receiver dropped");
    }

    #[test]
    fn service_error_maps_to_internal_code() {
        let shape: ErrorShape = ServiceError::message("boom").into();
        assert_eq!(shape.code, switchyard_protocol::error_codes::INTERNAL);
        assert_eq!(shape.message, "boom");
    }

    #[tokio::test]
    async fn noop_session_rejects_channel_messages() {
        let res = NoopSessionService
            .channel_inbound("slack:T1", serde_json::json!({}))
            .await;
        assert!(res.is_err());
    }
}
