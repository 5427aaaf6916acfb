//! Pending-call ledger.
//!
//! Every deferred tool or log call is recorded under a fresh UUID call id
//! together with the node it was sent to and whoever waits for the answer.
//! Entries are removed exactly once: by the node's reply, by node loss, or
//! by expiry.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use switchyard_protocol::ErrorShape;

/// Who receives the outcome of a tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallWaiter {
    /// A client request answered under its original frame id.
    Client {
        client_id: String,
        conn_id: String,
        frame_id: String,
    },
    /// A session actor, notified through the session service.
    Session { session_key: String },
}

#[derive(Debug, Clone)]
pub struct PendingToolCall {
    pub call_id: String,
    pub node_id: String,
    pub tool: String,
    pub waiter: CallWaiter,
    pub created_at: Instant,
}

#[derive(Debug, Clone)]
pub struct PendingLogCall {
    pub call_id: String,
    pub node_id: String,
    pub client_id: String,
    pub conn_id: String,
    pub frame_id: String,
    pub created_at: Instant,
}

/// Common view of a ledger entry.
pub trait PendingEntry {
    fn call_id(&self) -> &str;
    fn node_id(&self) -> &str;
    fn created_at(&self) -> Instant;
}

impl PendingEntry for PendingToolCall {
    fn call_id(&self) -> &str {
        &self.call_id
    }

    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn created_at(&self) -> Instant {
        self.created_at
    }
}

impl PendingEntry for PendingLogCall {
    fn call_id(&self) -> &str {
        &self.call_id
    }

    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn created_at(&self) -> Instant {
        self.created_at
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("unknown callId: {call_id}")]
    UnknownCall { call_id: String },
    #[error("call {call_id} was not sent to node {sender}")]
    WrongNode { call_id: String, sender: String },
}

impl From<LedgerError> for ErrorShape {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::UnknownCall { .. } => Self::not_found(err.to_string()),
            LedgerError::WrongNode { .. } => Self::forbidden(err.to_string()),
        }
    }
}

/// Calls of one kind keyed by call id.
#[derive(Debug)]
pub struct Ledger<T> {
    entries: HashMap<String, T>,
}

impl<T> Default for Ledger<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T: PendingEntry> Ledger<T> {
    pub fn insert(&mut self, entry: T) {
        self.entries.insert(entry.call_id().to_string(), entry);
    }

    /// Remove the entry if `sender` is the node it was sent to. A mismatch
    /// leaves the entry in place.
    pub fn take(&mut self, call_id: &str, sender: &str) -> Result<T, LedgerError> {
        match self.entries.get(call_id) {
            None => Err(LedgerError::UnknownCall {
                call_id: call_id.to_string(),
            }),
            Some(entry) if entry.node_id() != sender => Err(LedgerError::WrongNode {
                call_id: call_id.to_string(),
                sender: sender.to_string(),
            }),
            Some(_) => self
                .entries
                .remove(call_id)
                .ok_or_else(|| LedgerError::UnknownCall {
                    call_id: call_id.to_string(),
                }),
        }
    }

    /// Remove without an origin check (send failure on the router side).
    pub fn remove(&mut self, call_id: &str) -> Option<T> {
        self.entries.remove(call_id)
    }

    pub fn drain_node(&mut self, node_id: &str) -> Vec<T> {
        self.drain_where(|e| e.node_id() == node_id)
    }

    pub fn drain_older_than(&mut self, ttl: Duration, now: Instant) -> Vec<T> {
        self.drain_where(|e| now.saturating_duration_since(e.created_at()) >= ttl)
    }

    fn drain_where(&mut self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| pred(e))
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.entries.remove(id))
            .collect()
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.entries.contains_key(call_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Correlates sub-process progress from a node back to the session call
/// that started it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRoute {
    pub session_key: String,
    pub call_id: String,
}

/// Everything removed when a node goes away or entries expire.
#[derive(Debug, Default)]
pub struct Drained {
    pub tools: Vec<PendingToolCall>,
    pub logs: Vec<PendingLogCall>,
}

impl Drained {
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.logs.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct CallLedger {
    pub tools: Ledger<PendingToolCall>,
    pub logs: Ledger<PendingLogCall>,
    /// (node id, process id) → originating session call
    execs: HashMap<(String, String), ExecRoute>,
}

impl CallLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_exec(&mut self, node_id: &str, process_id: &str, route: ExecRoute) {
        self.execs
            .insert((node_id.to_string(), process_id.to_string()), route);
    }

    pub fn exec_route(&self, node_id: &str, process_id: &str) -> Option<&ExecRoute> {
        self.execs
            .get(&(node_id.to_string(), process_id.to_string()))
    }

    pub fn remove_exec(&mut self, node_id: &str, process_id: &str) -> Option<ExecRoute> {
        self.execs
            .remove(&(node_id.to_string(), process_id.to_string()))
    }

    pub fn exec_count(&self) -> usize {
        self.execs.len()
    }

    /// Remove every call sent to `node_id` and forget its sub-processes.
    pub fn drain_node(&mut self, node_id: &str) -> Drained {
        self.execs.retain(|(node, _), _| node != node_id);
        Drained {
            tools: self.tools.drain_node(node_id),
            logs: self.logs.drain_node(node_id),
        }
    }

    pub fn drain_expired(&mut self, ttl: Duration, now: Instant) -> Drained {
        Drained {
            tools: self.tools.drain_older_than(ttl, now),
            logs: self.logs.drain_older_than(ttl, now),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn call(call_id: &str, node_id: &str) -> PendingToolCall {
        PendingToolCall {
            call_id: call_id.into(),
            node_id: node_id.into(),
            tool: "Read".into(),
            waiter: CallWaiter::Session {
                session_key: "s".into(),
            },
            created_at: Instant::now(),
        }
    }

    #[test]
    fn take_is_at_most_once() {
        let mut ledger = CallLedger::new();
        ledger.tools.insert(call("C1", "laptop"));
        assert_eq!(ledger.tools.take("C1", "laptop").unwrap().call_id, "C1");
        assert_eq!(
            ledger.tools.take("C1", "laptop").unwrap_err(),
            LedgerError::UnknownCall {
                call_id: "C1".into()
            }
        );
    }

    #[test]
    fn wrong_sender_leaves_entry_in_place() {
        let mut ledger = CallLedger::new();
        ledger.tools.insert(call("C1", "laptop"));
        let err = ledger.tools.take("C1", "phone").unwrap_err();
        assert!(matches!(err, LedgerError::WrongNode { .. }));
        assert_eq!(
            ErrorShape::from(err).code,
            switchyard_protocol::error_codes::FORBIDDEN
        );
        assert!(ledger.tools.contains("C1"));
    }

    #[test]
    fn drain_node_removes_calls_and_exec_routes() {
        let mut ledger = CallLedger::new();
        ledger.tools.insert(call("C1", "laptop"));
        ledger.tools.insert(call("C2", "phone"));
        ledger.logs.insert(PendingLogCall {
            call_id: "L1".into(),
            node_id: "laptop".into(),
            client_id: "ui".into(),
            conn_id: "conn".into(),
            frame_id: "7".into(),
            created_at: Instant::now(),
        });
        ledger.record_exec("laptop", "p1", ExecRoute {
            session_key: "s".into(),
            call_id: "C0".into(),
        });

        let drained = ledger.drain_node("laptop");
        assert_eq!(drained.tools.len(), 1);
        assert_eq!(drained.logs.len(), 1);
        assert_eq!(ledger.tools.len(), 1);
        assert!(ledger.exec_route("laptop", "p1").is_none());
    }

    #[test]
    fn expiry_uses_age() {
        let mut ledger = CallLedger::new();
        let start = Instant::now();
        ledger.tools.insert(call("old", "n"));
        let mut fresh = call("fresh", "n");
        fresh.created_at = start + Duration::from_secs(90);
        ledger.tools.insert(fresh);

        let now = start + Duration::from_secs(120);
        let drained = ledger.drain_expired(Duration::from_secs(60), now);
        assert_eq!(drained.tools.len(), 1);
        assert_eq!(drained.tools[0].call_id, "old");
        assert!(ledger.tools.contains("fresh"));
    }
}
