use std::{collections::HashMap, time::Instant};

use {serde_json::Value, tokio::sync::mpsc};

use switchyard_protocol::{Mode, ToolDefinition};

use crate::outbound::{Backlog, Outbound};

/// Role-specific metadata fixed at handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionRole {
    Client {
        id: String,
    },
    Node {
        id: String,
        tools: Vec<ToolDefinition>,
    },
    Channel {
        key: String,
        channel: String,
        account_id: String,
    },
}

impl ConnectionRole {
    pub fn mode(&self) -> Mode {
        match self {
            Self::Client { .. } => Mode::Client,
            Self::Node { .. } => Mode::Node,
            Self::Channel { .. } => Mode::Channel,
        }
    }

    /// Client id, node id, or `channel:accountId`.
    pub fn logical_id(&self) -> &str {
        match self {
            Self::Client { id } | Self::Node { id, .. } => id,
            Self::Channel { key, .. } => key,
        }
    }
}

/// An open, handshaken socket.
#[derive(Debug)]
pub struct Connection {
    pub conn_id: String,
    pub role: ConnectionRole,
    /// Channel feeding this connection's write loop.
    pub sender: mpsc::UnboundedSender<Outbound>,
    /// Binary bytes not yet written; shared with the write loop.
    pub backlog: Backlog,
    pub display_name: Option<String>,
    pub platform: Option<String>,
    pub version: Option<String>,
    pub remote_ip: Option<String>,
    pub connected_at: Instant,
    pub last_activity: Instant,
    /// Latest `node.probe.result` payload (nodes only).
    pub probe: Option<Value>,
}

impl Connection {
    pub fn new(
        conn_id: impl Into<String>,
        role: ConnectionRole,
        sender: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        let now = Instant::now();
        Self {
            conn_id: conn_id.into(),
            role,
            sender,
            backlog: Backlog::new(),
            display_name: None,
            platform: None,
            version: None,
            remote_ip: None,
            connected_at: now,
            last_activity: now,
            probe: None,
        }
    }

    pub fn send(&self, frame: Outbound) -> bool {
        self.sender.send(frame).is_ok()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Connection counts by role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RoleCounts {
    pub clients: usize,
    pub nodes: usize,
    pub channels: usize,
}

/// Every open connection plus one index per role from logical id to the
/// connection currently holding it.
#[derive(Default)]
pub struct ConnectionRegistry {
    /// conn_id → Connection
    conns: HashMap<String, Connection>,
    /// client id → conn_id
    clients: HashMap<String, String>,
    /// node id → conn_id
    nodes: HashMap<String, String>,
    /// channel key → conn_id
    channels: HashMap<String, String>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn index_mut(&mut self, mode: Mode) -> &mut HashMap<String, String> {
        match mode {
            Mode::Client => &mut self.clients,
            Mode::Node => &mut self.nodes,
            Mode::Channel => &mut self.channels,
        }
    }

    /// Add a connection. If another connection already holds the same logical
    /// id it is removed and returned so the caller can close it.
    pub fn register(&mut self, conn: Connection) -> Option<Connection> {
        let conn_id = conn.conn_id.clone();
        let logical_id = conn.role.logical_id().to_string();
        let previous = self
            .index_mut(conn.role.mode())
            .insert(logical_id, conn_id.clone());
        self.conns.insert(conn_id.clone(), conn);
        previous
            .filter(|old| *old != conn_id)
            .and_then(|old| self.conns.remove(&old))
    }

    /// Remove a connection. The logical-id index is only cleared if it still
    /// points at this connection, so closing a replaced socket never evicts
    /// its successor.
    pub fn unregister(&mut self, conn_id: &str) -> Option<Connection> {
        let conn = self.conns.remove(conn_id)?;
        let index = self.index_mut(conn.role.mode());
        if index.get(conn.role.logical_id()).map(String::as_str) == Some(conn_id) {
            index.remove(conn.role.logical_id());
        }
        Some(conn)
    }

    pub fn contains(&self, conn_id: &str) -> bool {
        self.conns.contains_key(conn_id)
    }

    pub fn get(&self, conn_id: &str) -> Option<&Connection> {
        self.conns.get(conn_id)
    }

    pub fn get_mut(&mut self, conn_id: &str) -> Option<&mut Connection> {
        self.conns.get_mut(conn_id)
    }

    pub fn client(&self, client_id: &str) -> Option<&Connection> {
        self.clients.get(client_id).and_then(|c| self.conns.get(c))
    }

    pub fn node(&self, node_id: &str) -> Option<&Connection> {
        self.nodes.get(node_id).and_then(|c| self.conns.get(c))
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut Connection> {
        let conn_id = self.nodes.get(node_id)?;
        self.conns.get_mut(conn_id)
    }

    pub fn channel(&self, key: &str) -> Option<&Connection> {
        self.channels.get(key).and_then(|c| self.conns.get(c))
    }

    pub fn is_node_connected(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Connected node ids, sorted.
    pub fn node_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Connected nodes, sorted by node id.
    pub fn nodes(&self) -> Vec<&Connection> {
        self.node_ids()
            .into_iter()
            .filter_map(|id| self.node(id))
            .collect()
    }

    pub fn clients(&self) -> impl Iterator<Item = &Connection> {
        self.clients.values().filter_map(|c| self.conns.get(c))
    }

    pub fn counts(&self) -> RoleCounts {
        RoleCounts {
            clients: self.clients.len(),
            nodes: self.nodes.len(),
            channels: self.channels.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn conn(
        conn_id: &str,
        role: ConnectionRole,
    ) -> (Connection, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Connection::new(conn_id, role, tx), rx)
    }

    fn node(id: &str) -> ConnectionRole {
        ConnectionRole::Node {
            id: id.into(),
            tools: vec![],
        }
    }

    #[test]
    fn lookup_by_role_index() {
        let mut reg = ConnectionRegistry::new();
        let (c, _rx1) = conn("c1", ConnectionRole::Client { id: "ui".into() });
        let (n, _rx2) = conn("c2", node("laptop"));
        let (ch, _rx3) = conn("c3", ConnectionRole::Channel {
            key: "telegram:bot".into(),
            channel: "telegram".into(),
            account_id: "bot".into(),
        });
        assert!(reg.register(c).is_none());
        assert!(reg.register(n).is_none());
        assert!(reg.register(ch).is_none());

        assert_eq!(reg.client("ui").unwrap().conn_id, "c1");
        assert_eq!(reg.node("laptop").unwrap().conn_id, "c2");
        assert_eq!(reg.channel("telegram:bot").unwrap().conn_id, "c3");
        assert_eq!(reg.counts(), RoleCounts {
            clients: 1,
            nodes: 1,
            channels: 1
        });
    }

    #[test]
    fn duplicate_logical_id_replaces_previous() {
        let mut reg = ConnectionRegistry::new();
        let (old, _rx1) = conn("old", node("laptop"));
        let (new, _rx2) = conn("new", node("laptop"));
        reg.register(old);

        let replaced = reg.register(new).unwrap();
        assert_eq!(replaced.conn_id, "old");
        assert_eq!(reg.node("laptop").unwrap().conn_id, "new");
        assert_eq!(reg.len(), 1);

        // The replaced socket's own cleanup finds nothing to remove.
        assert!(reg.unregister("old").is_none());
        assert_eq!(reg.node("laptop").unwrap().conn_id, "new");
    }

    #[test]
    fn unregister_clears_index() {
        let mut reg = ConnectionRegistry::new();
        let (n, _rx) = conn("c1", node("a"));
        reg.register(n);
        let removed = reg.unregister("c1").unwrap();
        assert_eq!(removed.role.logical_id(), "a");
        assert!(!reg.is_node_connected("a"));
        assert!(reg.is_empty());
    }

    #[test]
    fn node_ids_are_sorted() {
        let mut reg = ConnectionRegistry::new();
        let mut rxs = Vec::new();
        for (cid, nid) in [("1", "zeta"), ("2", "alpha"), ("3", "mid")] {
            let (n, rx) = conn(cid, node(nid));
            rxs.push(rx);
            reg.register(n);
        }
        assert_eq!(reg.node_ids(), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn send_reports_closed_receiver() {
        let (c, rx) = conn("c1", ConnectionRole::Client { id: "x".into() });
        assert!(c.send(Outbound::Text("hi".into())));
        drop(rx);
        assert!(!c.send(Outbound::Text("hi".into())));
    }
}
