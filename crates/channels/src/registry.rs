use std::collections::HashMap;

use {serde::Serialize, tracing::info};

use crate::{Error, Result};

/// Build the registry key for a channel account.
pub fn channel_key(channel: &str, account_id: &str) -> String {
    format!("{channel}:{account_id}")
}

/// Split `channel:accountId`. The account part may itself contain colons.
pub fn parse_channel_key(key: &str) -> Result<(&str, &str)> {
    match key.split_once(':') {
        Some((channel, account)) if !channel.is_empty() && !account.is_empty() => {
            Ok((channel, account))
        },
        _ => Err(Error::invalid_input(format!(
            "expected channel:accountId, got {key:?}"
        ))),
    }
}

/// Status of one bridged account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRegistryEntry {
    pub channel: String,
    pub account_id: String,
    /// Epoch millis of the most recent bridge handshake.
    pub connected_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<u64>,
    pub connected: bool,
}

impl ChannelRegistryEntry {
    pub fn key(&self) -> String {
        channel_key(&self.channel, &self.account_id)
    }
}

#[derive(Debug, Default)]
pub struct ChannelRegistry {
    entries: HashMap<String, ChannelRegistryEntry>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a bridge handshake. An existing entry keeps its
    /// `last_message_at`.
    pub fn mark_connected(&mut self, channel: &str, account_id: &str, now_ms: u64) -> String {
        let key = channel_key(channel, account_id);
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| ChannelRegistryEntry {
                channel: channel.to_string(),
                account_id: account_id.to_string(),
                connected_at: now_ms,
                last_message_at: None,
                connected: true,
            });
        entry.connected_at = now_ms;
        entry.connected = true;
        info!(channel_key = %key, "channel connected");
        key
    }

    /// Returns `false` if the key was never registered.
    pub fn mark_disconnected(&mut self, key: &str) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.connected = false;
                info!(channel_key = %key, "channel disconnected");
                true
            },
            None => false,
        }
    }

    /// Stamp an inbound message.
    pub fn touch(&mut self, key: &str, now_ms: u64) -> Result<()> {
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| Error::unknown_account(key))?;
        entry.last_message_at = Some(now_ms);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&ChannelRegistryEntry> {
        self.entries.get(key)
    }

    pub fn is_connected(&self, key: &str) -> bool {
        self.entries.get(key).is_some_and(|e| e.connected)
    }

    /// All entries, ordered by key.
    pub fn list(&self) -> Vec<ChannelRegistryEntry> {
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            (a.channel.as_str(), a.account_id.as_str())
                .cmp(&(b.channel.as_str(), b.account_id.as_str()))
        });
        entries
    }

    pub fn connected_count(&self) -> usize {
        self.entries.values().filter(|e| e.connected).count()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trip_keeps_colons_in_account() {
        let key = channel_key("matrix", "@bot:example.org");
        assert_eq!(key, "matrix:@bot:example.org");
        assert_eq!(
            parse_channel_key(&key).unwrap(),
            ("matrix", "@bot:example.org")
        );
        assert!(parse_channel_key("nocolon").is_err());
        assert!(parse_channel_key(":x").is_err());
    }

    #[test]
    fn entry_survives_disconnect() {
        let mut reg = ChannelRegistry::new();
        let key = reg.mark_connected("telegram", "bot1", 100);
        reg.touch(&key, 150).unwrap();
        assert!(reg.mark_disconnected(&key));

        let entry = reg.get(&key).unwrap();
        assert!(!entry.connected);
        assert_eq!(entry.last_message_at, Some(150));
        assert_eq!(reg.connected_count(), 0);

        reg.mark_connected("telegram", "bot1", 200);
        let entry = reg.get(&key).unwrap();
        assert!(entry.connected);
        assert_eq!(entry.connected_at, 200);
        assert_eq!(entry.last_message_at, Some(150));
    }

    #[test]
    fn touch_unknown_is_an_error() {
        let mut reg = ChannelRegistry::new();
        assert!(matches!(
            reg.touch("slack:T1", 1),
            Err(Error::UnknownAccount { .. })
        ));
        assert!(!reg.mark_disconnected("slack:T1"));
    }

    #[test]
    fn list_is_sorted_and_camel_cased() {
        let mut reg = ChannelRegistry::new();
        reg.mark_connected("whatsapp", "a", 1);
        reg.mark_connected("discord", "b", 2);
        let list = reg.list();
        assert_eq!(list[0].channel, "discord");

        let json = serde_json::to_value(&list[0]).unwrap();
        assert_eq!(json["accountId"], "b");
        assert_eq!(json["connectedAt"], 2);
        assert!(json.get("lastMessageAt").is_none());
    }
}
