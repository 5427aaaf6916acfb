//! Registry of external messaging-platform accounts bridged into the router.
//!
//! One entry per `channel:accountId`, kept across reconnects of the bridge
//! connection so status stays queryable while the bridge is away.

pub mod error;
pub mod registry;

pub use {
    error::{Error, Result},
    registry::{ChannelRegistry, ChannelRegistryEntry, channel_key, parse_channel_key},
};
