//! Gateway: the WebSocket router between clients, nodes and channel bridges.
//!
//! Lifecycle:
//! 1. Load + validate config
//! 2. Resolve auth, open the object store and attachment database
//! 3. Start HTTP server (`/health`, `/ws`) and the expiry sweeper
//! 4. Per connection: handshake → method dispatch → cleanup
//!
//! Method handlers live in `methods/`; everything they share sits in
//! [`state::GatewayState`].

pub mod attachments;
pub mod auth;
pub mod broadcast;
pub mod connections;
pub mod methods;
pub mod outbound;
pub mod pending;
pub mod server;
pub mod state;
pub mod tools;
pub mod transfer;
pub mod ws;
