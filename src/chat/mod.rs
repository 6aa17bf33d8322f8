//! # Chat core
//!
//! Rooms, users, sessions and everything that happens between a WebSocket frame
//! arriving and the room hearing about it.
//!
//! ## Components
//!
//! - [`server`] - the actor owning all state, and its [`server::ServerHandle`]
//! - [`transport`] - WebSocket listener bridging connections to the actor
//! - [`state`] - rooms, sessions, bans and identities as one owned value
//! - [`routing`] / [`handlers`] - message dispatch and the command handlers
//! - [`channel`] / [`user`] / [`session`] - the room directory
//! - [`flood`] / [`ban`] / [`roles`] - moderation and privileges
//! - [`render`] / [`backpressure`] / [`firewall`] - slow collaborators
//!
//! ## Flow
//!
//! ```text
//! ┌─────────────────┐
//! │   Transport     │ ← handshake, cookie, reader/writer tasks
//! └─────────────────┘
//!          │ ServerEvent
//! ┌─────────────────┐
//! │   ChatServer    │ ← single task, routes and handles in order
//! └─────────────────┘
//!          │ Deferred
//! ┌─────────────────┐
//! │ Renderer /      │ ← spawned, results come back as events
//! │ Firewall        │
//! └─────────────────┘
//! ```

pub mod backpressure;
pub mod ban;
pub mod channel;
pub mod combat;
pub mod firewall;
pub mod flood;
pub mod handlers;
pub mod identity;
pub mod persona;
pub mod protocol;
pub mod render;
pub mod roles;
pub mod routing;
pub mod server;
pub mod session;
pub mod state;
pub mod transport;
pub mod user;

pub use server::{ChatServer, ServerHandle};
