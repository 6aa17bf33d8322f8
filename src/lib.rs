//! # Voxroom - multi-room voice and text chat
//!
//! Voxroom is a real-time chat server: browsers connect over WebSocket, land in a named
//! room under a procedurally generated persona, and talk. Every chat line can be rendered
//! to speech and goes through a stack of stackable, expiring effects (autotune, stutter,
//! robot voice and friends) applied by objects, combat and timed world events.
//!
//! ## Features
//!
//! - **Anonymous personas**: a stable name, picture, color and voice derived from a cookie.
//! - **Effects pipeline**: text, phonemic, voice and audio stages, five effects per stage.
//! - **Objects and combat**: inventories, exchanges and a dice-based attack system.
//! - **Moderation**: flood detection, ban/shadowban/trash tiers, privileged roles.
//! - **World events**: room-wide effects on jittered schedules.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voxroom::chat::{firewall, render, transport::Listener, ChatServer};
//! use voxroom::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let renderer = render::from_config(&config.renderer);
//!     let firewall = firewall::from_config(&config.firewall);
//!     let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
//!     let transport = Listener::new(&config.server);
//!
//!     let (server, handle) = ChatServer::new(config, renderer, Arc::clone(&firewall))?;
//!     server.spawn();
//!     transport.serve(listener, handle).await
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`chat`] - actor runtime, transport, rooms, handlers, moderation
//! - [`effects`] - effect values, the effect catalogue and per-user queues
//! - [`objects`] - usable items and inventories
//! - [`events`] - the delayed-action queue and world events
//! - [`config`] - configuration management and validation
//! - [`validation`] - input sanitization utilities
//! - [`logutil`] / [`metrics`] - logging helpers and process-wide counters

pub mod chat;
pub mod config;
pub mod effects;
pub mod events;
pub mod logutil;
pub mod metrics;
pub mod objects;
pub mod validation;
