//! Inbound message dispatch.
//!
//! A client message is a JSON object. Its `type` field selects a handler; messages
//! without one are moderation commands selected by their `mod` field.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tokio::time::Instant;

use super::handlers::{self, Caller, HandlerError};
use super::protocol::CloseCode;
use super::state::ServerState;

pub type Payload = Map<String, Value>;

pub type HandlerFn = fn(&mut ServerState, &Caller, &Payload, Instant) -> Result<(), HandlerError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed JSON: {0}")]
    Malformed(String),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("missing or invalid field '{0}'")]
    MissingField(&'static str),
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("binary frames are not accepted")]
    BinaryRejected,
}

impl ProtocolError {
    /// Close code and reason for errors that end the connection. Unknown commands
    /// are dropped and leave the session open.
    pub fn close(&self) -> Option<(CloseCode, &'static str)> {
        match self {
            ProtocolError::Malformed(_) | ProtocolError::NotAnObject | ProtocolError::MissingField(_) => {
                Some((CloseCode::MalformedInput, "Malformed message."))
            }
            ProtocolError::UnknownCommand(_) => None,
            ProtocolError::BinaryRejected => Some((CloseCode::BinaryRejected, "Binary data is not accepted.")),
        }
    }
}

#[derive(Clone, Default)]
pub struct RoutingTable {
    by_type: HashMap<&'static str, HandlerFn>,
    by_mod: HashMap<&'static str, HandlerFn>,
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.by_type.keys().collect();
        let mut mods: Vec<_> = self.by_mod.keys().collect();
        types.sort();
        mods.sort();
        f.debug_struct("RoutingTable")
            .field("by_type", &types)
            .field("by_mod", &mods)
            .finish()
    }
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command the server understands.
    pub fn standard() -> Self {
        let mut table = Self::new();
        table
            .on_type("msg", handlers::msg)
            .on_type("me", handlers::me)
            .on_type("bot", handlers::bot)
            .on_type("private_msg", handlers::private_msg)
            .on_type("attack", handlers::attack)
            .on_type("move", handlers::movement)
            .on_type("inventory", handlers::inventory)
            .on_type("channel_inventory", handlers::channel_inventory)
            .on_type("obj_give", handlers::obj_give)
            .on_type("obj_use", handlers::obj_use)
            .on_type("obj_trash", handlers::obj_trash)
            .on_type("obj_take", handlers::obj_take)
            .on_mod("ban", handlers::moderate)
            .on_mod("shadowban", handlers::moderate)
            .on_mod("trash", handlers::moderate)
            .on_mod("inspect", handlers::inspect)
            .on_mod("weapons_grant", handlers::weapons_grant)
            .on_mod("qurk_master", handlers::qurk_master)
            .on_mod("pub_brawl", handlers::pub_brawl);
        table
    }

    pub fn on_type(&mut self, name: &'static str, handler: HandlerFn) -> &mut Self {
        self.by_type.insert(name, handler);
        self
    }

    pub fn on_mod(&mut self, name: &'static str, handler: HandlerFn) -> &mut Self {
        self.by_mod.insert(name, handler);
        self
    }

    /// Parse a text frame and pick its handler.
    pub fn route(&self, raw: &str) -> Result<(HandlerFn, Payload), ProtocolError> {
        let value: Value = serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let Value::Object(payload) = value else {
            return Err(ProtocolError::NotAnObject);
        };
        let handler = if let Some(kind) = payload.get("type") {
            let kind = kind.as_str().ok_or(ProtocolError::MissingField("type"))?;
            self.by_type
                .get(kind)
                .ok_or_else(|| ProtocolError::UnknownCommand(kind.to_string()))?
        } else if let Some(command) = payload.get("mod") {
            let command = command.as_str().ok_or(ProtocolError::MissingField("mod"))?;
            self.by_mod
                .get(command)
                .ok_or_else(|| ProtocolError::UnknownCommand(command.to_string()))?
        } else {
            return Err(ProtocolError::MissingField("type"));
        };
        Ok((*handler, payload))
    }
}
