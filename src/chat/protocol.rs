//! Wire shapes exchanged with clients.
//!
//! Inbound messages are JSON objects routed by a discriminator field (see
//! [`super::routing`]); outbound messages are the [`Outbound`] enum, serialized with a
//! `type` tag. A text frame may be followed by one binary frame carrying rendered audio.

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

use super::persona::UserInfo;
use super::session::SessionId;

/// Milliseconds since the Unix epoch, as clients expect in `date` fields.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Stable close codes sent to clients when the server ends a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    Shutdown = 1000,
    Internal = 4000,
    MalformedInput = 4001,
    BinaryRejected = 4002,
    Banned = 4004,
    TooManyIdentities = 4005,
    Unauthorized = 4006,
    Kicked = 4007,
    ConnectTooSoon = 4008,
}

impl CloseCode {
    pub fn code(self) -> u16 {
        self as u16
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BacklogEntry {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub userid: String,
    pub msg: String,
    pub date: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ItemInfo {
    pub id: usize,
    pub name: String,
    pub icon: &'static str,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    InvalidTarget,
    InvalidObject,
    InventoryFull,
    TooSoon,
    Cooldown,
    Unauthorized,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModerationState {
    ApplyOk,
    RemoveOk,
    InvalidUser,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ModerationReply {
    pub userid: String,
    pub state: ModerationState,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AttackEvent {
    Attack {
        attacker_id: String,
        defender_id: String,
        date: i64,
    },
    Dice {
        attacker_id: String,
        defender_id: String,
        attacker_dice: u32,
        defender_dice: u32,
        attacker_bonus: u32,
        defender_bonus: u32,
        date: i64,
    },
    Effect {
        tag: &'static str,
        target_id: String,
        effect: String,
        timeout: u64,
        date: i64,
    },
    Nothing {
        date: i64,
    },
    Invalid {
        date: i64,
    },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AntifloodEvent {
    FloodWarning,
    Banned,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Userlist {
        users: Vec<UserInfo>,
    },
    Backlog {
        msgs: Vec<BacklogEntry>,
        date: i64,
    },
    Connect {
        #[serde(flatten)]
        user: UserInfo,
        date: i64,
    },
    Disconnect {
        userid: String,
        date: i64,
    },
    Msg {
        userid: String,
        msg: String,
        date: i64,
    },
    Me {
        userid: String,
        msg: String,
        date: i64,
    },
    Bot {
        userid: String,
        msg: String,
        date: i64,
    },
    PrivateMsg {
        userid: String,
        targetid: String,
        msg: String,
        date: i64,
    },
    /// Echo of a private message to its sender.
    PrivateMsgSent {
        targetid: String,
        msg: String,
        date: i64,
    },
    Attack(AttackEvent),
    Move {
        id: String,
        userid: String,
        x: f64,
        y: f64,
    },
    Notification {
        msg: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        event_type: Option<&'static str>,
        date: i64,
    },
    Antiflood {
        event: AntifloodEvent,
        userid: String,
        date: i64,
    },
    Wait {
        date: i64,
    },
    Inventory {
        items: Vec<ItemInfo>,
    },
    ChannelInventory {
        items: Vec<ItemInfo>,
    },
    Give {
        sender: String,
        receiver: String,
        obj_name: String,
        date: i64,
    },
    Ban(ModerationReply),
    Shadowban(ModerationReply),
    Trash(ModerationReply),
    UserInspect {
        userid: String,
        addresses: Vec<String>,
        channels: Vec<String>,
    },
    AudioBroadcast {
        userid: String,
        date: i64,
    },
    Error {
        request: &'static str,
        reason: ErrorReason,
    },
}

impl Outbound {
    pub fn notification(msg: impl Into<String>) -> Self {
        Outbound::Notification {
            msg: msg.into(),
            event_type: None,
            date: now_millis(),
        }
    }

    pub fn event_notification(event_type: &'static str, msg: impl Into<String>) -> Self {
        Outbound::Notification {
            msg: msg.into(),
            event_type: Some(event_type),
            date: now_millis(),
        }
    }

    pub fn error(request: &'static str, reason: ErrorReason) -> Self {
        Outbound::Error { request, reason }
    }

    pub fn to_json(&self) -> String {
        // serializing these plain structs cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// One frame queued for a connection's writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Close { code: CloseCode, reason: String },
}

/// The runtime's handle on one connection's outbound queue.
#[derive(Debug, Clone)]
pub struct SessionLink {
    pub id: SessionId,
    tx: mpsc::UnboundedSender<Frame>,
}

impl SessionLink {
    pub fn new(id: SessionId, tx: mpsc::UnboundedSender<Frame>) -> Self {
        Self { id, tx }
    }

    /// Queue a frame; a connection already gone is not an error.
    pub fn send_frame(&self, frame: Frame) {
        let _ = self.tx.send(frame);
    }

    pub fn send(&self, msg: &Outbound) {
        self.send_frame(Frame::Text(msg.to_json()));
    }

    pub fn send_binary(&self, payload: Bytes) {
        self.send_frame(Frame::Binary(payload));
    }

    pub fn close(&self, code: CloseCode, reason: impl Into<String>) {
        self.send_frame(Frame::Close {
            code,
            reason: reason.into(),
        });
    }
}
