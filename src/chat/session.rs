//! One transport connection as the runtime sees it.

use std::fmt;
use std::net::IpAddr;

use tokio::time::Instant;

use super::identity::IdentityHash;
use super::protocol::{CloseCode, Outbound, SessionLink};
use super::roles::Roles;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub addr: IpAddr,
    pub identity: IdentityHash,
    /// Raw cookie, matched against the privilege allow-lists.
    pub token: String,
    pub roles: Roles,
    pub channel: String,
    pub user_id: String,
    pub connected_at: Instant,
    /// When the last audio clip admitted for this session should finish playing.
    pub audio_end: Instant,
    pub last_give: Option<Instant>,
    pub last_take: Option<Instant>,
    pub link: SessionLink,
}

impl Session {
    pub fn send(&self, msg: &Outbound) {
        self.link.send(msg);
    }

    pub fn close(&self, code: CloseCode, reason: impl Into<String>) {
        self.link.close(code, reason);
    }

    /// Whether the give/take stamp `last` allows another exchange now.
    pub fn exchange_ready(last: Option<Instant>, now: Instant, cooldown: std::time::Duration) -> bool {
        last.map_or(true, |t| now.saturating_duration_since(t) >= cooldown)
    }
}
