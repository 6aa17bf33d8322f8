//! Identity derivation and the recent-connections backlog.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;

/// Connections remembered for moderator inspection.
pub const BACKLOG_CAPACITY: usize = 1000;

/// Non-reversible, stable digest of a client's cookie.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityHash([u8; 32]);

impl IdentityHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Public id of the user: the last 16 hex digits of the hash.
    pub fn user_id(&self) -> String {
        self.0[24..].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityHash({})", self.user_id())
    }
}

#[derive(Debug, Clone)]
pub struct IdentityResolver {
    secret: String,
}

impl IdentityResolver {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn resolve(&self, token: &str) -> IdentityHash {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hasher.update(self.secret.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        IdentityHash(bytes)
    }

    /// Cookie value handed to a browser that arrives without one.
    pub fn fresh_token() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub identity: IdentityHash,
    pub addr: IpAddr,
    pub channel: String,
    pub at: Instant,
}

/// Bounded log of recent connections plus the last login instant of every address.
#[derive(Debug, Default)]
pub struct IdentityBacklog {
    records: VecDeque<ConnectionRecord>,
    last_login: HashMap<IpAddr, Instant>,
}

impl IdentityBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `addr` may connect again, given the minimum interval.
    pub fn interval_ok(&self, addr: IpAddr, now: Instant, min_interval: Duration) -> bool {
        match self.last_login.get(&addr) {
            Some(last) => now.saturating_duration_since(*last) >= min_interval,
            None => true,
        }
    }

    pub fn touch(&mut self, addr: IpAddr, now: Instant) {
        self.last_login.insert(addr, now);
    }

    pub fn record(&mut self, identity: IdentityHash, addr: IpAddr, channel: &str, now: Instant) {
        if self.records.len() == BACKLOG_CAPACITY {
            self.records.pop_front();
        }
        self.records.push_back(ConnectionRecord {
            identity,
            addr,
            channel: channel.to_string(),
            at: now,
        });
    }

    /// Distinct addresses seen for an identity, oldest first.
    pub fn addresses_of(&self, identity: &IdentityHash) -> Vec<IpAddr> {
        let mut out = Vec::new();
        for rec in self.records.iter().filter(|r| r.identity == *identity) {
            if !out.contains(&rec.addr) {
                out.push(rec.addr);
            }
        }
        out
    }

    pub fn channels_of(&self, identity: &IdentityHash) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for rec in self.records.iter().filter(|r| r.identity == *identity) {
            if !out.contains(&rec.channel) {
                out.push(rec.channel.clone());
            }
        }
        out
    }

    /// Most recent identity whose public id is `user_id`.
    pub fn find_by_user_id(&self, user_id: &str) -> Option<IdentityHash> {
        self.records
            .iter()
            .rev()
            .find(|r| r.identity.user_id() == user_id)
            .map(|r| r.identity)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Addresses with a remembered login instant.
    pub fn login_count(&self) -> usize {
        self.last_login.len()
    }

    /// Forget login instants older than `horizon`.
    pub fn prune_logins(&mut self, now: Instant, horizon: Duration) {
        self.last_login
            .retain(|_, at| now.saturating_duration_since(*at) < horizon);
    }
}
