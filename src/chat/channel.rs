//! A named room: its sessions, its ordered user directory, its backlog and its
//! floor inventory.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;

use bytes::Bytes;

use super::identity::IdentityHash;
use super::persona::UserInfo;
use super::protocol::{now_millis, BacklogEntry, CloseCode, Frame, Outbound, SessionLink};
use super::session::SessionId;
use super::user::User;
use crate::objects::{Inventory, Object};

/// A forced close requested while the runtime did not hold the session table.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingClose {
    pub session: SessionId,
    pub code: CloseCode,
    pub reason: String,
}

#[derive(Debug)]
pub struct Channel {
    name: String,
    /// Join order.
    users: Vec<User>,
    links: HashMap<SessionId, SessionLink>,
    /// Live sessions per address and identity.
    addresses: HashMap<IpAddr, HashMap<IdentityHash, usize>>,
    backlog: VecDeque<BacklogEntry>,
    backlog_size: usize,
    pub inventory: Inventory,
    pending_closes: Vec<PendingClose>,
}

impl Channel {
    pub fn new(name: impl Into<String>, backlog_size: usize, starter: Vec<Object>) -> Self {
        let mut inventory = Inventory::new();
        for object in starter {
            let _ = inventory.add(object);
        }
        Self {
            name: name.into(),
            users: Vec::new(),
            links: HashMap::new(),
            addresses: HashMap::new(),
            backlog: VecDeque::new(),
            backlog_size: backlog_size.max(1),
            inventory,
            pending_closes: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session_count(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn user(&self, id: &str) -> Option<&User> {
        self.users.iter().find(|u| u.id == id)
    }

    pub fn user_mut(&mut self, id: &str) -> Option<&mut User> {
        self.users.iter_mut().find(|u| u.id == id)
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.iter()
    }

    pub fn users_mut(&mut self) -> impl Iterator<Item = &mut User> {
        self.users.iter_mut()
    }

    pub fn user_ids(&self) -> Vec<String> {
        self.users.iter().map(|u| u.id.clone()).collect()
    }

    /// The `nth` (0-based) user whose creature name is `name`, case-insensitively, in
    /// join order.
    pub fn user_by_name(&self, name: &str, nth: usize) -> Option<&User> {
        let name = name.to_lowercase();
        self.users
            .iter()
            .filter(|u| u.persona.name.to_lowercase() == name)
            .nth(nth)
    }

    /// Number of places between two users in the directory.
    pub fn directory_distance(&self, a: &str, b: &str) -> Option<usize> {
        let pa = self.users.iter().position(|u| u.id == a)?;
        let pb = self.users.iter().position(|u| u.id == b)?;
        Some(pa.abs_diff(pb))
    }

    /// Whether `identity` may hold one more session from `addr` without exceeding
    /// `max` distinct identities for that address.
    pub fn identity_allowed(&self, addr: IpAddr, identity: &IdentityHash, max: usize) -> bool {
        match self.addresses.get(&addr) {
            Some(ids) => ids.contains_key(identity) || ids.len() < max,
            None => max > 0,
        }
    }

    pub fn distinct_identities(&self, addr: IpAddr) -> usize {
        self.addresses.get(&addr).map_or(0, HashMap::len)
    }

    /// Register a session, creating its user with `make_user` when the identity is not
    /// in the room yet. Returns true when the user is new.
    pub fn join(
        &mut self,
        link: SessionLink,
        addr: IpAddr,
        identity: IdentityHash,
        make_user: impl FnOnce() -> User,
    ) -> bool {
        let session = link.id;
        self.links.insert(session, link);
        *self.addresses.entry(addr).or_default().entry(identity).or_insert(0) += 1;

        let user_id = identity.user_id();
        if let Some(user) = self.user_mut(&user_id) {
            user.sessions.push(session);
            return false;
        }
        let mut user = make_user();
        user.sessions.push(session);
        self.users.push(user);
        true
    }

    /// Deregister a session. When it was the user's last one, the user leaves the
    /// directory and is returned.
    pub fn leave(&mut self, session: SessionId, addr: IpAddr, identity: &IdentityHash) -> Option<User> {
        if self.links.remove(&session).is_none() {
            return None;
        }
        if let Some(ids) = self.addresses.get_mut(&addr) {
            if let Some(count) = ids.get_mut(identity) {
                *count -= 1;
                if *count == 0 {
                    ids.remove(identity);
                }
            }
            if ids.is_empty() {
                self.addresses.remove(&addr);
            }
        }
        let pos = self.users.iter().position(|u| u.sessions.contains(&session))?;
        let user = &mut self.users[pos];
        user.sessions.retain(|s| *s != session);
        if user.sessions.is_empty() {
            Some(self.users.remove(pos))
        } else {
            None
        }
    }

    pub fn sessions_of(&self, user_id: &str) -> Vec<SessionId> {
        self.user(user_id).map(|u| u.sessions.clone()).unwrap_or_default()
    }

    pub fn broadcast(&self, msg: &Outbound) {
        let text = msg.to_json();
        for link in self.links.values() {
            link.send_frame(Frame::Text(text.clone()));
        }
    }

    /// Broadcast a text frame followed, when present, by its audio.
    pub fn broadcast_with_audio(&self, msg: &Outbound, audio: Option<&Bytes>) {
        let text = msg.to_json();
        for link in self.links.values() {
            link.send_frame(Frame::Text(text.clone()));
            if let Some(audio) = audio {
                link.send_binary(audio.clone());
            }
        }
    }

    pub fn broadcast_except(&self, except: &str, msg: &Outbound) {
        let skip: HashSet<SessionId> = self.sessions_of(except).into_iter().collect();
        let text = msg.to_json();
        for (id, link) in &self.links {
            if !skip.contains(id) {
                link.send_frame(Frame::Text(text.clone()));
            }
        }
    }

    pub fn send_to(&self, session: SessionId, msg: &Outbound) {
        if let Some(link) = self.links.get(&session) {
            link.send(msg);
        }
    }

    pub fn send_binary_to(&self, session: SessionId, payload: &Bytes) {
        if let Some(link) = self.links.get(&session) {
            link.send_binary(payload.clone());
        }
    }

    /// Send to every session of a user.
    pub fn send_to_user(&self, user_id: &str, msg: &Outbound) {
        for session in self.sessions_of(user_id) {
            self.send_to(session, msg);
        }
    }

    /// Queue a forced close of every session of a user; the runtime carries it out
    /// once the current event is handled.
    pub fn kick_user(&mut self, user_id: &str, code: CloseCode, reason: &str) {
        for session in self.sessions_of(user_id) {
            self.pending_closes.push(PendingClose {
                session,
                code,
                reason: reason.to_string(),
            });
        }
    }

    pub fn take_pending_closes(&mut self) -> Vec<PendingClose> {
        std::mem::take(&mut self.pending_closes)
    }

    /// Directory as seen by `viewer`.
    pub fn userlist(&self, viewer: &str) -> Vec<UserInfo> {
        self.users.iter().map(|u| u.info(u.id == viewer)).collect()
    }

    pub fn push_backlog(&mut self, kind: &'static str, userid: &str, msg: &str) {
        if self.backlog.len() == self.backlog_size {
            self.backlog.pop_front();
        }
        self.backlog.push_back(BacklogEntry {
            kind,
            userid: userid.to_string(),
            msg: msg.to_string(),
            date: now_millis(),
        });
    }

    pub fn backlog(&self) -> Vec<BacklogEntry> {
        self.backlog.iter().cloned().collect()
    }
}
