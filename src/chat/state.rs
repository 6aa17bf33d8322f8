//! The runtime's owned state: rooms, sessions, bans, identities and timers.
//!
//! Everything here is synchronous. Work that has to wait on a collaborator (speech
//! rendering, firewall commands) is queued as [`Deferred`] and picked up by the actor
//! after the current event.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use log::{debug, info};
use tokio::time::Instant;

use super::backpressure::AudioGate;
use super::ban::{BanIdentity, BanRegistry, BanTier};
use super::channel::Channel;
use super::firewall::FirewallRequest;
use super::flood::{FloodPolicy, PatternError};
use super::identity::{IdentityBacklog, IdentityHash, IdentityResolver};
use super::protocol::{now_millis, CloseCode, Outbound, SessionLink};
use super::render::{RenderJob, RenderSequencer};
use super::roles::Roles;
use super::session::{Session, SessionId};
use super::user::User;
use crate::config::Config;
use crate::events::scheduler::EventScheduler;
use crate::logutil::{conn_tag, escape_log, sec_log};
use crate::metrics;
use crate::objects::catalog::starter_set;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("connection attempted too soon after the previous one")]
    TooSoon,
    #[error("identity or address is banned")]
    Banned,
    #[error("too many identities from this address")]
    TooManyIdentities,
}

impl ConnectError {
    pub fn close_code(self) -> CloseCode {
        match self {
            ConnectError::TooSoon => CloseCode::ConnectTooSoon,
            ConnectError::Banned => CloseCode::Banned,
            ConnectError::TooManyIdentities => CloseCode::TooManyIdentities,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            ConnectError::TooSoon => "Reconnecting too fast.",
            ConnectError::Banned => "Banned.",
            ConnectError::TooManyIdentities => "Too many identities from your address.",
        }
    }
}

/// A transport connection asking to join a room.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub session: SessionId,
    pub addr: IpAddr,
    pub token: String,
    pub channel: String,
    pub link: SessionLink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Joined {
    /// Room actually joined; differs from the requested one for trashed identities.
    pub channel: String,
    pub user_id: String,
    pub new_user: bool,
}

/// Work for the actor to spawn once the current event is handled.
#[derive(Debug, Clone)]
pub enum Deferred {
    Render(RenderJob),
    Firewall(FirewallRequest),
}

#[derive(Debug)]
pub struct ServerState {
    pub config: Config,
    pub channels: HashMap<String, Channel>,
    pub sessions: HashMap<SessionId, Session>,
    pub bans: BanRegistry,
    pub identities: IdentityBacklog,
    pub timers: EventScheduler,
    pub flood_policy: FloodPolicy,
    pub audio_gate: AudioGate,
    pub renders: RenderSequencer,
    resolver: IdentityResolver,
    deferred: Vec<Deferred>,
}

impl ServerState {
    pub fn new(config: Config) -> Result<Self, PatternError> {
        let flood_policy = FloodPolicy::from_config(&config.flood, &config.moderation)?;
        Ok(Self {
            resolver: IdentityResolver::new(config.server.secret.clone()),
            audio_gate: AudioGate::from_config(&config.audio),
            renders: RenderSequencer::new(),
            flood_policy,
            channels: HashMap::new(),
            sessions: HashMap::new(),
            bans: BanRegistry::new(),
            identities: IdentityBacklog::new(),
            timers: EventScheduler::new(),
            deferred: Vec::new(),
            config,
        })
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    pub fn defer(&mut self, work: Deferred) {
        self.deferred.push(work);
    }

    pub fn take_deferred(&mut self) -> Vec<Deferred> {
        std::mem::take(&mut self.deferred)
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Admit a connection into a room.
    pub fn connect(&mut self, req: ConnectRequest, now: Instant) -> Result<Joined, ConnectError> {
        let interval = Duration::from_secs(self.config.server.connect_interval_secs);
        if !self.identities.interval_ok(req.addr, now, interval) {
            metrics::inc_connections_rejected();
            return Err(ConnectError::TooSoon);
        }
        self.identities.prune_logins(now, interval);
        self.identities.touch(req.addr, now);

        let identity = self.resolver.resolve(&req.token);
        let probe = BanIdentity::new(Some(identity), Some(req.addr));
        if self.bans.is_member(&probe, BanTier::Ban) {
            metrics::inc_connections_rejected();
            sec_log!("Refused banned connection from {} ({})", req.addr, identity.user_id());
            return Err(ConnectError::Banned);
        }
        let channel_name = if self.bans.is_member(&probe, BanTier::Trash) {
            debug!("Redirecting trashed {} to '{}'", identity.user_id(), self.config.server.trash_channel);
            self.config.server.trash_channel.clone()
        } else {
            req.channel.clone()
        };

        let created = !self.channels.contains_key(&channel_name);
        if created {
            let starter = if self.config.objects.enabled {
                starter_set(self.config.objects.starter_random_objects, &mut rand::thread_rng())
            } else {
                Vec::new()
            };
            let channel = Channel::new(channel_name.clone(), self.config.server.backlog_size, starter);
            self.channels.insert(channel_name.clone(), channel);
            info!("Opened channel '{}'", escape_log(&channel_name));
        }

        let max_identities = self.config.server.max_identities_per_address;
        let allowed = self
            .channels
            .get(&channel_name)
            .map_or(false, |c| c.identity_allowed(req.addr, &identity, max_identities));
        if !allowed {
            if created {
                self.channels.remove(&channel_name);
            }
            metrics::inc_connections_rejected();
            sec_log!("Too many identities from {} in '{}'", req.addr, escape_log(&channel_name));
            return Err(ConnectError::TooManyIdentities);
        }

        self.identities.record(identity, req.addr, &channel_name, now);

        let user_id = identity.user_id();
        let session = Session {
            id: req.session,
            addr: req.addr,
            identity,
            roles: Roles::for_token(&self.config.privileges, &req.token),
            token: req.token,
            channel: channel_name.clone(),
            user_id: user_id.clone(),
            connected_at: now,
            audio_end: now,
            last_give: None,
            last_take: None,
            link: req.link.clone(),
        };
        let Some(channel) = self.channels.get_mut(&channel_name) else {
            return Err(ConnectError::TooManyIdentities);
        };
        let new_user = channel.join(req.link.clone(), req.addr, identity, || User::new(identity, now));
        if new_user {
            if let Some(user) = channel.user(&user_id) {
                channel.broadcast_except(
                    &user_id,
                    &Outbound::Connect {
                        user: user.info(false),
                        date: now_millis(),
                    },
                );
            }
        }
        req.link.send(&Outbound::Userlist {
            users: channel.userlist(&user_id),
        });
        req.link.send(&Outbound::Backlog {
            msgs: channel.backlog(),
            date: now_millis(),
        });
        info!("{} connected as {}", conn_tag(&channel_name, &user_id, req.addr), req.session);
        self.sessions.insert(req.session, session);
        metrics::inc_connections_accepted();
        Ok(Joined {
            channel: channel_name,
            user_id,
            new_user,
        })
    }

    /// Deregister a session. Unknown sessions are ignored.
    pub fn disconnect(&mut self, id: SessionId) -> bool {
        let Some(session) = self.sessions.remove(&id) else {
            return false;
        };
        let Some(channel) = self.channels.get_mut(&session.channel) else {
            return true;
        };
        if let Some(mut user) = channel.leave(id, session.addr, &session.identity) {
            for object in user.inventory.drain() {
                if object.folds_into_room() {
                    let _ = channel.inventory.add(object);
                }
            }
            channel.broadcast(&Outbound::Disconnect {
                userid: user.id.clone(),
                date: now_millis(),
            });
        }
        info!("{} disconnected", conn_tag(&session.channel, &session.user_id, session.addr));
        if channel.is_empty() {
            self.channels.remove(&session.channel);
            info!("Closed channel '{}'", escape_log(&session.channel));
        }
        true
    }

    /// Close a session from the server side and deregister it at once.
    pub fn close_session(&mut self, id: SessionId, code: CloseCode, reason: &str) {
        if let Some(session) = self.sessions.get(&id) {
            session.close(code, reason);
            if code != CloseCode::Shutdown {
                metrics::inc_sessions_kicked();
            }
        }
        self.disconnect(id);
    }

    /// Every session, in any room, belonging to `identity`.
    pub fn sessions_of_identity(&self, identity: &IdentityHash) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.identity == *identity)
            .map(|s| s.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn close_identity(&mut self, identity: &IdentityHash, code: CloseCode, reason: &str) {
        for id in self.sessions_of_identity(identity) {
            self.close_session(id, code, reason);
        }
    }

    /// Carry out the forced closes queued by the rooms.
    pub fn reap(&mut self) {
        let pending: Vec<_> = self
            .channels
            .values_mut()
            .flat_map(|c| c.take_pending_closes())
            .collect();
        for close in pending {
            sec_log!("Closing session {} ({}): {}", close.session, close.code.code(), close.reason);
            self.close_session(close.session, close.code, &close.reason);
        }
    }

    /// Addresses an identity is connected from, then those seen in the backlog.
    pub fn addresses_of(&self, identity: &IdentityHash) -> Vec<IpAddr> {
        let mut out: Vec<IpAddr> = Vec::new();
        let live = self.sessions.values().filter(|s| s.identity == *identity).map(|s| s.addr);
        for addr in live.chain(self.identities.addresses_of(identity)) {
            if !out.contains(&addr) {
                out.push(addr);
            }
        }
        out
    }

    /// Resolve a public user id to its identity, from live sessions first.
    pub fn identity_of_user(&self, user_id: &str) -> Option<IdentityHash> {
        self.sessions
            .values()
            .find(|s| s.user_id == user_id)
            .map(|s| s.identity)
            .or_else(|| self.identities.find_by_user_id(user_id))
    }

    /// Put an identity and its known addresses in a ban tier. Returns false when it
    /// already was a member.
    pub fn apply_ban(&mut self, identity: IdentityHash, tier: BanTier, duration: Duration, now: Instant) -> bool {
        let addresses = self.addresses_of(&identity);
        let mut first = BanIdentity::hash(identity);
        first.addr = addresses.first().copied();
        if !self.bans.apply(&first, tier, duration, &mut self.timers, now) {
            return false;
        }
        for addr in addresses.iter().skip(1) {
            self.bans.apply(&BanIdentity::addr(*addr), tier, duration, &mut self.timers, now);
        }
        metrics::inc_bans_applied();
        sec_log!(
            "Applied {} to {} for {}s ({} addresses)",
            tier,
            identity.user_id(),
            duration.as_secs(),
            addresses.len()
        );
        if tier == BanTier::Ban && !addresses.is_empty() {
            self.defer(Deferred::Firewall(FirewallRequest {
                addresses,
                tier,
                duration,
            }));
        }
        true
    }

    pub fn remove_ban(&mut self, identity: IdentityHash, tier: BanTier) -> bool {
        let mut removed = self.bans.remove(&BanIdentity::hash(identity), tier);
        for addr in self.addresses_of(&identity) {
            removed |= self.bans.remove(&BanIdentity::addr(addr), tier);
        }
        if removed {
            sec_log!("Removed {} of {}", tier, identity.user_id());
        }
        removed
    }

    pub fn lift_ban(&mut self, identity: &BanIdentity, tier: BanTier) {
        if self.bans.remove(identity, tier) {
            info!("{} expired for {:?}", tier, identity);
        }
    }

    pub fn clear_flood_warning(&mut self, channel: &str, user_id: &str, generation: u64) {
        let cleared = self
            .channels
            .get_mut(channel)
            .and_then(|c| c.user_mut(user_id))
            .map_or(false, |u| u.flood.clear_warning(generation));
        if cleared {
            debug!("Flood warning of {} in '{}' expired", user_id, escape_log(channel));
        }
    }

    pub fn is_shadowbanned(&self, session: &Session) -> bool {
        self.bans.is_member(
            &BanIdentity::new(Some(session.identity), Some(session.addr)),
            BanTier::Shadowban,
        )
    }

    /// Close every session with the shutdown code.
    pub fn shutdown(&mut self, reason: &str) {
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.sort();
        for id in ids {
            self.close_session(id, CloseCode::Shutdown, reason);
        }
    }

    pub fn user_count(&self) -> usize {
        self.channels.values().map(Channel::user_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::protocol::Frame;
    use crate::objects::{Object, ObjectKind};
    use tokio::sync::mpsc;

    fn state() -> ServerState {
        let mut config = Config::default();
        config.server.connect_interval_secs = 0;
        config.server.max_identities_per_address = 2;
        config.objects.starter_random_objects = 0;
        ServerState::new(config).unwrap()
    }

    fn request(id: u64, token: &str, addr: &str, channel: &str) -> (ConnectRequest, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ConnectRequest {
                session: SessionId(id),
                addr: addr.parse().unwrap(),
                token: token.into(),
                channel: channel.into(),
                link: SessionLink::new(SessionId(id), tx),
            },
            rx,
        )
    }

    fn types(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            match frame {
                Frame::Text(t) => {
                    let v: serde_json::Value = serde_json::from_str(&t).unwrap();
                    out.push(v["type"].as_str().unwrap_or_default().to_string());
                }
                Frame::Binary(_) => out.push("<binary>".into()),
                Frame::Close { code, .. } => out.push(format!("<close {}>", code.code())),
            }
        }
        out
    }

    #[test]
    fn newcomer_gets_userlist_then_backlog() {
        let mut st = state();
        let now = Instant::now();
        let (a, mut ra) = request(1, "a", "10.0.0.1", "toast");
        let joined = st.connect(a, now).unwrap();
        assert!(joined.new_user);
        assert_eq!(types(&mut ra), vec!["userlist", "backlog"]);
        // new rooms hold the three sacks
        assert_eq!(st.channels["toast"].inventory.len(), 3);

        let (b, mut rb) = request(2, "b", "10.0.0.2", "toast");
        st.connect(b, now).unwrap();
        assert_eq!(types(&mut ra), vec!["connect"]);
        assert_eq!(types(&mut rb), vec!["userlist", "backlog"]);
    }

    #[test]
    fn second_tab_does_not_announce() {
        let mut st = state();
        let now = Instant::now();
        let (a, _ra) = request(1, "a", "10.0.0.1", "toast");
        st.connect(a, now).unwrap();
        let (b, mut rb) = request(2, "b", "10.0.0.2", "toast");
        st.connect(b, now).unwrap();
        types(&mut rb);
        let (a2, _ra2) = request(3, "a", "10.0.0.1", "toast");
        assert!(!st.connect(a2, now).unwrap().new_user);
        assert!(types(&mut rb).is_empty());
    }

    #[test]
    fn connect_interval_is_enforced() {
        let mut st = state();
        st.config.server.connect_interval_secs = 5;
        let now = Instant::now();
        let (a, _ra) = request(1, "a", "10.0.0.1", "toast");
        st.connect(a, now).unwrap();
        let (b, _rb) = request(2, "b", "10.0.0.1", "toast");
        assert_eq!(st.connect(b, now + Duration::from_secs(1)), Err(ConnectError::TooSoon));
        let (c, _rc) = request(3, "c", "10.0.0.1", "toast");
        assert!(st.connect(c, now + Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn login_instants_do_not_pile_up() {
        let mut st = state();
        st.config.server.connect_interval_secs = 1;
        let start = Instant::now();
        for i in 0..500u64 {
            let addr = format!("10.{}.{}.1", i / 250, i % 250);
            let (req, _rx) = request(i + 1, &format!("visitor-{}", i), &addr, "toast");
            st.connect(req, start + Duration::from_secs(3600 * i)).unwrap();
            st.disconnect(SessionId(i + 1));
        }
        assert_eq!(st.identities.login_count(), 1);
    }

    #[test]
    fn banned_identity_is_refused_before_joining() {
        let mut st = state();
        let now = Instant::now();
        let hash = st.resolver().resolve("a");
        st.apply_ban(hash, BanTier::Ban, Duration::from_secs(60), now);
        let (a, _ra) = request(1, "a", "10.0.0.1", "toast");
        assert_eq!(st.connect(a, now), Err(ConnectError::Banned));
        assert!(st.channels.is_empty());
        assert_eq!(ConnectError::Banned.close_code(), CloseCode::Banned);
    }

    #[test]
    fn trashed_identity_lands_in_the_trash_room() {
        let mut st = state();
        let now = Instant::now();
        let hash = st.resolver().resolve("a");
        st.apply_ban(hash, BanTier::Trash, Duration::from_secs(60), now);
        let (a, _ra) = request(1, "a", "10.0.0.1", "toast");
        assert_eq!(st.connect(a, now).unwrap().channel, "cancer");
        assert!(st.channels.contains_key("cancer"));
        assert!(!st.channels.contains_key("toast"));
    }

    #[test]
    fn identity_cap_drops_the_fresh_room() {
        let mut st = state();
        st.config.server.max_identities_per_address = 0;
        let now = Instant::now();
        let (a, _ra) = request(1, "a", "10.0.0.1", "toast");
        assert_eq!(st.connect(a, now), Err(ConnectError::TooManyIdentities));
        assert!(st.channels.is_empty());
        assert!(st.sessions.is_empty());
    }

    #[test]
    fn leaving_user_drops_objects_on_the_floor() {
        let mut st = state();
        let now = Instant::now();
        let (a, _ra) = request(1, "a", "10.0.0.1", "toast");
        let joined = st.connect(a, now).unwrap();
        let (b, mut rb) = request(2, "b", "10.0.0.2", "toast");
        st.connect(b, now).unwrap();
        types(&mut rb);
        {
            let user = st.channels.get_mut("toast").unwrap().user_mut(&joined.user_id).unwrap();
            user.inventory.add(Object::new(ObjectKind::Gong)).unwrap();
            user.inventory
                .add(Object::new(ObjectKind::Disease {
                    illness: "flu",
                    patient_zero: "x".into(),
                }))
                .unwrap();
            user.inventory.add(Object::new(ObjectKind::SniperRifle { loaded: true })).unwrap();
        }
        assert!(st.disconnect(SessionId(1)));
        assert!(!st.disconnect(SessionId(1)));
        // sacks plus the gong only
        assert_eq!(st.channels["toast"].inventory.len(), 4);
        assert_eq!(types(&mut rb), vec!["disconnect"]);

        st.disconnect(SessionId(2));
        assert!(st.channels.is_empty());
    }

    #[test]
    fn closing_deregisters_immediately() {
        let mut st = state();
        let now = Instant::now();
        let (a, mut ra) = request(1, "a", "10.0.0.1", "toast");
        st.connect(a, now).unwrap();
        types(&mut ra);
        st.close_session(SessionId(1), CloseCode::Kicked, "bye");
        assert!(st.sessions.is_empty());
        assert_eq!(types(&mut ra), vec!["<close 4007>"]);
    }

    #[test]
    fn ban_covers_every_known_address_and_reaches_the_firewall() {
        let mut st = state();
        let now = Instant::now();
        let (a, _ra) = request(1, "a", "10.0.0.1", "toast");
        st.connect(a, now).unwrap();
        let (a2, _ra2) = request(2, "a", "10.0.0.7", "other");
        st.connect(a2, now).unwrap();
        let hash = st.resolver().resolve("a");
        assert!(st.apply_ban(hash, BanTier::Ban, Duration::from_secs(60), now));
        assert!(!st.apply_ban(hash, BanTier::Ban, Duration::from_secs(60), now));
        for addr in ["10.0.0.1", "10.0.0.7"] {
            assert!(st
                .bans
                .is_member(&BanIdentity::addr(addr.parse().unwrap()), BanTier::Ban));
        }
        let deferred = st.take_deferred();
        assert!(matches!(&deferred[..], [Deferred::Firewall(req)] if req.addresses.len() == 2));

        assert!(st.remove_ban(hash, BanTier::Ban));
        assert!(!st.bans.is_member(&BanIdentity::addr("10.0.0.7".parse().unwrap()), BanTier::Ban));
    }

    #[test]
    fn queued_kicks_are_reaped() {
        let mut st = state();
        let now = Instant::now();
        let (a, mut ra) = request(1, "a", "10.0.0.1", "toast");
        let joined = st.connect(a, now).unwrap();
        types(&mut ra);
        st.channels
            .get_mut("toast")
            .unwrap()
            .kick_user(&joined.user_id, CloseCode::Kicked, "Reconnect please");
        st.reap();
        assert!(st.sessions.is_empty());
        assert_eq!(types(&mut ra), vec!["<close 4007>"]);
    }
}
