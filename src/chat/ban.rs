//! Ban, shadowban and trash tiers.
//!
//! Membership of a tier is the only truth about whether an identity is punished; expiry
//! is a `LiftBan` entry in the delayed-action queue, never a timestamp compared on read.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::identity::IdentityHash;
use crate::events::scheduler::{DelayedAction, EventScheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BanTier {
    /// Connection refused.
    Ban,
    /// Messages only echo back to their author.
    Shadowban,
    /// Silently redirected to the trash room.
    Trash,
}

impl BanTier {
    fn slot(self) -> usize {
        match self {
            BanTier::Ban => 0,
            BanTier::Shadowban => 1,
            BanTier::Trash => 2,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ban" => Some(BanTier::Ban),
            "shadowban" => Some(BanTier::Shadowban),
            "trash" => Some(BanTier::Trash),
            _ => None,
        }
    }
}

impl fmt::Display for BanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BanTier::Ban => "ban",
            BanTier::Shadowban => "shadowban",
            BanTier::Trash => "trash",
        })
    }
}

/// Identity hash, network address, or both.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BanIdentity {
    pub hash: Option<IdentityHash>,
    pub addr: Option<IpAddr>,
}

impl BanIdentity {
    pub fn new(hash: Option<IdentityHash>, addr: Option<IpAddr>) -> Self {
        Self { hash, addr }
    }

    pub fn hash(hash: IdentityHash) -> Self {
        Self::new(Some(hash), None)
    }

    pub fn addr(addr: IpAddr) -> Self {
        Self::new(None, Some(addr))
    }
}

#[derive(Debug, Default)]
struct TierSet {
    hashes: HashSet<IdentityHash>,
    addrs: HashSet<IpAddr>,
}

impl TierSet {
    fn contains(&self, id: &BanIdentity) -> bool {
        id.hash.map_or(false, |h| self.hashes.contains(&h)) || id.addr.map_or(false, |a| self.addrs.contains(&a))
    }

    fn insert(&mut self, id: &BanIdentity) {
        if let Some(h) = id.hash {
            self.hashes.insert(h);
        }
        if let Some(a) = id.addr {
            self.addrs.insert(a);
        }
    }

    fn remove(&mut self, id: &BanIdentity) -> bool {
        let by_hash = id.hash.map_or(false, |h| self.hashes.remove(&h));
        let by_addr = id.addr.map_or(false, |a| self.addrs.remove(&a));
        by_hash || by_addr
    }
}

#[derive(Debug, Default)]
pub struct BanRegistry {
    tiers: [TierSet; 3],
}

impl BanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `id` to `tier` and schedule its removal after `duration`.
    ///
    /// Returns false, and schedules nothing, when `id` is already a member.
    pub fn apply(
        &mut self,
        id: &BanIdentity,
        tier: BanTier,
        duration: Duration,
        timers: &mut EventScheduler,
        now: Instant,
    ) -> bool {
        let set = &mut self.tiers[tier.slot()];
        if set.contains(id) {
            return false;
        }
        set.insert(id);
        timers.schedule(
            now + duration,
            DelayedAction::LiftBan {
                tier,
                identity: id.clone(),
            },
        );
        true
    }

    pub fn remove(&mut self, id: &BanIdentity, tier: BanTier) -> bool {
        self.tiers[tier.slot()].remove(id)
    }

    /// True when the hash or the address of `id` is in `tier`.
    pub fn is_member(&self, id: &BanIdentity, tier: BanTier) -> bool {
        self.tiers[tier.slot()].contains(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::identity::IdentityResolver;

    fn ident(token: &str, addr: &str) -> BanIdentity {
        BanIdentity::new(
            Some(IdentityResolver::new("s").resolve(token)),
            Some(addr.parse().unwrap()),
        )
    }

    #[test]
    fn apply_then_expire() {
        let mut reg = BanRegistry::new();
        let mut timers = EventScheduler::new();
        let now = Instant::now();
        let id = ident("a", "10.0.0.1");
        assert!(reg.apply(&id, BanTier::Ban, Duration::from_secs(60), &mut timers, now));
        assert!(reg.is_member(&id, BanTier::Ban));
        assert!(!reg.is_member(&id, BanTier::Shadowban));

        assert!(timers.pop_due(now + Duration::from_secs(59)).is_none());
        let (_, action) = timers.pop_due(now + Duration::from_secs(60)).unwrap();
        let DelayedAction::LiftBan { tier, identity } = action else {
            panic!("expected a ban lift");
        };
        assert!(reg.remove(&identity, tier));
        assert!(!reg.is_member(&id, BanTier::Ban));
    }

    #[test]
    fn reapply_is_a_noop() {
        let mut reg = BanRegistry::new();
        let mut timers = EventScheduler::new();
        let now = Instant::now();
        let id = ident("a", "10.0.0.1");
        assert!(reg.apply(&id, BanTier::Trash, Duration::from_secs(5), &mut timers, now));
        assert!(!reg.apply(&id, BanTier::Trash, Duration::from_secs(500), &mut timers, now));
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn membership_matches_hash_or_address() {
        let mut reg = BanRegistry::new();
        let mut timers = EventScheduler::new();
        let now = Instant::now();
        reg.apply(&ident("a", "10.0.0.1"), BanTier::Ban, Duration::from_secs(5), &mut timers, now);
        // same cookie from elsewhere
        assert!(reg.is_member(&ident("a", "10.0.0.2"), BanTier::Ban));
        // another cookie from the same address
        assert!(reg.is_member(&ident("b", "10.0.0.1"), BanTier::Ban));
        assert!(!reg.is_member(&ident("b", "10.0.0.2"), BanTier::Ban));
        assert!(reg.is_member(&BanIdentity::addr("10.0.0.1".parse().unwrap()), BanTier::Ban));
    }

    #[test]
    fn tier_names() {
        assert_eq!(BanTier::from_name("shadowban"), Some(BanTier::Shadowban));
        assert_eq!(BanTier::from_name("nope"), None);
        assert_eq!(BanTier::Trash.to_string(), "trash");
    }
}
