//! # Objects
//!
//! Items users carry, swap and use. Each object kind has a static
//! [`ObjectDescriptor`] (cooldown, targeting, inert/destructible/clonable flags, militia
//! restriction) and a kind-specific use handled in [`catalog`].
//!
//! ## Use
//!
//! [`Object::invoke`] runs the checks every object goes through, in order:
//!
//! 1. militia-only objects used by anyone else are refused; the caller then closes the
//!    offending session
//! 2. inert objects do nothing
//! 3. the cooldown must have elapsed since the last use
//! 4. targeted objects resolve `params = [name, ordinal]` against the room directory
//! 5. the kind-specific logic runs
//! 6. the use instant is recorded
//!
//! The object is taken out of its inventory for the duration of the call, so the
//! kind logic may freely touch the owner's inventory; destructible objects that set
//! [`Object::should_destroy`] are simply not put back.

pub mod catalog;
pub mod inventory;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::chat::channel::Channel;
use crate::chat::protocol::Outbound;
use crate::chat::session::SessionId;

pub use inventory::Inventory;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Targeting {
    None,
    Optional,
    Mandatory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectDescriptor {
    pub name: &'static str,
    pub icon: &'static str,
    pub cooldown: Option<Duration>,
    pub destructible: bool,
    pub targeting: Targeting,
    pub inert: bool,
    pub clonable: bool,
    pub militia_only: bool,
}

impl ObjectDescriptor {
    const fn plain(name: &'static str, icon: &'static str) -> Self {
        Self {
            name,
            icon,
            cooldown: None,
            destructible: false,
            targeting: Targeting::None,
            inert: false,
            clonable: false,
            militia_only: false,
        }
    }
}

/// Discriminant of [`ObjectKind`], used for per-class capacity and searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectClass {
    Flower,
    Disease,
    Gong,
    Revolver,
    RevolverCartridges,
    SniperRifle,
    SniperBullets,
    AlcoholBottle,
    SantasSack,
    ScrollOfQurk,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectKind {
    Flower { species: &'static str },
    Disease { illness: &'static str, patient_zero: String },
    Gong,
    Revolver { bullets: u8 },
    RevolverCartridges,
    SniperRifle { loaded: bool },
    SniperBullets { remaining: u8 },
    AlcoholBottle { drink: &'static str, sips_left: u8 },
    SantasSack,
    ScrollOfQurk,
}

impl ObjectKind {
    pub fn class(&self) -> ObjectClass {
        match self {
            ObjectKind::Flower { .. } => ObjectClass::Flower,
            ObjectKind::Disease { .. } => ObjectClass::Disease,
            ObjectKind::Gong => ObjectClass::Gong,
            ObjectKind::Revolver { .. } => ObjectClass::Revolver,
            ObjectKind::RevolverCartridges => ObjectClass::RevolverCartridges,
            ObjectKind::SniperRifle { .. } => ObjectClass::SniperRifle,
            ObjectKind::SniperBullets { .. } => ObjectClass::SniperBullets,
            ObjectKind::AlcoholBottle { .. } => ObjectClass::AlcoholBottle,
            ObjectKind::SantasSack => ObjectClass::SantasSack,
            ObjectKind::ScrollOfQurk => ObjectClass::ScrollOfQurk,
        }
    }
}

impl ObjectClass {
    pub fn descriptor(self) -> ObjectDescriptor {
        let base = match self {
            ObjectClass::Flower => ObjectDescriptor::plain("flower", "flower.gif"),
            ObjectClass::Disease => ObjectDescriptor::plain("disease", "disease.gif"),
            ObjectClass::Gong => ObjectDescriptor::plain("gong", "gong.gif"),
            ObjectClass::Revolver => ObjectDescriptor::plain("revolver", "revolver.gif"),
            ObjectClass::RevolverCartridges => ObjectDescriptor::plain("revolver cartridges", "cartridges.gif"),
            ObjectClass::SniperRifle => ObjectDescriptor::plain("sniper rifle", "sniper.gif"),
            ObjectClass::SniperBullets => ObjectDescriptor::plain("sniper bullets", "sniper_bullets.gif"),
            ObjectClass::AlcoholBottle => ObjectDescriptor::plain("bottle", "bottle.gif"),
            ObjectClass::SantasSack => ObjectDescriptor::plain("Santa's sack", "sack.gif"),
            ObjectClass::ScrollOfQurk => ObjectDescriptor::plain("scroll of Qurk", "scroll.gif"),
        };
        match self {
            ObjectClass::Flower => ObjectDescriptor { inert: true, ..base },
            ObjectClass::Disease => ObjectDescriptor {
                inert: true,
                clonable: true,
                ..base
            },
            ObjectClass::Gong => ObjectDescriptor {
                cooldown: Some(Duration::from_secs(30)),
                ..base
            },
            ObjectClass::Revolver => ObjectDescriptor {
                targeting: Targeting::Mandatory,
                ..base
            },
            ObjectClass::RevolverCartridges | ObjectClass::AlcoholBottle | ObjectClass::SantasSack => {
                ObjectDescriptor {
                    destructible: true,
                    ..base
                }
            }
            ObjectClass::SniperRifle => ObjectDescriptor {
                targeting: Targeting::Mandatory,
                militia_only: true,
                ..base
            },
            ObjectClass::SniperBullets => ObjectDescriptor {
                destructible: true,
                militia_only: true,
                ..base
            },
            ObjectClass::ScrollOfQurk => ObjectDescriptor {
                destructible: true,
                targeting: Targeting::Optional,
                ..base
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    Unauthorized,
    Inert,
    Cooldown,
    NoTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UseOutcome {
    Used,
    Denied(Denial),
}

/// Everything an object may touch while being used.
pub struct UseContext<'a> {
    pub channel: &'a mut Channel,
    /// User id of the owner, still present in `channel`.
    pub owner: &'a str,
    pub session: SessionId,
    /// Caller is militia or moderator.
    pub privileged: bool,
    pub params: &'a [String],
    pub now: Instant,
    pub max_items: usize,
}

impl UseContext<'_> {
    /// Private notification to the calling session.
    pub fn notify(&self, msg: impl Into<String>) {
        self.channel.send_to(self.session, &Outbound::notification(msg));
    }

    pub fn owner_name(&self) -> String {
        self.channel
            .user(self.owner)
            .map(|u| u.persona.fullname())
            .unwrap_or_default()
    }

    /// Resolve `params = [name, ordinal]` (ordinal 1-based, default 1) to a user id.
    pub fn resolve_target(&self) -> Option<String> {
        let name = self.params.first()?;
        let nth = self
            .params
            .get(1)
            .and_then(|o| o.parse::<usize>().ok())
            .map(|o| o.saturating_sub(1))
            .unwrap_or(0);
        self.channel.user_by_name(name, nth).map(|u| u.id.clone())
    }
}

/// One item. Equality is identity: two objects are equal only if one is a copy of the other.
#[derive(Debug, Clone)]
pub struct Object {
    serial: u64,
    kind: ObjectKind,
    last_use: Option<Instant>,
    spent: bool,
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        self.serial == other.serial
    }
}

impl Eq for Object {}

impl Object {
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            kind,
            last_use: None,
            spent: false,
        }
    }

    pub fn kind(&self) -> &ObjectKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut ObjectKind {
        &mut self.kind
    }

    pub fn class(&self) -> ObjectClass {
        self.kind.class()
    }

    pub fn descriptor(&self) -> ObjectDescriptor {
        self.class().descriptor()
    }

    pub fn name(&self) -> String {
        catalog::display_name(&self.kind)
    }

    /// Whether the object stays behind in the room when its owner leaves.
    pub fn folds_into_room(&self) -> bool {
        let d = self.descriptor();
        !d.clonable && !d.militia_only
    }

    pub fn should_destroy(&self) -> bool {
        self.descriptor().destructible && self.spent
    }

    pub(crate) fn mark_spent(&mut self) {
        self.spent = true;
    }

    pub fn invoke(&mut self, ctx: &mut UseContext<'_>) -> UseOutcome {
        let desc = self.descriptor();
        if desc.militia_only && !ctx.privileged {
            ctx.notify("This is a militia weapon, unauthorized use!");
            return UseOutcome::Denied(Denial::Unauthorized);
        }
        if desc.inert {
            ctx.notify("This object can't be used.");
            return UseOutcome::Denied(Denial::Inert);
        }
        if let (Some(cooldown), Some(last)) = (desc.cooldown, self.last_use) {
            if ctx.now.saturating_duration_since(last) < cooldown {
                ctx.notify("You have to wait before using this object again.");
                return UseOutcome::Denied(Denial::Cooldown);
            }
        }
        let target = match desc.targeting {
            Targeting::None => None,
            targeting => {
                let target = ctx.resolve_target();
                if target.is_none() && targeting == Targeting::Mandatory {
                    ctx.notify("Name a target, as for an attack: /use 3 Taupiqueur 2");
                    return UseOutcome::Denied(Denial::NoTarget);
                }
                target
            }
        };
        catalog::use_object(self, ctx, target);
        self.last_use = Some(ctx.now);
        UseOutcome::Used
    }
}
