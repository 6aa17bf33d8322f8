//! What each object kind does when used, how it is named, and the random draws that
//! stock rooms and sacks.

use rand::seq::SliceRandom;
use rand::Rng;

use super::{Object, ObjectKind, UseContext};
use crate::chat::protocol::{now_millis, AttackEvent, CloseCode, Outbound};
use crate::effects::catalog::{drunk_group, random_effect};

pub const REVOLVER_BULLETS: u8 = 6;
pub const SNIPER_BULLET_PACK: u8 = 3;
pub const BOTTLE_SIPS: u8 = 5;
/// Santa's sacks in every new room.
pub const STARTER_SACKS: usize = 3;
/// Farthest directory distance a revolver reaches.
const REVOLVER_RANGE: usize = 2;

const FLOWERS: &[&str] = &[
    "rose", "white lily", "iris", "chrysanthemum", "carnation", "daffodil", "lily of the valley",
    "tulip", "orchid",
];
const ILLNESSES: &[&str] = &["syphilis", "diarrhoea", "clap", "bird flu"];
const DRINKS: &[&str] = &["whisky", "vodka", "rum", "cheap wine", "pastis"];

fn ammo_bar(n: u8) -> String {
    "▮".repeat(n as usize)
}

fn bottle_filling(sips_left: u8) -> &'static str {
    match sips_left {
        0 => "empty",
        1 => "almost empty",
        2 => "half empty",
        3 | 4 => "almost full",
        _ => "full",
    }
}

pub fn display_name(kind: &ObjectKind) -> String {
    match kind {
        ObjectKind::Flower { species } => species.to_string(),
        ObjectKind::Disease { illness, patient_zero } => format!("{} of {}", illness, patient_zero),
        ObjectKind::Gong => "gong".into(),
        ObjectKind::Revolver { bullets: 0 } => "revolver (empty)".into(),
        ObjectKind::Revolver { bullets } => format!("revolver ({})", ammo_bar(*bullets)),
        ObjectKind::RevolverCartridges => "revolver cartridges".into(),
        ObjectKind::SniperRifle { loaded: true } => "sniper rifle".into(),
        ObjectKind::SniperRifle { loaded: false } => "sniper rifle (empty)".into(),
        ObjectKind::SniperBullets { remaining } => format!("sniper bullets ({})", ammo_bar(*remaining)),
        ObjectKind::AlcoholBottle { drink, sips_left } => {
            format!("bottle of {} ({})", drink, bottle_filling(*sips_left))
        }
        ObjectKind::SantasSack => "Santa's sack".into(),
        ObjectKind::ScrollOfQurk => "scroll of Qurk".into(),
    }
}

/// Uniform draw over the objects that sacks and new rooms hand out. Diseases carry
/// `donor` as their patient zero.
pub fn random_object(donor: &str, rng: &mut impl Rng) -> Object {
    let kind = match rng.gen_range(0..7) {
        0 => ObjectKind::Flower {
            species: FLOWERS.choose(rng).copied().unwrap_or("rose"),
        },
        1 => ObjectKind::Disease {
            illness: ILLNESSES.choose(rng).copied().unwrap_or("flu"),
            patient_zero: donor.to_string(),
        },
        2 => ObjectKind::Gong,
        3 => ObjectKind::Revolver {
            bullets: REVOLVER_BULLETS,
        },
        4 => ObjectKind::RevolverCartridges,
        5 => ObjectKind::AlcoholBottle {
            drink: DRINKS.choose(rng).copied().unwrap_or("whisky"),
            sips_left: BOTTLE_SIPS,
        },
        _ => ObjectKind::ScrollOfQurk,
    };
    Object::new(kind)
}

pub fn alcohol_bottle(rng: &mut impl Rng) -> Object {
    Object::new(ObjectKind::AlcoholBottle {
        drink: DRINKS.choose(rng).copied().unwrap_or("whisky"),
        sips_left: BOTTLE_SIPS,
    })
}

/// Contents of a freshly created room.
pub fn starter_set(extra: usize, rng: &mut impl Rng) -> Vec<Object> {
    let mut set: Vec<Object> = (0..STARTER_SACKS).map(|_| Object::new(ObjectKind::SantasSack)).collect();
    set.extend((0..extra).map(|_| random_object("Santa", rng)));
    set
}

/// Kind-specific behaviour, after the common checks of [`Object::invoke`] passed.
pub(super) fn use_object(object: &mut Object, ctx: &mut UseContext<'_>, target: Option<String>) {
    let owner_name = ctx.owner_name();
    let target_name = target
        .as_deref()
        .and_then(|t| ctx.channel.user(t))
        .map(|u| u.persona.fullname())
        .unwrap_or_default();

    match object.kind_mut() {
        // inert kinds never get here
        ObjectKind::Flower { .. } | ObjectKind::Disease { .. } => {}

        ObjectKind::Gong => {
            ctx.channel
                .broadcast(&Outbound::notification(format!("{} strikes the gong. GONNNNG!", owner_name)));
        }

        ObjectKind::Revolver { bullets } => {
            let Some(target) = target else { return };
            if *bullets == 0 {
                ctx.notify("Out of ammo!");
                return;
            }
            let in_range = ctx
                .channel
                .directory_distance(ctx.owner, &target)
                .map_or(false, |d| d <= REVOLVER_RANGE);
            if !in_range {
                ctx.notify("Too far away to shoot!");
                return;
            }
            *bullets -= 1;
            ctx.channel.broadcast(&Outbound::notification(format!(
                "{} shoots {} with a revolver",
                owner_name, target_name
            )));
            ctx.channel.kick_user(&target, CloseCode::Kicked, "Reconnect please");
        }

        ObjectKind::RevolverCartridges => {
            let inventory = match ctx.channel.user_mut(ctx.owner) {
                Some(user) => &mut user.inventory,
                None => return,
            };
            let emptiest = inventory
                .iter_mut()
                .filter_map(|o| match o.kind_mut() {
                    ObjectKind::Revolver { bullets } if *bullets < REVOLVER_BULLETS => Some(bullets),
                    _ => None,
                })
                .min_by_key(|b| **b);
            match emptiest {
                Some(bullets) => {
                    *bullets = REVOLVER_BULLETS;
                    object.mark_spent();
                    ctx.notify("Revolver loaded!");
                }
                None => ctx.notify("No revolver to reload in your inventory"),
            }
        }

        ObjectKind::SniperRifle { loaded } => {
            let Some(target) = target else { return };
            if !*loaded {
                ctx.notify("Out of ammo!");
                return;
            }
            *loaded = false;
            ctx.channel.broadcast(&Outbound::notification(format!(
                "{} fires a sniper rifle at {}",
                owner_name, target_name
            )));
            ctx.channel.kick_user(&target, CloseCode::Kicked, "Reconnect later");
        }

        ObjectKind::SniperBullets { remaining } => {
            let inventory = match ctx.channel.user_mut(ctx.owner) {
                Some(user) => &mut user.inventory,
                None => return,
            };
            let empty_rifle = inventory.iter_mut().find_map(|o| match o.kind_mut() {
                ObjectKind::SniperRifle { loaded } if !*loaded => Some(loaded),
                _ => None,
            });
            match empty_rifle {
                Some(loaded) => {
                    *loaded = true;
                    *remaining = remaining.saturating_sub(1);
                    if *remaining == 0 {
                        object.mark_spent();
                    }
                    ctx.notify("Sniper rifle loaded!");
                }
                None => ctx.notify("No empty sniper rifle in your inventory"),
            }
        }

        ObjectKind::AlcoholBottle { drink, sips_left } => {
            if *sips_left == 0 {
                ctx.notify("The bottle is empty!");
                return;
            }
            *sips_left -= 1;
            let drink = *drink;
            let spent = *sips_left == 0;
            ctx.channel
                .broadcast(&Outbound::notification(format!("{} downs some {}!", owner_name, drink)));
            if let Some(user) = ctx.channel.user_mut(ctx.owner) {
                user.effects.add(drunk_group(), ctx.now);
            }
            if spent {
                object.mark_spent();
            }
        }

        ObjectKind::SantasSack => {
            let mut rng = rand::thread_rng();
            let max_items = ctx.max_items;
            let mut lucky = 0;
            for user in ctx.channel.users_mut() {
                if user.inventory.len() >= max_items {
                    continue;
                }
                if user.inventory.add(random_object(&owner_name, &mut rng)).is_ok() {
                    lucky += 1;
                }
            }
            ctx.channel.broadcast(&Outbound::notification(format!(
                "{} opens Santa's sack: {} users get a present",
                owner_name, lucky
            )));
            object.mark_spent();
        }

        ObjectKind::ScrollOfQurk => {
            let target = target.unwrap_or_else(|| ctx.owner.to_string());
            let bundle = random_effect(ctx.now, &mut rand::thread_rng());
            let event = Outbound::Attack(AttackEvent::Effect {
                tag: bundle.tag(),
                target_id: target.clone(),
                effect: bundle.name(),
                timeout: bundle.timeout().as_secs(),
                date: now_millis(),
            });
            let Some(user) = ctx.channel.user_mut(&target) else { return };
            let victim = user.persona.fullname();
            user.effects.add(bundle, ctx.now);
            ctx.channel.broadcast(&Outbound::notification(format!(
                "{} reads a scroll of Qurk upon {}",
                owner_name, victim
            )));
            ctx.channel.broadcast(&event);
            object.mark_spent();
        }
    }
}
