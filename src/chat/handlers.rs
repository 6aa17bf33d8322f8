//! Client command handlers.
//!
//! Handlers are plain functions over the server state, run one at a time by the actor.
//! Rendering is the only step that needs to wait; a chat line is handed over as a
//! [`RenderJob`] and finished in [`finish_render`] once its audio is back and every
//! earlier line of the same session has been delivered.

use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use rand::Rng;
use serde_json::Value;
use tokio::time::Instant;

use super::ban::BanTier;
use super::channel::Channel;
use super::combat::{assign, attack_bonus, decide, Rolls};
use super::flood::FloodVerdict;
use super::protocol::{
    now_millis, AntifloodEvent, AttackEvent, CloseCode, ErrorReason, ModerationReply, ModerationState, Outbound,
};
use super::render::{RenderError, RenderJob, SpokenKind};
use super::roles::Roles;
use super::routing::{Payload, ProtocolError, RoutingTable};
use super::session::{Session, SessionId};
use super::state::{Deferred, ServerState};
use crate::effects::{EffectKind, EffectValue};
use crate::events::scheduler::DelayedAction;
use crate::logutil::{escape_log, sec_log};
use crate::metrics;
use crate::objects::catalog::{alcohol_bottle, SNIPER_BULLET_PACK};
use crate::objects::{Denial, Object, ObjectKind, UseContext, UseOutcome};
use crate::validation::{escape_html, sanitize_message, MAX_MOVE_ID};

/// Language used when a message names none.
pub const DEFAULT_LANG: &str = "fr";

/// Scrolls handed to a militia member asking for themselves.
const QURK_SELF_GRANT: usize = 5;

/// The session a command came from, captured before the handler runs.
#[derive(Debug, Clone)]
pub struct Caller {
    pub session: SessionId,
    pub channel: String,
    pub user_id: String,
    pub roles: Roles,
}

impl Caller {
    pub fn of(session: &Session) -> Self {
        Self {
            session: session.id,
            channel: session.channel.clone(),
            user_id: session.user_id.clone(),
            roles: session.roles,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("unauthorized use of '{0}'")]
    Unauthorized(&'static str),
}

/// Route and run one text frame, then carry out the closes it caused.
pub fn handle_text(state: &mut ServerState, routes: &RoutingTable, session: SessionId, raw: &str, now: Instant) {
    let Some(caller) = state.session(session).map(Caller::of) else {
        return;
    };
    metrics::inc_messages_routed();
    let result = routes
        .route(raw)
        .map_err(HandlerError::from)
        .and_then(|(handler, payload)| handler(state, &caller, &payload, now));
    if let Err(e) = result {
        fail(state, &caller, e);
    }
    state.reap();
}

/// Raw audio from a sound broadcaster, relayed as is.
pub fn handle_binary(state: &mut ServerState, session: SessionId, payload: Bytes) {
    let Some(caller) = state.session(session).map(Caller::of) else {
        return;
    };
    if !caller.roles.sound_broadcaster {
        fail(state, &caller, ProtocolError::BinaryRejected.into());
        return;
    }
    if let Some(channel) = state.channels.get(&caller.channel) {
        channel.broadcast_with_audio(
            &Outbound::AudioBroadcast {
                userid: caller.user_id.clone(),
                date: now_millis(),
            },
            Some(&payload),
        );
    }
}

fn fail(state: &mut ServerState, caller: &Caller, err: HandlerError) {
    match err {
        HandlerError::Protocol(e) => match e.close() {
            Some((code, reason)) => {
                debug!("Closing {} of {}: {}", caller.session, caller.user_id, e);
                state.close_session(caller.session, code, reason);
            }
            None => warn!("Could not route message from {}: {}", caller.user_id, escape_log(&e.to_string())),
        },
        HandlerError::Unauthorized(what) => {
            sec_log!(
                "Unauthorized '{}' by {} in '{}'",
                what,
                caller.user_id,
                escape_log(&caller.channel)
            );
            reply(state, caller, &Outbound::error(what, ErrorReason::Unauthorized));
            state.close_session(caller.session, CloseCode::Unauthorized, "Unauthorized access.");
        }
    }
}

fn reply(state: &ServerState, caller: &Caller, msg: &Outbound) {
    if let Some(session) = state.session(caller.session) {
        session.send(msg);
    }
}

fn refuse(channel: &Channel, caller: &Caller, request: &'static str, reason: ErrorReason) {
    channel.send_to(caller.session, &Outbound::error(request, reason));
}

fn str_field<'a>(payload: &'a Payload, name: &'static str) -> Result<&'a str, ProtocolError> {
    payload
        .get(name)
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingField(name))
}

/// Inventory index, given as a number or a numeric string.
fn index_field(payload: &Payload, name: &str) -> Option<usize> {
    match payload.get(name)? {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn number_field(payload: &Payload, name: &str) -> Option<f64> {
    match payload.get(name)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Free-form `params`, numbers turned into strings.
fn params(payload: &Payload) -> Vec<String> {
    match payload.get("params") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// `[name, ordinal]` from `params`, or from the `target`/`order` pair.
fn target_params(payload: &Payload) -> Vec<String> {
    let from_params = params(payload);
    if !from_params.is_empty() {
        return from_params;
    }
    let mut out = Vec::new();
    if let Some(name) = payload.get("target").and_then(Value::as_str) {
        out.push(name.to_string());
        match payload.get("order") {
            Some(Value::Number(n)) => out.push(n.to_string()),
            Some(Value::String(s)) => out.push(s.clone()),
            _ => {}
        }
    }
    out
}

/// Resolve `[name, ordinal]` (ordinal 1-based) against the directory.
pub fn find_target(channel: &Channel, params: &[String]) -> Option<String> {
    let name = params.first()?;
    let nth = params
        .get(1)
        .and_then(|o| o.parse::<usize>().ok())
        .map_or(0, |o| o.saturating_sub(1));
    channel.user_by_name(name, nth).map(|u| u.id.clone())
}

fn text_of(value: EffectValue, fallback: String) -> String {
    match value {
        EffectValue::Text(t) => t,
        _ => fallback,
    }
}

/// Judge a message against the caller's flood guard. Returns true when it may go out.
fn flood_gate(state: &mut ServerState, caller: &Caller, text: &str, now: Instant) -> bool {
    let Some(channel) = state.channels.get_mut(&caller.channel) else {
        return false;
    };
    let Some(user) = channel.user_mut(&caller.user_id) else {
        return false;
    };
    let identity = user.identity;
    match user.flood.check(&state.flood_policy, text, now) {
        FloodVerdict::Clean => true,
        FloodVerdict::Warn { generation, reason } => {
            metrics::inc_flood_warnings();
            info!("{} warned for flooding in '{}': {}", caller.user_id, escape_log(&caller.channel), reason);
            channel.send_to(
                caller.session,
                &Outbound::Antiflood {
                    event: AntifloodEvent::FloodWarning,
                    userid: caller.user_id.clone(),
                    date: now_millis(),
                },
            );
            state.timers.schedule(
                now + state.config.flood.warning_timeout(),
                DelayedAction::ClearFloodWarning {
                    channel: caller.channel.clone(),
                    user_id: caller.user_id.clone(),
                    generation,
                },
            );
            false
        }
        FloodVerdict::Ban { reason } => {
            channel.broadcast(&Outbound::Antiflood {
                event: AntifloodEvent::Banned,
                userid: caller.user_id.clone(),
                date: now_millis(),
            });
            sec_log!(
                "{} banned for flooding in '{}': {}",
                caller.user_id,
                escape_log(&caller.channel),
                reason
            );
            let duration = state.config.moderation.ban_duration();
            state.apply_ban(identity, BanTier::Ban, duration, now);
            state.close_identity(&identity, CloseCode::Banned, "Banned for flooding.");
            false
        }
    }
}

pub fn msg(state: &mut ServerState, caller: &Caller, payload: &Payload, now: Instant) -> Result<(), HandlerError> {
    let raw = str_field(payload, "msg")?;
    let lang = payload
        .get("lang")
        .and_then(Value::as_str)
        .filter(|l| !l.is_empty() && l.len() <= 8)
        .unwrap_or(DEFAULT_LANG)
        .to_string();
    let Some(session) = state.session(caller.session) else {
        return Ok(());
    };
    let wait = Duration::from_secs(state.config.server.time_before_talk_secs);
    if now.saturating_duration_since(session.connected_at) < wait {
        session.send(&Outbound::Wait { date: now_millis() });
        return Ok(());
    }
    let shadowbanned = state.is_shadowbanned(session);
    let audio_only = payload.contains_key("notext") && caller.roles.sound_broadcaster;

    let text = sanitize_message(raw, state.config.server.max_message_chars);
    if text.trim().is_empty() {
        return Ok(());
    }
    if !flood_gate(state, caller, &text, now) {
        return Ok(());
    }

    let Some(user) = state
        .channels
        .get_mut(&caller.channel)
        .and_then(|c| c.user_mut(&caller.user_id))
    else {
        return Ok(());
    };
    user.last_message = Some(now);
    let displayed = text_of(
        user.effects.apply_all(EffectKind::ExplicitText, EffectValue::Text(text.clone()), now),
        text,
    );
    let spoken = text_of(
        user.effects.apply_all(EffectKind::HiddenText, EffectValue::Text(displayed.clone()), now),
        displayed.clone(),
    );
    let voice = match user.effects.apply_all(EffectKind::Voice, EffectValue::Voice(user.voice), now) {
        EffectValue::Voice(v) => v,
        _ => user.voice,
    };
    let phonemic = user.effects.active(EffectKind::Phonemic, now);
    let audio = user.effects.active(EffectKind::Audio, now);
    let job = RenderJob {
        channel: caller.channel.clone(),
        user_id: caller.user_id.clone(),
        session: caller.session,
        seq: state.renders.issue(caller.session),
        kind: if audio_only { SpokenKind::AudioOnly } else { SpokenKind::Msg },
        displayed: escape_html(&displayed),
        spoken,
        lang,
        voice,
        phonemic,
        audio,
        shadowbanned,
    };
    state.defer(Deferred::Render(job));
    Ok(())
}

/// A render came back: deliver it along with any later lines of the same session it
/// was holding up.
pub fn render_done(state: &mut ServerState, job: RenderJob, result: Result<Option<Bytes>, RenderError>, now: Instant) {
    for (job, result) in state.renders.complete(job, result) {
        finish_render(state, job, result, now);
    }
}

/// Deliver a rendered chat line. The room, and the sender for private delivery, may be
/// gone by now.
pub fn finish_render(state: &mut ServerState, job: RenderJob, result: Result<Option<Bytes>, RenderError>, now: Instant) {
    let audio = match result {
        Ok(audio) => audio,
        Err(e) => {
            metrics::inc_renders_failed();
            warn!("Render for {} in '{}' failed: {}", job.user_id, escape_log(&job.channel), e);
            None
        }
    };
    let audio = match (audio, state.sessions.get_mut(&job.session)) {
        (Some(clip), Some(session)) => {
            if state.audio_gate.admit(&mut session.audio_end, clip.len(), now) {
                Some(clip)
            } else {
                metrics::inc_audio_suppressed();
                debug!("Audio of {} suppressed, previous clips still playing", job.user_id);
                None
            }
        }
        _ => None,
    };

    let Some(channel) = state.channels.get_mut(&job.channel) else {
        debug!("Dropping render for vanished channel '{}'", escape_log(&job.channel));
        return;
    };
    let date = now_millis();
    let msg = match job.kind {
        SpokenKind::AudioOnly => Outbound::AudioBroadcast {
            userid: job.user_id.clone(),
            date,
        },
        SpokenKind::Msg => Outbound::Msg {
            userid: job.user_id.clone(),
            msg: job.displayed.clone(),
            date,
        },
    };
    if job.shadowbanned {
        channel.send_to(job.session, &msg);
        if let Some(audio) = &audio {
            channel.send_binary_to(job.session, audio);
        }
        return;
    }
    if job.kind == SpokenKind::Msg {
        channel.push_backlog("msg", &job.user_id, &job.displayed);
    }
    channel.broadcast_with_audio(&msg, audio.as_ref());
}

fn unrendered(
    kind: &'static str,
    state: &mut ServerState,
    caller: &Caller,
    payload: &Payload,
    now: Instant,
) -> Result<(), HandlerError> {
    let text = escape_html(&sanitize_message(str_field(payload, "msg")?, state.config.server.max_message_chars));
    if !flood_gate(state, caller, &text, now) {
        return Ok(());
    }
    let shadowbanned = state.session(caller.session).map_or(false, |s| state.is_shadowbanned(s));
    let Some(channel) = state.channels.get_mut(&caller.channel) else {
        return Ok(());
    };
    let (userid, date) = (caller.user_id.clone(), now_millis());
    let out = if kind == "me" {
        Outbound::Me { userid, msg: text.clone(), date }
    } else {
        Outbound::Bot { userid, msg: text.clone(), date }
    };
    if shadowbanned {
        channel.send_to(caller.session, &out);
    } else {
        channel.push_backlog(kind, &caller.user_id, &text);
        channel.broadcast(&out);
    }
    Ok(())
}

pub fn me(state: &mut ServerState, caller: &Caller, payload: &Payload, now: Instant) -> Result<(), HandlerError> {
    unrendered("me", state, caller, payload, now)
}

pub fn bot(state: &mut ServerState, caller: &Caller, payload: &Payload, now: Instant) -> Result<(), HandlerError> {
    unrendered("bot", state, caller, payload, now)
}

pub fn private_msg(state: &mut ServerState, caller: &Caller, payload: &Payload, now: Instant) -> Result<(), HandlerError> {
    let text = escape_html(&sanitize_message(str_field(payload, "msg")?, state.config.server.max_message_chars));
    if !flood_gate(state, caller, &text, now) {
        return Ok(());
    }
    let shadowbanned = state.session(caller.session).map_or(false, |s| state.is_shadowbanned(s));
    let Some(channel) = state.channels.get(&caller.channel) else {
        return Ok(());
    };
    let target = match payload.get("userid").and_then(Value::as_str) {
        Some(id) => channel.user(id).map(|u| u.id.clone()),
        None => find_target(channel, &target_params(payload)),
    };
    let Some(target) = target.filter(|t| *t != caller.user_id) else {
        channel.send_to(caller.session, &Outbound::error("private_msg", ErrorReason::InvalidTarget));
        return Ok(());
    };
    let date = now_millis();
    if !shadowbanned {
        channel.send_to_user(
            &target,
            &Outbound::PrivateMsg {
                userid: caller.user_id.clone(),
                targetid: target.clone(),
                msg: text.clone(),
                date,
            },
        );
    }
    channel.send_to(
        caller.session,
        &Outbound::PrivateMsgSent {
            targetid: target,
            msg: text,
            date,
        },
    );
    Ok(())
}

pub fn attack(state: &mut ServerState, caller: &Caller, payload: &Payload, now: Instant) -> Result<(), HandlerError> {
    let resting = Duration::from_secs(state.config.combat.resting_time_secs);
    let Some(channel) = state.channels.get_mut(&caller.channel) else {
        return Ok(());
    };
    let Some(last_attack) = channel.user(&caller.user_id).map(|u| u.last_attack) else {
        return Ok(());
    };
    let defender = find_target(channel, &target_params(payload));
    let defender = match defender {
        Some(d) if now.saturating_duration_since(last_attack) >= resting => d,
        _ => {
            channel.send_to(caller.session, &Outbound::Attack(AttackEvent::Invalid { date: now_millis() }));
            return Ok(());
        }
    };

    channel.broadcast(&Outbound::Attack(AttackEvent::Attack {
        attacker_id: caller.user_id.clone(),
        defender_id: defender.clone(),
        date: now_millis(),
    }));
    let mut rng = rand::thread_rng();
    let rolls = Rolls::roll(&mut rng, attack_bonus(last_attack, now, resting));
    let outcome = decide(&rolls, rng.gen_range(1..=3));
    debug!("{} attacks {}: {:?} -> {:?}", caller.user_id, defender, rolls, outcome);
    channel.broadcast(&Outbound::Attack(AttackEvent::Dice {
        attacker_id: caller.user_id.clone(),
        defender_id: defender.clone(),
        attacker_dice: rolls.attacker,
        defender_dice: rolls.defender,
        attacker_bonus: rolls.attacker_bonus,
        defender_bonus: rolls.defender_bonus,
        date: now_millis(),
    }));

    let hits = assign(outcome, &caller.user_id, &defender, channel, now, &mut rng);
    if hits.is_empty() {
        channel.broadcast(&Outbound::Attack(AttackEvent::Nothing { date: now_millis() }));
    }
    for (target, bundle) in hits {
        channel.broadcast(&Outbound::Attack(AttackEvent::Effect {
            tag: bundle.tag(),
            target_id: target.clone(),
            effect: bundle.name(),
            timeout: bundle.timeout().as_secs(),
            date: now_millis(),
        }));
        if let Some(user) = channel.user_mut(&target) {
            user.effects.add(bundle, now);
        }
    }
    // the bonus of this attack was computed from the previous stamp
    if let Some(user) = channel.user_mut(&caller.user_id) {
        user.last_attack = now;
    }
    Ok(())
}

pub fn movement(state: &mut ServerState, caller: &Caller, payload: &Payload, _now: Instant) -> Result<(), HandlerError> {
    let (Some(id), Some(x), Some(y)) = (
        payload.get("id").and_then(Value::as_str),
        number_field(payload, "x"),
        number_field(payload, "y"),
    ) else {
        return Ok(());
    };
    let id: String = id.chars().take(MAX_MOVE_ID).collect();
    if let Some(channel) = state.channels.get(&caller.channel) {
        channel.broadcast(&Outbound::Move {
            id: escape_html(&id),
            userid: caller.user_id.clone(),
            x,
            y,
        });
    }
    Ok(())
}

pub fn inventory(state: &mut ServerState, caller: &Caller, _payload: &Payload, _now: Instant) -> Result<(), HandlerError> {
    let Some(channel) = state.channels.get(&caller.channel) else {
        return Ok(());
    };
    if let Some(user) = channel.user(&caller.user_id) {
        channel.send_to(
            caller.session,
            &Outbound::Inventory {
                items: user.inventory.listing(),
            },
        );
    }
    Ok(())
}

pub fn channel_inventory(
    state: &mut ServerState,
    caller: &Caller,
    _payload: &Payload,
    _now: Instant,
) -> Result<(), HandlerError> {
    if let Some(channel) = state.channels.get(&caller.channel) {
        channel.send_to(
            caller.session,
            &Outbound::ChannelInventory {
                items: channel.inventory.listing(),
            },
        );
    }
    Ok(())
}

pub fn obj_give(state: &mut ServerState, caller: &Caller, payload: &Payload, now: Instant) -> Result<(), HandlerError> {
    const REQUEST: &str = "obj_give";
    let cooldown = Duration::from_secs(state.config.objects.exchange_cooldown_secs);
    let max_items = state.config.objects.max_items_per_user;
    let Some(session) = state.sessions.get(&caller.session) else {
        return Ok(());
    };
    if !Session::exchange_ready(session.last_give, now, cooldown) {
        session.send(&Outbound::error(REQUEST, ErrorReason::TooSoon));
        return Ok(());
    }
    let Some(channel) = state.channels.get_mut(&caller.channel) else {
        return Ok(());
    };
    let Some(index) = index_field(payload, "object_id") else {
        refuse(channel, caller, REQUEST, ErrorReason::InvalidObject);
        return Ok(());
    };
    let Some(receiver) = find_target(channel, &target_params(payload)).filter(|r| *r != caller.user_id) else {
        refuse(channel, caller, REQUEST, ErrorReason::InvalidTarget);
        return Ok(());
    };
    let Some(clonable) = channel
        .user(&caller.user_id)
        .and_then(|u| u.inventory.get(index))
        .map(|o| o.descriptor().clonable)
    else {
        refuse(channel, caller, REQUEST, ErrorReason::InvalidObject);
        return Ok(());
    };
    if channel.user(&receiver).map_or(true, |u| u.inventory.len() >= max_items) {
        refuse(channel, caller, REQUEST, ErrorReason::InventoryFull);
        return Ok(());
    }

    let Some(giver) = channel.user_mut(&caller.user_id) else {
        return Ok(());
    };
    let given = if clonable {
        giver.inventory.get(index).cloned()
    } else {
        giver.inventory.remove(index)
    };
    let Some(given) = given else {
        return Ok(());
    };
    let name = given.name();
    let refused = match channel.user_mut(&receiver) {
        Some(user) => user.inventory.add(given).err(),
        None => Some(given),
    };
    if let Some(back) = refused {
        if !clonable {
            if let Some(giver) = channel.user_mut(&caller.user_id) {
                giver.inventory.restore(index, back);
            }
        }
        refuse(channel, caller, REQUEST, ErrorReason::InventoryFull);
        return Ok(());
    }

    channel.broadcast(&Outbound::Give {
        sender: caller.user_id.clone(),
        receiver,
        obj_name: name,
        date: now_millis(),
    });
    if let Some(session) = state.sessions.get_mut(&caller.session) {
        session.last_give = Some(now);
    }
    Ok(())
}

pub fn obj_use(state: &mut ServerState, caller: &Caller, payload: &Payload, now: Instant) -> Result<(), HandlerError> {
    const REQUEST: &str = "obj_use";
    let max_items = state.config.objects.max_items_per_user;
    let params = params(payload);
    let Some(channel) = state.channels.get_mut(&caller.channel) else {
        return Ok(());
    };
    let taken = index_field(payload, "object_id").and_then(|index| {
        channel
            .user_mut(&caller.user_id)
            .and_then(|u| u.inventory.remove(index))
            .map(|object| (index, object))
    });
    let Some((index, mut object)) = taken else {
        channel.send_to(caller.session, &Outbound::error(REQUEST, ErrorReason::InvalidObject));
        return Ok(());
    };

    let outcome = {
        let mut ctx = UseContext {
            channel: &mut *channel,
            owner: &caller.user_id,
            session: caller.session,
            privileged: caller.roles.armed(),
            params: &params,
            now,
            max_items,
        };
        object.invoke(&mut ctx)
    };
    if object.should_destroy() {
        debug!("{} used up its {}", caller.user_id, object.name());
    } else if let Some(user) = channel.user_mut(&caller.user_id) {
        user.inventory.restore(index, object);
    }

    match outcome {
        UseOutcome::Used | UseOutcome::Denied(Denial::Inert) => Ok(()),
        UseOutcome::Denied(Denial::Cooldown) => {
            channel.send_to(caller.session, &Outbound::error(REQUEST, ErrorReason::Cooldown));
            Ok(())
        }
        UseOutcome::Denied(Denial::NoTarget) => {
            channel.send_to(caller.session, &Outbound::error(REQUEST, ErrorReason::InvalidTarget));
            Ok(())
        }
        UseOutcome::Denied(Denial::Unauthorized) => Err(HandlerError::Unauthorized(REQUEST)),
    }
}

pub fn obj_trash(state: &mut ServerState, caller: &Caller, payload: &Payload, _now: Instant) -> Result<(), HandlerError> {
    let Some(channel) = state.channels.get_mut(&caller.channel) else {
        return Ok(());
    };
    let Some(user) = channel.user_mut(&caller.user_id) else {
        return Ok(());
    };
    let fullname = user.persona.fullname();
    let Some(object) = index_field(payload, "object_id").and_then(|i| user.inventory.remove(i)) else {
        channel.send_to(caller.session, &Outbound::error("obj_trash", ErrorReason::InvalidObject));
        return Ok(());
    };
    let name = object.name();
    if object.folds_into_room() {
        let _ = channel.inventory.add(object);
    }
    channel.broadcast(&Outbound::notification(format!("{} throws away the {}", fullname, name)));
    Ok(())
}

pub fn obj_take(state: &mut ServerState, caller: &Caller, payload: &Payload, now: Instant) -> Result<(), HandlerError> {
    const REQUEST: &str = "obj_take";
    let cooldown = Duration::from_secs(state.config.objects.exchange_cooldown_secs);
    let max_items = state.config.objects.max_items_per_user;
    let Some(session) = state.sessions.get(&caller.session) else {
        return Ok(());
    };
    if !Session::exchange_ready(session.last_take, now, cooldown) {
        session.send(&Outbound::error(REQUEST, ErrorReason::TooSoon));
        return Ok(());
    }
    let Some(channel) = state.channels.get_mut(&caller.channel) else {
        return Ok(());
    };
    let Some(held) = channel.user(&caller.user_id).map(|u| u.inventory.len()) else {
        return Ok(());
    };
    if held >= max_items {
        channel.send_to(caller.session, &Outbound::error(REQUEST, ErrorReason::InventoryFull));
        return Ok(());
    }
    let Some((index, object)) =
        index_field(payload, "object_id").and_then(|i| channel.inventory.remove(i).map(|o| (i, o)))
    else {
        channel.send_to(caller.session, &Outbound::error(REQUEST, ErrorReason::InvalidObject));
        return Ok(());
    };
    let name = object.name();
    let refused = match channel.user_mut(&caller.user_id) {
        Some(user) => user.inventory.add(object).err(),
        None => Some(object),
    };
    if let Some(back) = refused {
        channel.inventory.restore(index, back);
        channel.send_to(caller.session, &Outbound::error(REQUEST, ErrorReason::InventoryFull));
        return Ok(());
    }
    let fullname = channel
        .user(&caller.user_id)
        .map(|u| u.persona.fullname())
        .unwrap_or_default();
    channel.broadcast(&Outbound::notification(format!("{} picks up the {}", fullname, name)));
    if let Some(session) = state.sessions.get_mut(&caller.session) {
        session.last_take = Some(now);
    }
    Ok(())
}

fn moderation_reply(tier: BanTier, userid: &str, state: ModerationState) -> Outbound {
    let reply = ModerationReply {
        userid: userid.to_string(),
        state,
    };
    match tier {
        BanTier::Ban => Outbound::Ban(reply),
        BanTier::Shadowban => Outbound::Shadowban(reply),
        BanTier::Trash => Outbound::Trash(reply),
    }
}

/// `ban`, `shadowban` and `trash`: `{userid, action: apply|remove, timeout?}`.
pub fn moderate(state: &mut ServerState, caller: &Caller, payload: &Payload, now: Instant) -> Result<(), HandlerError> {
    let tier = payload
        .get("mod")
        .and_then(Value::as_str)
        .and_then(BanTier::from_name)
        .ok_or(ProtocolError::MissingField("mod"))?;
    if !caller.roles.moderator {
        return Err(HandlerError::Unauthorized(match tier {
            BanTier::Ban => "ban",
            BanTier::Shadowban => "shadowban",
            BanTier::Trash => "trash",
        }));
    }
    let user_id = str_field(payload, "userid")?.to_string();
    let action = str_field(payload, "action")?;
    let duration = payload
        .get("timeout")
        .and_then(Value::as_u64)
        .map(Duration::from_secs)
        .unwrap_or_else(|| match tier {
            BanTier::Ban => state.config.moderation.ban_duration(),
            _ => state.config.moderation.default_action_duration(),
        });

    let Some(identity) = state.identity_of_user(&user_id) else {
        reply(state, caller, &moderation_reply(tier, &user_id, ModerationState::InvalidUser));
        return Ok(());
    };
    match action {
        "apply" => {
            if tier == BanTier::Ban {
                if let Some(channel) = state.channels.get(&caller.channel) {
                    channel.broadcast(&Outbound::Antiflood {
                        event: AntifloodEvent::Banned,
                        userid: user_id.clone(),
                        date: now_millis(),
                    });
                }
            }
            sec_log!("{} applies {} to {} for {}s", caller.user_id, tier, user_id, duration.as_secs());
            state.apply_ban(identity, tier, duration, now);
            reply(state, caller, &moderation_reply(tier, &user_id, ModerationState::ApplyOk));
            match tier {
                BanTier::Ban => state.close_identity(&identity, CloseCode::Banned, "Banned."),
                // reconnecting lands them in the trash room
                BanTier::Trash => state.close_identity(&identity, CloseCode::Kicked, "Reconnect please"),
                BanTier::Shadowban => {}
            }
        }
        "remove" => {
            sec_log!("{} removes {} of {}", caller.user_id, tier, user_id);
            state.remove_ban(identity, tier);
            reply(state, caller, &moderation_reply(tier, &user_id, ModerationState::RemoveOk));
        }
        _ => return Err(ProtocolError::MissingField("action").into()),
    }
    Ok(())
}

/// Addresses and rooms recently seen for a user.
pub fn inspect(state: &mut ServerState, caller: &Caller, payload: &Payload, _now: Instant) -> Result<(), HandlerError> {
    if !caller.roles.armed() {
        return Err(HandlerError::Unauthorized("inspect"));
    }
    let user_id = match payload.get("userid").and_then(Value::as_str) {
        Some(id) => Some(id.to_string()),
        None => state
            .channels
            .get(&caller.channel)
            .and_then(|c| find_target(c, &target_params(payload))),
    };
    let Some((user_id, identity)) = user_id.and_then(|id| state.identity_of_user(&id).map(|h| (id, h))) else {
        reply(state, caller, &Outbound::error("inspect", ErrorReason::InvalidTarget));
        return Ok(());
    };
    sec_log!("{} inspects {}", caller.user_id, user_id);
    let out = Outbound::UserInspect {
        userid: user_id,
        addresses: state.addresses_of(&identity).iter().map(ToString::to_string).collect(),
        channels: state.identities.channels_of(&identity),
    };
    reply(state, caller, &out);
    Ok(())
}

pub fn weapons_grant(state: &mut ServerState, caller: &Caller, _payload: &Payload, _now: Instant) -> Result<(), HandlerError> {
    if !caller.roles.armed() {
        return Err(HandlerError::Unauthorized("weapons_grant"));
    }
    let Some(channel) = state.channels.get_mut(&caller.channel) else {
        return Ok(());
    };
    if let Some(user) = channel.user_mut(&caller.user_id) {
        let _ = user.inventory.add(Object::new(ObjectKind::SniperRifle { loaded: true }));
        for _ in 0..3 {
            let _ = user.inventory.add(Object::new(ObjectKind::SniperBullets {
                remaining: SNIPER_BULLET_PACK,
            }));
        }
    }
    channel.send_to(caller.session, &Outbound::notification("Weapons granted."));
    info!("Weapons granted to {} in '{}'", caller.user_id, escape_log(&caller.channel));
    Ok(())
}

/// One scroll of Qurk to the named user, or a handful to the caller.
pub fn qurk_master(state: &mut ServerState, caller: &Caller, payload: &Payload, _now: Instant) -> Result<(), HandlerError> {
    if !caller.roles.armed() {
        return Err(HandlerError::Unauthorized("qurk_master"));
    }
    let Some(channel) = state.channels.get_mut(&caller.channel) else {
        return Ok(());
    };
    match find_target(channel, &target_params(payload)) {
        Some(target) => {
            if let Some(user) = channel.user_mut(&target) {
                let _ = user.inventory.add(Object::new(ObjectKind::ScrollOfQurk));
            }
        }
        None => {
            if let Some(user) = channel.user_mut(&caller.user_id) {
                for _ in 0..QURK_SELF_GRANT {
                    let _ = user.inventory.add(Object::new(ObjectKind::ScrollOfQurk));
                }
            }
        }
    }
    Ok(())
}

/// A bottle for everyone in the room.
pub fn pub_brawl(state: &mut ServerState, caller: &Caller, _payload: &Payload, _now: Instant) -> Result<(), HandlerError> {
    if !caller.roles.armed() {
        return Err(HandlerError::Unauthorized("pub_brawl"));
    }
    let Some(channel) = state.channels.get_mut(&caller.channel) else {
        return Ok(());
    };
    let mut rng = rand::thread_rng();
    for user in channel.users_mut() {
        let _ = user.inventory.add(alcohol_bottle(&mut rng));
    }
    channel.broadcast(&Outbound::notification("Drinks are on the house!"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::protocol::{Frame, SessionLink};
    use crate::chat::state::ConnectRequest;
    use crate::config::Config;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Client {
        id: SessionId,
        rx: mpsc::UnboundedReceiver<Frame>,
        user_id: String,
    }

    impl Client {
        fn drain(&mut self) -> Vec<Value> {
            let mut out = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                match frame {
                    Frame::Text(t) => out.push(serde_json::from_str(&t).unwrap()),
                    Frame::Binary(b) => out.push(json!({"binary": b.len()})),
                    Frame::Close { code, .. } => out.push(json!({"close": code.code()})),
                }
            }
            out
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.server.connect_interval_secs = 0;
        config.objects.starter_random_objects = 0;
        config.privileges.moderators = vec!["mod-token".into()];
        config.privileges.militia = vec!["militia-token".into()];
        config
    }

    fn join(state: &mut ServerState, id: u64, token: &str, addr: &str, now: Instant) -> Client {
        let (tx, rx) = mpsc::unbounded_channel();
        let joined = state
            .connect(
                ConnectRequest {
                    session: SessionId(id),
                    addr: addr.parse().unwrap(),
                    token: token.into(),
                    channel: "toast".into(),
                    link: SessionLink::new(SessionId(id), tx),
                },
                now,
            )
            .unwrap();
        let mut client = Client {
            id: SessionId(id),
            rx,
            user_id: joined.user_id,
        };
        client.drain();
        client
    }

    fn send(state: &mut ServerState, client: &Client, msg: Value, now: Instant) {
        handle_text(state, &RoutingTable::standard(), client.id, &msg.to_string(), now);
    }

    /// `[name, ordinal]` designating `user_id` even when personas share a name.
    fn target_of(state: &ServerState, user_id: &str) -> Value {
        let channel = &state.channels["toast"];
        let name = channel.user(user_id).unwrap().persona.name.to_string();
        let ordinal = channel
            .users()
            .filter(|u| u.persona.name == name)
            .position(|u| u.id == user_id)
            .unwrap()
            + 1;
        json!([name, ordinal])
    }

    #[test]
    fn chat_line_is_deferred_then_broadcast() {
        let mut state = ServerState::new(config()).unwrap();
        let now = Instant::now();
        let mut a = join(&mut state, 1, "a", "10.0.0.1", now);
        let mut b = join(&mut state, 2, "b", "10.0.0.2", now);
        a.drain();
        send(&mut state, &a, json!({"type": "msg", "msg": "<b>hi</b>"}), now);
        assert!(a.drain().is_empty());

        let mut deferred = state.take_deferred();
        let Some(Deferred::Render(job)) = deferred.pop() else {
            panic!("expected a render job");
        };
        assert_eq!(job.displayed, "&lt;b&gt;hi&lt;/b&gt;");
        render_done(&mut state, job, Ok(Some(Bytes::from_static(b"RIFF"))), now);
        for client in [&mut a, &mut b] {
            let got = client.drain();
            assert_eq!(got[0]["type"], "msg");
            assert_eq!(got[1]["binary"], 4);
        }
        assert_eq!(state.channels["toast"].backlog().len(), 1);
    }

    #[test]
    fn malformed_messages_close_unknown_ones_are_dropped() {
        let mut state = ServerState::new(config()).unwrap();
        let now = Instant::now();
        let mut a = join(&mut state, 1, "a", "10.0.0.1", now);
        handle_text(&mut state, &RoutingTable::standard(), a.id, "{oops", now);
        assert_eq!(a.drain(), vec![json!({"close": 4001})]);
        assert!(state.sessions.is_empty());

        let mut b = join(&mut state, 2, "b", "10.0.0.2", now);
        send(&mut state, &b, json!({"type": "teleport"}), now);
        send(&mut state, &b, json!({"mod": "smite", "userid": "x"}), now);
        assert!(b.drain().is_empty());
        assert!(state.sessions.contains_key(&b.id));

        send(&mut state, &b, json!({"type": "me", "msg": "still here"}), now);
        assert_eq!(b.drain()[0]["type"], "me");
    }

    #[test]
    fn binary_needs_the_broadcaster_role() {
        let mut state = ServerState::new(config()).unwrap();
        let now = Instant::now();
        let mut a = join(&mut state, 1, "a", "10.0.0.1", now);
        handle_binary(&mut state, a.id, Bytes::from_static(b"xx"));
        assert_eq!(a.drain(), vec![json!({"close": 4002})]);
    }

    #[test]
    fn private_message_reaches_target_and_echoes() {
        let mut state = ServerState::new(config()).unwrap();
        let now = Instant::now();
        let mut a = join(&mut state, 1, "a", "10.0.0.1", now);
        let mut b = join(&mut state, 2, "b", "10.0.0.2", now);
        let mut c = join(&mut state, 3, "c", "10.0.0.3", now);
        a.drain();
        b.drain();
        send(&mut state, &a, json!({"type": "private_msg", "userid": b.user_id, "msg": "psst"}), now);
        assert_eq!(b.drain()[0]["type"], "private_msg");
        assert_eq!(a.drain()[0]["type"], "private_msg_sent");
        assert!(c.drain().is_empty());

        send(&mut state, &a, json!({"type": "private_msg", "userid": "nobody", "msg": "psst"}), now);
        assert_eq!(a.drain()[0]["reason"], "invalid_target");
    }

    #[test]
    fn attack_respects_resting_time() {
        let mut state = ServerState::new(config()).unwrap();
        let now = Instant::now();
        let mut a = join(&mut state, 1, "a", "10.0.0.1", now);
        let b = join(&mut state, 2, "b", "10.0.0.2", now);
        a.drain();
        let target = target_of(&state, &b.user_id);
        send(&mut state, &a, json!({"type": "attack", "params": target}), now);
        assert_eq!(a.drain()[0]["event"], "invalid");

        let later = now + Duration::from_secs(31);
        send(&mut state, &a, json!({"type": "attack", "params": target}), later);
        let events: Vec<Value> = a.drain().iter().map(|v| v["event"].clone()).collect();
        assert_eq!(events[0], "attack");
        assert_eq!(events[1], "dice");
        assert!(events.len() >= 3);
        assert_eq!(state.channels["toast"].user(&a.user_id).unwrap().last_attack, later);
    }

    #[test]
    fn take_and_give_move_objects() {
        let mut state = ServerState::new(config()).unwrap();
        let now = Instant::now();
        let mut a = join(&mut state, 1, "a", "10.0.0.1", now);
        let mut b = join(&mut state, 2, "b", "10.0.0.2", now);
        send(&mut state, &a, json!({"type": "obj_take", "object_id": 0}), now);
        assert_eq!(state.channels["toast"].inventory.len(), 2);
        a.drain();

        send(&mut state, &a, json!({"type": "obj_take", "object_id": 0}), now);
        assert_eq!(a.drain()[0]["reason"], "too_soon");

        b.drain();
        let target = target_of(&state, &b.user_id);
        send(&mut state, &a, json!({"type": "obj_give", "object_id": 0, "params": target}), now);
        let give = b.drain();
        assert_eq!(give[0]["type"], "give");
        assert_eq!(give[0]["obj_name"], "Santa's sack");
        assert_eq!(state.channels["toast"].user(&b.user_id).unwrap().inventory.len(), 1);

        let back = target_of(&state, &a.user_id);
        send(&mut state, &b, json!({"type": "obj_give", "object_id": 4, "params": back}), now);
        assert_eq!(b.drain()[0]["reason"], "invalid_object");
    }

    #[test]
    fn moderation_requires_the_role() {
        let mut state = ServerState::new(config()).unwrap();
        let now = Instant::now();
        let mut a = join(&mut state, 1, "a", "10.0.0.1", now);
        let b = join(&mut state, 2, "b", "10.0.0.2", now);
        send(
            &mut state,
            &a,
            json!({"mod": "ban", "userid": b.user_id, "action": "apply"}),
            now,
        );
        let got = a.drain();
        assert_eq!(got.last().unwrap()["close"], 4006);
        assert!(state.session(b.id).is_some());
    }

    #[test]
    fn moderator_ban_and_trash() {
        let mut state = ServerState::new(config()).unwrap();
        let now = Instant::now();
        let mut m = join(&mut state, 1, "mod-token", "10.0.0.1", now);
        let mut b = join(&mut state, 2, "b", "10.0.0.2", now);
        let mut c = join(&mut state, 3, "c", "10.0.0.3", now);

        send(&mut state, &m, json!({"mod": "trash", "userid": c.user_id, "action": "apply"}), now);
        assert_eq!(c.drain().last().unwrap()["close"], 4007);
        assert_eq!(m.drain().iter().find(|v| v["type"] == "trash").unwrap()["state"], "apply_ok");

        b.drain();
        send(&mut state, &m, json!({"mod": "ban", "userid": b.user_id, "action": "apply"}), now);
        let got = b.drain();
        assert_eq!(got[0]["type"], "antiflood");
        assert_eq!(got.last().unwrap()["close"], 4004);
        assert!(state.session(b.id).is_none());

        send(&mut state, &m, json!({"mod": "shadowban", "userid": "0000000000000000", "action": "apply"}), now);
        assert_eq!(m.drain().last().unwrap()["state"], "invalid_user");
    }

    #[test]
    fn shadowbanned_lines_only_echo() {
        let mut state = ServerState::new(config()).unwrap();
        let now = Instant::now();
        let mut m = join(&mut state, 1, "mod-token", "10.0.0.1", now);
        let mut b = join(&mut state, 2, "b", "10.0.0.2", now);
        send(&mut state, &m, json!({"mod": "shadowban", "userid": b.user_id, "action": "apply"}), now);
        m.drain();
        send(&mut state, &b, json!({"type": "me", "msg": "waves"}), now);
        assert_eq!(b.drain()[0]["type"], "me");
        assert!(m.drain().is_empty());
        assert!(state.channels["toast"].backlog().is_empty());
    }

    #[test]
    fn militia_grants() {
        let mut state = ServerState::new(config()).unwrap();
        let now = Instant::now();
        let m = join(&mut state, 1, "militia-token", "10.0.0.1", now);
        let mut b = join(&mut state, 2, "b", "10.0.0.2", now);
        send(&mut state, &m, json!({"mod": "weapons_grant"}), now);
        assert_eq!(state.channels["toast"].user(&m.user_id).unwrap().inventory.len(), 4);
        send(&mut state, &m, json!({"mod": "pub_brawl"}), now);
        assert_eq!(state.channels["toast"].user(&b.user_id).unwrap().inventory.len(), 1);
        assert_eq!(b.drain()[0]["type"], "notification");

        send(&mut state, &b, json!({"mod": "pub_brawl"}), now);
        assert!(state.session(b.id).is_none());
    }

    #[test]
    fn militia_object_use_is_unauthorized_for_civilians() {
        let mut state = ServerState::new(config()).unwrap();
        let now = Instant::now();
        let mut a = join(&mut state, 1, "a", "10.0.0.1", now);
        state
            .channels
            .get_mut("toast")
            .unwrap()
            .user_mut(&a.user_id)
            .unwrap()
            .inventory
            .add(Object::new(ObjectKind::SniperRifle { loaded: true }))
            .unwrap();
        send(&mut state, &a, json!({"type": "obj_use", "object_id": 0, "params": []}), now);
        assert_eq!(a.drain().last().unwrap()["close"], 4006);
    }
}
