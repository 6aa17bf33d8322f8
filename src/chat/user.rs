//! A room participant.

use tokio::time::Instant;

use super::flood::FloodGuard;
use super::identity::IdentityHash;
use super::persona::{self, Persona, PersonaParams, UserInfo};
use super::session::SessionId;
use crate::effects::{EffectQueueSet, VoiceParams};
use crate::objects::Inventory;

#[derive(Debug)]
pub struct User {
    pub id: String,
    pub identity: IdentityHash,
    pub persona: Persona,
    pub voice: VoiceParams,
    pub effects: EffectQueueSet,
    pub inventory: Inventory,
    pub flood: FloodGuard,
    pub sessions: Vec<SessionId>,
    pub joined: Instant,
    pub last_attack: Instant,
    pub last_message: Option<Instant>,
}

impl User {
    pub fn new(identity: IdentityHash, now: Instant) -> Self {
        let (persona, voice) = persona::derive(&identity);
        Self {
            id: identity.user_id(),
            identity,
            persona,
            voice,
            effects: EffectQueueSet::new(),
            inventory: Inventory::new(),
            flood: FloodGuard::new(),
            sessions: Vec::new(),
            joined: now,
            last_attack: now,
            last_message: None,
        }
    }

    /// Listing entry; `you` marks the entry describing the receiving user.
    pub fn info(&self, you: bool) -> UserInfo {
        UserInfo {
            userid: self.id.clone(),
            params: PersonaParams {
                name: self.persona.name.to_string(),
                img: format!("/img/pokemon/medium/{}.gif", self.persona.image_id),
                color: self.persona.color.clone(),
                adjective: self.persona.adjective.to_string(),
                you: you.then_some(true),
            },
            profile: self.persona.profile.clone(),
        }
    }

    pub fn is_active_since(&self, since: Instant) -> bool {
        self.last_message.map_or(false, |t| t >= since)
    }
}
