//! Privileges granted by raw cookie allow-lists.

use crate::config::PrivilegeConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Roles {
    pub moderator: bool,
    pub militia: bool,
    pub sound_broadcaster: bool,
}

impl Roles {
    pub fn for_token(config: &PrivilegeConfig, token: &str) -> Self {
        let listed = |list: &[String]| list.iter().any(|t| t == token);
        Self {
            moderator: listed(&config.moderators),
            militia: listed(&config.militia),
            sound_broadcaster: listed(&config.sound_broadcasters),
        }
    }

    /// May use militia weapons and militia commands.
    pub fn armed(&self) -> bool {
        self.militia || self.moderator
    }
}
