//! # Configuration Management Module
//!
//! All runtime knobs of the chat server live in one TOML file, deserialized into [`Config`].
//! Every field carries a serde default, so an empty file (or [`Config::default`]) yields a
//! working server.
//!
//! ## Configuration Structure
//!
//! - [`ServerConfig`] - listener, identity secret, room limits
//! - [`FloodConfig`] - sliding window and escalation timers
//! - [`ModerationConfig`] - ban durations and banned-word patterns
//! - [`PrivilegeConfig`] - moderator / militia / sound broadcaster allow-lists
//! - [`AudioConfig`] - backpressure grace and playback estimate
//! - [`ObjectConfig`] - item economy limits
//! - [`CombatConfig`] - attack resting time
//! - [`EventsConfig`] - world event cadences
//! - [`FirewallConfig`] - network ban collaborator
//! - [`RendererConfig`] - speech renderer collaborator
//! - [`LoggingConfig`] - log level and files
//!
//! ## Usage
//!
//! ```rust,no_run
//! use voxroom::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     println!("Listening on {}", config.server.bind);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:9000"
//! secret = "change me"
//! trash_channel = "cancer"
//!
//! [flood]
//! window_secs = 4
//! messages_per_sec = 3
//!
//! [moderation]
//! banned_words = ['(?i).*\bspam\b.*']
//! ```

use anyhow::{anyhow, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub flood: FloodConfig,
    #[serde(default)]
    pub moderation: ModerationConfig,
    #[serde(default)]
    pub privileges: PrivilegeConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub objects: ObjectConfig,
    #[serde(default)]
    pub combat: CombatConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub firewall: FirewallConfig,
    #[serde(default)]
    pub renderer: RendererConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address of the WebSocket listener.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Mixed into every identity hash. Changing it reshuffles every persona.
    #[serde(default = "default_secret")]
    pub secret: String,
    /// Room that trash-tier identities are silently redirected to.
    #[serde(default = "default_trash_channel")]
    pub trash_channel: String,
    /// Room used when the request path names none.
    #[serde(default = "default_channel")]
    pub default_channel: String,
    /// Distinct identities allowed per network address in one room.
    #[serde(default = "default_max_identities")]
    pub max_identities_per_address: usize,
    /// Minimum delay between two connections from the same address.
    #[serde(default = "default_connect_interval")]
    pub connect_interval_secs: u64,
    /// Delay after joining before a session may talk.
    #[serde(default)]
    pub time_before_talk_secs: u64,
    #[serde(default = "default_backlog_size")]
    pub backlog_size: usize,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    /// Honor `X-Real-IP` from a reverse proxy.
    #[serde(default)]
    pub trust_proxy_headers: bool,
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
}

fn default_bind() -> String {
    "127.0.0.1:9000".to_string()
}
fn default_secret() -> String {
    "voxroom-default-secret".to_string()
}
fn default_trash_channel() -> String {
    "cancer".to_string()
}
fn default_channel() -> String {
    "toast".to_string()
}
fn default_max_identities() -> usize {
    4
}
fn default_connect_interval() -> u64 {
    1
}
fn default_backlog_size() -> usize {
    10
}
fn default_max_message_chars() -> usize {
    500
}
fn default_status_interval() -> u64 {
    300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            secret: default_secret(),
            trash_channel: default_trash_channel(),
            default_channel: default_channel(),
            max_identities_per_address: default_max_identities(),
            connect_interval_secs: default_connect_interval(),
            time_before_talk_secs: 0,
            backlog_size: default_backlog_size(),
            max_message_chars: default_max_message_chars(),
            trust_proxy_headers: false,
            status_interval_secs: default_status_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloodConfig {
    #[serde(default = "default_flood_window")]
    pub window_secs: u64,
    /// Average rate over the window above which a user is flooding.
    #[serde(default = "default_flood_rate")]
    pub messages_per_sec: u32,
    /// A warned user who stops flooding is forgiven after this long.
    #[serde(default = "default_warning_timeout")]
    pub warning_timeout_secs: u64,
}

fn default_flood_window() -> u64 {
    4
}
fn default_flood_rate() -> u32 {
    3
}
fn default_warning_timeout() -> u64 {
    5 * 60
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            window_secs: default_flood_window(),
            messages_per_sec: default_flood_rate(),
            warning_timeout_secs: default_warning_timeout(),
        }
    }
}

impl FloodConfig {
    /// Messages tolerated inside one window.
    pub fn threshold(&self) -> usize {
        self.messages_per_sec as usize * self.window_secs as usize
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn warning_timeout(&self) -> Duration {
        Duration::from_secs(self.warning_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationConfig {
    /// Duration of a flood ban.
    #[serde(default = "default_ban_minutes")]
    pub ban_minutes: u64,
    /// Duration of a moderator action when the request carries no timeout.
    #[serde(default = "default_mod_action_minutes")]
    pub default_action_minutes: u64,
    /// Full-match regular expressions; `(?i)` for case insensitivity.
    #[serde(default = "default_banned_words")]
    pub banned_words: Vec<String>,
}

fn default_ban_minutes() -> u64 {
    1
}
fn default_mod_action_minutes() -> u64 {
    60
}
fn default_banned_words() -> Vec<String> {
    vec![
        r"(?i).*\bTrump\b.*".to_string(),
        r"(?i).*\bfag(got)?\b.*".to_string(),
    ]
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            ban_minutes: default_ban_minutes(),
            default_action_minutes: default_mod_action_minutes(),
            banned_words: default_banned_words(),
        }
    }
}

impl ModerationConfig {
    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_minutes * 60)
    }

    pub fn default_action_duration(&self) -> Duration {
        Duration::from_secs(self.default_action_minutes * 60)
    }
}

/// Raw identity cookies granted extra rights. Matching is done on the cookie itself,
/// not on its hash, so tokens never appear in logs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PrivilegeConfig {
    #[serde(default)]
    pub moderators: Vec<String>,
    #[serde(default)]
    pub militia: Vec<String>,
    #[serde(default)]
    pub sound_broadcasters: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_grace_ms")]
    pub grace_period_ms: u64,
    /// Bit rate used to estimate playback time of rendered audio.
    #[serde(default = "default_bits_per_sec")]
    pub estimate_bits_per_sec: u64,
}

fn default_grace_ms() -> u64 {
    2500
}
fn default_bits_per_sec() -> u64 {
    6_000_000
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_ms(),
            estimate_bits_per_sec: default_bits_per_sec(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Random objects seeded in a new room in addition to the fixed sacks.
    #[serde(default = "default_starter_random")]
    pub starter_random_objects: usize,
    #[serde(default = "default_max_items")]
    pub max_items_per_user: usize,
    #[serde(default = "default_exchange_cooldown")]
    pub exchange_cooldown_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_starter_random() -> usize {
    2
}
fn default_max_items() -> usize {
    12
}
fn default_exchange_cooldown() -> u64 {
    5
}

impl Default for ObjectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            starter_random_objects: default_starter_random(),
            max_items_per_user: default_max_items(),
            exchange_cooldown_secs: default_exchange_cooldown(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombatConfig {
    /// Seconds between two attacks; also the unit of the attack bonus.
    #[serde(default = "default_resting_time")]
    pub resting_time_secs: u64,
}

fn default_resting_time() -> u64 {
    30
}

impl Default for CombatConfig {
    fn default() -> Self {
        Self {
            resting_time_secs: default_resting_time(),
        }
    }
}

/// Cadence of one world event. `period_mins` alone gives a fixed period; adding
/// `std_dev_mins` redraws every interval from a normal distribution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CadenceConfig {
    pub period_mins: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub std_dev_mins: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_choir")]
    pub choir: CadenceConfig,
    #[serde(default = "default_curse")]
    pub curse: CadenceConfig,
    #[serde(default = "default_voice_shuffle")]
    pub voice_shuffle: CadenceConfig,
    #[serde(default = "default_amphetamine")]
    pub amphetamine: CadenceConfig,
    #[serde(default = "default_tunnel")]
    pub tunnel: CadenceConfig,
    #[serde(default = "default_musical")]
    pub musical: CadenceConfig,
}

fn fixed(period_mins: f64) -> CadenceConfig {
    CadenceConfig {
        period_mins,
        std_dev_mins: None,
    }
}
fn jittered(period_mins: f64, std_dev_mins: f64) -> CadenceConfig {
    CadenceConfig {
        period_mins,
        std_dev_mins: Some(std_dev_mins),
    }
}
fn default_choir() -> CadenceConfig {
    fixed(24.0 * 60.0)
}
fn default_curse() -> CadenceConfig {
    fixed(24.0 * 60.0)
}
fn default_voice_shuffle() -> CadenceConfig {
    jittered(180.0, 60.0)
}
fn default_amphetamine() -> CadenceConfig {
    jittered(240.0, 60.0)
}
fn default_tunnel() -> CadenceConfig {
    jittered(150.0, 45.0)
}
fn default_musical() -> CadenceConfig {
    jittered(300.0, 90.0)
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            choir: default_choir(),
            curse: default_curse(),
            voice_shuffle: default_voice_shuffle(),
            amphetamine: default_amphetamine(),
            tunnel: default_tunnel(),
            musical: default_musical(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallConfig {
    /// When false, bans only live in process memory.
    #[serde(default)]
    pub enabled: bool,
    /// Executable managing the kernel ban set.
    #[serde(default = "default_ipset")]
    pub command: String,
    #[serde(default = "default_ipset_set")]
    pub set_name: String,
    #[serde(default = "default_firewall_timeout")]
    pub timeout_secs: u64,
}

fn default_ipset() -> String {
    "ipset".to_string()
}
fn default_ipset_set() -> String {
    "voxroom_ban".to_string()
}
fn default_firewall_timeout() -> u64 {
    5
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: default_ipset(),
            set_name: default_ipset_set(),
            timeout_secs: default_firewall_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendererConfig {
    /// Program producing raw 16-bit mono PCM on stdout for the text written to its stdin.
    /// Unset means text-only chat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_render_timeout")]
    pub timeout_secs: u64,
}

fn default_sample_rate() -> u32 {
    16_000
}
fn default_render_timeout() -> u64 {
    10
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            sample_rate: default_sample_rate(),
            timeout_secs: default_render_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub security_file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
            security_file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;
        config.validate()?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.flood.window_secs == 0 || self.flood.messages_per_sec == 0 {
            return Err(anyhow!("flood window and rate must be non-zero"));
        }
        if self.server.backlog_size == 0 {
            return Err(anyhow!("backlog_size must be at least 1"));
        }
        for pattern in &self.moderation.banned_words {
            Regex::new(pattern).map_err(|e| anyhow!("Invalid banned word '{}': {}", pattern, e))?;
        }
        for (name, cadence) in self.events.cadences() {
            if cadence.period_mins <= 0.0 {
                return Err(anyhow!("event '{}' needs a positive period", name));
            }
        }
        Ok(())
    }
}

impl EventsConfig {
    /// Named cadences in registration order.
    pub fn cadences(&self) -> [(&'static str, &CadenceConfig); 6] {
        [
            ("choir", &self.choir),
            ("curse", &self.curse),
            ("voice_shuffle", &self.voice_shuffle),
            ("amphetamine", &self.amphetamine),
            ("tunnel", &self.tunnel),
            ("musical", &self.musical),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.trash_channel, "cancer");
        assert_eq!(config.flood.threshold(), 12);
        assert_eq!(config.server.backlog_size, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [flood]
            window_secs = 10

            [privileges]
            moderators = ["tok"]
            "#,
        )
        .unwrap();
        assert_eq!(config.flood.window_secs, 10);
        assert_eq!(config.flood.messages_per_sec, 3);
        assert_eq!(config.privileges.moderators, vec!["tok".to_string()]);
        assert!(config.privileges.militia.is_empty());
    }

    #[test]
    fn test_invalid_banned_word_is_rejected() {
        let mut config = Config::default();
        config.moderation.banned_words.push("(unclosed".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cadence_serde() {
        let config: EventsConfig = toml::from_str(
            r#"
            [tunnel]
            period_mins = 10.0
            std_dev_mins = 2.0
            "#,
        )
        .unwrap();
        assert_eq!(config.tunnel, jittered(10.0, 2.0));
        assert_eq!(config.choir, default_choir());
    }

    #[tokio::test]
    async fn test_create_default_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();
        Config::create_default(path).await.unwrap();
        let loaded = Config::load(path).await.unwrap();
        assert_eq!(loaded.server.bind, default_bind());
        assert_eq!(loaded.events.voice_shuffle, default_voice_shuffle());
    }
}
