//! Kernel-level bans.
//!
//! Banned addresses are pushed to an ipset with its own timeout so the kernel drops
//! their traffic before it reaches the listener. A firewall failure never undoes the
//! in-process ban.

use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use super::ban::BanTier;
use crate::config::FirewallConfig;

#[derive(Debug, thiserror::Error)]
pub enum FirewallError {
    #[error("failed to run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{command}' timed out")]
    Timeout { command: String },
    #[error("'{command}' exited with {status}")]
    Failed { command: String, status: std::process::ExitStatus },
}

/// One ban to mirror in the firewall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRequest {
    pub addresses: Vec<IpAddr>,
    pub tier: BanTier,
    pub duration: Duration,
}

#[async_trait]
pub trait Firewall: Send + Sync {
    async fn apply_ban(&self, addresses: &[IpAddr], tier: BanTier, duration: Duration) -> Result<(), FirewallError>;

    /// Probe run once at startup.
    async fn test_available(&self) -> Result<(), FirewallError>;
}

/// Bans stay in process memory only.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledFirewall;

#[async_trait]
impl Firewall for DisabledFirewall {
    async fn apply_ban(&self, _addresses: &[IpAddr], _tier: BanTier, _duration: Duration) -> Result<(), FirewallError> {
        Ok(())
    }

    async fn test_available(&self) -> Result<(), FirewallError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct IpsetFirewall {
    command: String,
    set_name: String,
    timeout: Duration,
}

impl IpsetFirewall {
    pub fn new(config: &FirewallConfig) -> Self {
        Self {
            command: config.command.clone(),
            set_name: config.set_name.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }
    }

    fn add_args(&self, addr: IpAddr, duration: Duration) -> Vec<String> {
        vec![
            "add".into(),
            self.set_name.clone(),
            addr.to_string(),
            "timeout".into(),
            duration.as_secs().max(1).to_string(),
            "-exist".into(),
        ]
    }

    async fn run(&self, args: Vec<String>) -> Result<(), FirewallError> {
        debug!("firewall: {} {}", self.command, args.join(" "));
        let child = Command::new(&self.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        let status = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| FirewallError::Timeout {
                command: self.command.clone(),
            })?
            .map_err(|source| FirewallError::Spawn {
                command: self.command.clone(),
                source,
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(FirewallError::Failed {
                command: self.command.clone(),
                status,
            })
        }
    }
}

#[async_trait]
impl Firewall for IpsetFirewall {
    async fn apply_ban(&self, addresses: &[IpAddr], tier: BanTier, duration: Duration) -> Result<(), FirewallError> {
        // only full bans are enforced at the network level
        if tier != BanTier::Ban {
            return Ok(());
        }
        for addr in addresses {
            self.run(self.add_args(*addr, duration)).await?;
        }
        Ok(())
    }

    async fn test_available(&self) -> Result<(), FirewallError> {
        self.run(vec!["list".into(), self.set_name.clone(), "-name".into()]).await
    }
}

pub fn from_config(config: &FirewallConfig) -> std::sync::Arc<dyn Firewall> {
    if config.enabled {
        std::sync::Arc::new(IpsetFirewall::new(config))
    } else {
        std::sync::Arc::new(DisabledFirewall)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipset_add_arguments() {
        let fw = IpsetFirewall::new(&FirewallConfig::default());
        let args = fw.add_args("10.1.2.3".parse().unwrap(), Duration::from_secs(600));
        assert_eq!(args, vec!["add", "voxroom_ban", "10.1.2.3", "timeout", "600", "-exist"]);
    }

    #[tokio::test]
    async fn missing_command_is_an_error() {
        let fw = IpsetFirewall::new(&FirewallConfig {
            enabled: true,
            command: "/nonexistent/voxroom-ipset".into(),
            ..FirewallConfig::default()
        });
        let err = fw.test_available().await.unwrap_err();
        assert!(matches!(err, FirewallError::Spawn { .. }));
    }

    #[tokio::test]
    async fn other_tiers_are_not_mirrored() {
        let fw = IpsetFirewall::new(&FirewallConfig {
            enabled: true,
            command: "/nonexistent/voxroom-ipset".into(),
            ..FirewallConfig::default()
        });
        tokio_test::assert_ok!(
            fw.apply_ban(&["10.0.0.1".parse().unwrap()], BanTier::Shadowban, Duration::from_secs(5))
                .await
        );
    }
}
