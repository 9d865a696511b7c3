//! Load config from file and environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use pairlink_core::{ManagerConfig, ProtocolMode, Role};
use serde::{Deserialize, Deserializer};

/// Daemon configuration. File: `--config PATH`, ~/.config/pairlink/config.toml or
/// /etc/pairlink/config.toml. Env overrides: PAIRLINK_ROLE, PAIRLINK_PEER_ADDR,
/// PAIRLINK_LISTEN_PORT, PAIRLINK_LOG_DIR, PAIRLINK_INBOX_DIR, PAIRLINK_LOG_PULL_DEADLINE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// `phone` listens for the link, `watch` dials it (default phone).
    #[serde(default = "default_role", deserialize_with = "de_role")]
    pub role: Role,
    /// Phone side listen port (default 45690).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Watch side dial address (default 127.0.0.1:45690).
    #[serde(default = "default_peer_addr")]
    pub peer_addr: SocketAddr,
    /// Rotating log directory. Default: ~/.local/share/pairlink/<role>/logs.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Where received files are stored. Default: `inbox` under the log directory.
    #[serde(default)]
    pub inbox_dir: Option<PathBuf>,
    #[serde(default = "default_log_pull_deadline_secs")]
    pub log_pull_deadline_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
    #[serde(default = "default_max_log_file_bytes")]
    pub max_log_file_bytes: u64,
    /// Panic on malformed replies instead of failing the request.
    #[serde(default)]
    pub strict_protocol: bool,
    /// Phone side: pull the watch's logs every time the link activates.
    #[serde(default)]
    pub prime_log_pull: bool,
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
}

fn default_role() -> Role {
    Role::Phone
}
fn default_listen_port() -> u16 {
    45690
}
fn default_peer_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], default_listen_port()))
}
fn default_log_pull_deadline_secs() -> u64 {
    pairlink_core::DEFAULT_LOG_PULL_DEADLINE_TICKS
}
fn default_request_timeout_secs() -> u64 {
    pairlink_core::DEFAULT_REQUEST_TIMEOUT_TICKS
}
fn default_max_log_files() -> usize {
    10
}
fn default_max_log_file_bytes() -> u64 {
    1_000_000
}
fn default_reconnect_interval_secs() -> u64 {
    2
}

fn de_role<'de, D: Deserializer<'de>>(d: D) -> Result<Role, D::Error> {
    let s = String::deserialize(d)?;
    s.parse().map_err(serde::de::Error::custom)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: default_role(),
            listen_port: default_listen_port(),
            peer_addr: default_peer_addr(),
            log_dir: None,
            inbox_dir: None,
            log_pull_deadline_secs: default_log_pull_deadline_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            max_log_files: default_max_log_files(),
            max_log_file_bytes: default_max_log_file_bytes(),
            strict_protocol: false,
            prime_log_pull: false,
            reconnect_interval_secs: default_reconnect_interval_secs(),
        }
    }
}

impl Config {
    /// Configured log directory, or the per-role default.
    pub fn log_dir(&self) -> PathBuf {
        if let Some(dir) = &self.log_dir {
            return dir.clone();
        }
        let base = std::env::var_os("HOME")
            .map(|h| PathBuf::from(h).join(".local/share/pairlink"))
            .unwrap_or_else(|| PathBuf::from("pairlink-data"));
        base.join(self.role.as_str()).join("logs")
    }

    pub fn inbox_dir(&self) -> PathBuf {
        match &self.inbox_dir {
            Some(dir) => dir.clone(),
            None => self.log_dir().join("inbox"),
        }
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs.max(1))
    }

    /// Subset handed to the core. The host ticks once per second, so seconds are ticks.
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            request_timeout_ticks: self.request_timeout_secs,
            log_pull_deadline_ticks: self.log_pull_deadline_secs,
            protocol_mode: if self.strict_protocol {
                ProtocolMode::Strict
            } else {
                ProtocolMode::Lenient
            },
            prime_log_pull: self.prime_log_pull,
            ..ManagerConfig::default()
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
/// An explicit `--config` path must exist and parse; default locations are best effort.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok())?;
    Ok(c)
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/pairlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/pairlink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match read_file(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(error = %format!("{:#}", e), "ignoring config file");
            None
        }
    }
}

/// Env overrides. Malformed numbers and addresses are errors, not silently ignored.
fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
    if let Some(s) = var("PAIRLINK_ROLE") {
        c.role = s.parse().context("PAIRLINK_ROLE")?;
    }
    if let Some(s) = var("PAIRLINK_PEER_ADDR") {
        c.peer_addr = s.parse().context("PAIRLINK_PEER_ADDR")?;
    }
    if let Some(s) = var("PAIRLINK_LISTEN_PORT") {
        c.listen_port = s.parse().context("PAIRLINK_LISTEN_PORT")?;
    }
    if let Some(s) = var("PAIRLINK_LOG_DIR") {
        c.log_dir = Some(PathBuf::from(s));
    }
    if let Some(s) = var("PAIRLINK_INBOX_DIR") {
        c.inbox_dir = Some(PathBuf::from(s));
    }
    if let Some(s) = var("PAIRLINK_LOG_PULL_DEADLINE") {
        c.log_pull_deadline_secs = s.parse().context("PAIRLINK_LOG_PULL_DEADLINE")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.role, Role::Phone);
        assert_eq!(c.listen_port, 45690);
        assert_eq!(c.peer_addr, "127.0.0.1:45690".parse().unwrap());
        assert_eq!(c.log_pull_deadline_secs, 20);
        assert_eq!(c.max_log_files, 10);
        assert_eq!(c.max_log_file_bytes, 1_000_000);
        assert_eq!(c.manager_config().protocol_mode, ProtocolMode::Lenient);
    }

    #[test]
    fn file_overrides_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "role = \"watch\"\nlog_pull_deadline_secs = 5\nstrict_protocol = true").unwrap();
        let c = read_file(f.path()).unwrap();
        assert_eq!(c.role, Role::Watch);
        assert_eq!(c.listen_port, 45690);
        let m = c.manager_config();
        assert_eq!(m.log_pull_deadline_ticks, 5);
        assert_eq!(m.protocol_mode, ProtocolMode::Strict);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "proxy_port = 3128").unwrap();
        assert!(read_file(f.path()).is_err());
    }

    #[test]
    fn bad_role_is_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "role = \"tablet\"").unwrap();
        assert!(read_file(f.path()).is_err());
    }

    #[test]
    fn explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn env_wins_over_file() {
        let mut c = Config::default();
        apply_env(
            &mut c,
            env(&[
                ("PAIRLINK_ROLE", "watch"),
                ("PAIRLINK_PEER_ADDR", "10.0.0.2:5000"),
                ("PAIRLINK_LOG_DIR", "/var/tmp/pl"),
                ("PAIRLINK_LOG_PULL_DEADLINE", "7"),
            ]),
        )
        .unwrap();
        assert_eq!(c.role, Role::Watch);
        assert_eq!(c.peer_addr.port(), 5000);
        assert_eq!(c.log_dir(), PathBuf::from("/var/tmp/pl"));
        assert_eq!(c.log_pull_deadline_secs, 7);
    }

    #[test]
    fn malformed_env_is_error() {
        let mut c = Config::default();
        assert!(apply_env(&mut c, env(&[("PAIRLINK_LISTEN_PORT", "lots")])).is_err());
    }

    #[test]
    fn inbox_stays_inside_configured_log_dir() {
        let mut c = Config {
            log_dir: Some(PathBuf::from("/var/tmp/pl")),
            ..Config::default()
        };
        assert_eq!(c.inbox_dir(), PathBuf::from("/var/tmp/pl/inbox"));
        apply_env(&mut c, env(&[("PAIRLINK_INBOX_DIR", "/srv/pl-inbox")])).unwrap();
        assert_eq!(c.inbox_dir(), PathBuf::from("/srv/pl-inbox"));
    }

    #[test]
    fn default_log_dir_is_per_role() {
        let c = Config {
            role: Role::Watch,
            ..Config::default()
        };
        assert!(c.log_dir().ends_with("watch/logs"));
    }
}
