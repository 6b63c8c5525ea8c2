//! Load config from file and environment.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use m4t_core::wire::{CodecError, HeaderLayout, PayloadCodec, DEFAULT_BUFFER_SIZE};
use serde::Deserialize;
use tracing::warn;

/// Node configuration. File: ~/.config/m4t/config.toml or /etc/m4t/config.toml.
/// Env overrides: M4T_BIND_ADDRESS, M4T_HUB_PORT, M4T_BUFFER_SIZE, M4T_SESSION_TIMEOUT_SECS,
/// M4T_KEEP_ALIVE_SECS, M4T_WORKERS, M4T_QUEUE_DEPTH, M4T_LEGACY_HEADER.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Local address sockets bind to (default 0.0.0.0).
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// Hub listen port (default 4004; 0 picks any free port).
    #[serde(default = "default_hub_port")]
    pub hub_port: u16,
    /// Datagram budget in bytes, header included (default 800).
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Hub idle timeout and reaper period (default 300).
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    /// Peer keep-alive cadence (default 3).
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Hub worker count; unset means one per available core.
    #[serde(default)]
    pub workers: Option<usize>,
    /// Bounded worker queue depth (default 1024).
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Use the 2-byte header without a session discriminator.
    #[serde(default)]
    pub legacy_header: bool,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_hub_port() -> u16 {
    4004
}
fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}
fn default_session_timeout_secs() -> u64 {
    300
}
fn default_keep_alive_secs() -> u64 {
    3
}
fn default_queue_depth() -> usize {
    1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            hub_port: default_hub_port(),
            buffer_size: default_buffer_size(),
            session_timeout_secs: default_session_timeout_secs(),
            keep_alive_secs: default_keep_alive_secs(),
            workers: None,
            queue_depth: default_queue_depth(),
            legacy_header: false,
        }
    }
}

impl Config {
    pub fn codec(&self) -> Result<PayloadCodec, CodecError> {
        let layout = if self.legacy_header {
            HeaderLayout::Legacy
        } else {
            HeaderLayout::Session
        };
        PayloadCodec::new(layout, self.buffer_size)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs.max(1))
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(1))
    }

    pub fn worker_count(&self) -> usize {
        self.workers
            .filter(|&n| n > 0)
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(1)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

/// Apply `M4T_*` overrides from `lookup`. Unparseable values are ignored.
pub fn apply_env(c: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
        let raw = lookup(key)?;
        match raw.trim().parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparseable override");
                None
            }
        }
    }

    if let Some(v) = parsed(&lookup, "M4T_BIND_ADDRESS") {
        c.bind_address = v;
    }
    if let Some(v) = parsed(&lookup, "M4T_HUB_PORT") {
        c.hub_port = v;
    }
    if let Some(v) = parsed(&lookup, "M4T_BUFFER_SIZE") {
        c.buffer_size = v;
    }
    if let Some(v) = parsed(&lookup, "M4T_SESSION_TIMEOUT_SECS") {
        c.session_timeout_secs = v;
    }
    if let Some(v) = parsed(&lookup, "M4T_KEEP_ALIVE_SECS") {
        c.keep_alive_secs = v;
    }
    if let Some(v) = parsed(&lookup, "M4T_WORKERS") {
        c.workers = Some(v);
    }
    if let Some(v) = parsed(&lookup, "M4T_QUEUE_DEPTH") {
        c.queue_depth = v;
    }
    if let Some(v) = parsed(&lookup, "M4T_LEGACY_HEADER") {
        c.legacy_header = v;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/m4t/config.toml"));
    }
    out.push(PathBuf::from("/etc/m4t/config.toml"));
    out
}

/// First existing file wins; a file that fails to parse falls back to defaults.
fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    let s = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read config file");
            return None;
        }
    };
    match toml::from_str::<Config>(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "invalid config file, using defaults");
            None
        }
    }
}
