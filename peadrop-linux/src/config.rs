//! Load config from file and environment.

use std::path::PathBuf;
use std::time::Duration;

use peadrop_core::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_JOBS, DEFAULT_PORT, MAX_PAYLOAD_LEN};
use serde::Deserialize;

use crate::engine::EngineSettings;

/// Host configuration. File: ~/.config/peadrop/config.toml or /etc/peadrop/config.toml.
/// Env overrides: PEADROP_PORT, PEADROP_ID, PEADROP_RECV_DIR, PEADROP_MAX_JOBS.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// TCP and UDP port (default 52637).
    pub port: u16,
    /// Identity shown to peers.
    pub identity: String,
    /// Where accepted transfers land.
    pub receive_dir: PathBuf,
    pub max_jobs: usize,
    pub chunk_size: usize,
    pub idle_timeout_secs: u64,
    /// How long a probe waits for replies.
    pub probe_window_ms: u64,
    pub push_interval_ms: u64,
}

fn default_identity() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("peadrop-{}", &uuid[..8])
}

fn default_receive_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join("Downloads/peadrop"),
        None => PathBuf::from("peadrop-received"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            identity: default_identity(),
            receive_dir: default_receive_dir(),
            max_jobs: DEFAULT_MAX_JOBS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            idle_timeout_secs: 30,
            probe_window_ms: 2000,
            push_interval_ms: 500,
        }
    }
}

impl Config {
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            port: self.port,
            max_jobs: self.max_jobs.max(1),
            chunk_size: self.chunk_size.clamp(1, MAX_PAYLOAD_LEN as usize),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs.max(1)),
            push_interval: Duration::from_millis(self.push_interval_ms.max(10)),
        }
    }

    pub fn probe_window(&self) -> Duration {
        Duration::from_millis(self.probe_window_ms)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(p) = var("PEADROP_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.port = p;
        }
        if let Some(id) = var("PEADROP_ID").filter(|s| !s.trim().is_empty()) {
            self.identity = id;
        }
        if let Some(dir) = var("PEADROP_RECV_DIR").filter(|s| !s.is_empty()) {
            self.receive_dir = PathBuf::from(dir);
        }
        if let Some(n) = var("PEADROP_MAX_JOBS").and_then(|s| s.parse::<usize>().ok()) {
            self.max_jobs = n;
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(h) = std::env::var_os("HOME") {
        out.push(PathBuf::from(h).join(".config/peadrop/config.toml"));
    }
    out.push(PathBuf::from("/etc/peadrop/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    let text = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read config");
            return None;
        }
    };
    match toml::from_str::<Config>(&text) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring invalid config");
            None
        }
    }
}
