use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::bore::tunnel::{CONTROL_PORT, pending::PENDING_TIMEOUT, server::HEARTBEAT_INTERVAL};

const CONFIG_ENV: &str = "BORE_CONFIG";
const CANDIDATES: [&str; 3] = ["bore.toml", "bore.yaml", "bore.yml"];

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    User,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::User => write!(f, "user"),
        }
    }
}

/// Finds the config file, if any: `--config`, then `BORE_CONFIG`, then
/// `bore.{toml,yaml,yml}` in the working directory, then the per-user config
/// directory. No file at all is fine; built-in defaults apply.
pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<Option<ResolvedConfigPath>> {
    if let Some(p) = explicit_flag_path {
        if p.as_os_str().is_empty() {
            anyhow::bail!("config: empty config path");
        }
        return Ok(Some(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        }));
    }

    // clap already maps BORE_CONFIG into the flag value, but the env var is
    // still honored when the CLI is bypassed.
    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            return Ok(Some(ResolvedConfigPath {
                path: PathBuf::from(p),
                source: ConfigPathSource::Env,
            }));
        }
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(Some(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        }));
    }

    if let Some(proj) = ProjectDirs::from("", "", "bore") {
        if let Some(p) = discover_config_path(proj.config_dir()) {
            return Ok(Some(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::User,
            }));
        }
    }

    Ok(None)
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    CANDIDATES
        .iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).is_ok_and(|m| m.is_file()))
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    parse_config(&s, &ext).with_context(|| format!("parse {}", path.display()))
}

fn parse_config(s: &str, ext: &str) -> anyhow::Result<Config> {
    let fc: FileConfig = match ext {
        "toml" => toml::from_str(s)?,
        "yaml" | "yml" => serde_yaml::from_str(s)?,
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            ext
        ),
    };
    Ok(Config::from_file_config(fc))
}

#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    /// Diagnostics HTTP endpoint; empty disables it.
    pub debug_addr: String,
    pub server: ServerConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub min_port: u16,
    pub secret: String,
    pub bind_addr: String,
    pub control_port: u16,
    pub heartbeat_interval: Duration,
    pub pending_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub local_host: String,
    pub secret: String,
    pub control_port: u16,
    pub local_dial_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                output: "stderr".into(),
                add_source: false,
            },
            debug_addr: String::new(),
            server: ServerConfig {
                min_port: 1023,
                secret: String::new(),
                bind_addr: "0.0.0.0".into(),
                control_port: CONTROL_PORT,
                heartbeat_interval: HEARTBEAT_INTERVAL,
                pending_timeout: PENDING_TIMEOUT,
            },
            client: ClientConfig {
                local_host: "localhost".into(),
                secret: String::new(),
                control_port: CONTROL_PORT,
                local_dial_timeout: Duration::from_secs(3),
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    logging: Option<FileLogging>,
    debug_addr: Option<String>,
    server: Option<FileServer>,
    client: Option<FileClient>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    min_port: Option<u16>,
    secret: Option<String>,
    bind_addr: Option<String>,
    control_port: Option<u16>,
    heartbeat_interval_ms: Option<i64>,
    pending_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    local_host: Option<String>,
    secret: Option<String>,
    control_port: Option<u16>,
    local_dial_timeout_ms: Option<i64>,
}

/// Trimmed, non-empty override.
fn non_empty(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Positive millisecond override; zero or negative keeps the default.
fn millis(v: Option<i64>) -> Option<Duration> {
    v.filter(|ms| *ms > 0)
        .map(|ms| Duration::from_millis(ms as u64))
}

impl Config {
    fn from_file_config(fc: FileConfig) -> Config {
        let mut cfg = Config::default();

        if let Some(addr) = non_empty(&fc.debug_addr) {
            cfg.debug_addr = addr;
        }

        // --- Logging ---
        if let Some(l) = &fc.logging {
            if let Some(level) = non_empty(&l.level) {
                cfg.logging.level = level;
            }
            if let Some(fmt) = non_empty(&l.format) {
                cfg.logging.format = fmt;
            }
            if let Some(out) = non_empty(&l.output) {
                cfg.logging.output = out;
            }
            cfg.logging.add_source = l.add_source;
        }

        // --- Server ---
        if let Some(s) = &fc.server {
            if let Some(p) = s.min_port {
                cfg.server.min_port = p;
            }
            if let Some(secret) = &s.secret {
                cfg.server.secret = secret.clone();
            }
            if let Some(addr) = non_empty(&s.bind_addr) {
                cfg.server.bind_addr = addr;
            }
            if let Some(p) = s.control_port {
                cfg.server.control_port = p;
            }
            if let Some(d) = millis(s.heartbeat_interval_ms) {
                cfg.server.heartbeat_interval = d;
            }
            if let Some(d) = millis(s.pending_timeout_ms) {
                cfg.server.pending_timeout = d;
            }
        }

        // --- Client ---
        if let Some(c) = &fc.client {
            if let Some(host) = non_empty(&c.local_host) {
                cfg.client.local_host = host;
            }
            if let Some(secret) = &c.secret {
                cfg.client.secret = secret.clone();
            }
            if let Some(p) = c.control_port {
                cfg.client.control_port = p;
            }
            if let Some(d) = millis(c.local_dial_timeout_ms) {
                cfg.client.local_dial_timeout = d;
            }
        }

        cfg
    }
}
