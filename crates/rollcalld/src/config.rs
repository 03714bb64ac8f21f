use chrono::NaiveTime;
use rollcall_core::ledger::default_late_cutoff;
use rollcall_core::matcher::DEFAULT_MATCH_THRESHOLD;
use rollcall_core::registry::DEFAULT_DESCRIPTOR_DIM;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BusKind {
    #[default]
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "session" => Ok(BusKind::Session),
            "system" => Ok(BusKind::System),
            other => Err(format!("unknown bus {other:?}")),
        }
    }
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BusKind::Session => "session",
            BusKind::System => "system",
        })
    }
}

/// Optional TOML file referenced by `ROLLCALL_CONFIG`. Environment variables win.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub db_path: Option<PathBuf>,
    pub match_threshold: Option<f32>,
    pub descriptor_dim: Option<usize>,
    pub late_cutoff: Option<String>,
    pub bus: Option<String>,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Exclusive L2 distance bound for a positive match.
    pub match_threshold: f32,
    /// Descriptor length expected from the extractor.
    pub descriptor_dim: usize,
    /// Arrivals strictly after this local time are marked late.
    pub late_cutoff: NaiveTime,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults,
    /// layered over the optional `ROLLCALL_CONFIG` TOML file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let file = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => load_file(&path)?,
            Err(_) => FileConfig::default(),
        };
        Ok(Self::resolve(file, |key| std::env::var(key).ok()))
    }

    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let db_path = env("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| default_data_dir(&env).join("attendance.db"));

        let late_cutoff = env("ROLLCALL_LATE_CUTOFF")
            .or(file.late_cutoff)
            .and_then(|raw| {
                let parsed = parse_cutoff(&raw);
                if parsed.is_none() {
                    tracing::warn!(value = %raw, "unparseable late cutoff; using default");
                }
                parsed
            })
            .unwrap_or_else(default_late_cutoff);

        Self {
            db_path,
            match_threshold: parsed(&env, "ROLLCALL_MATCH_THRESHOLD")
                .or(file.match_threshold)
                .unwrap_or(DEFAULT_MATCH_THRESHOLD),
            descriptor_dim: parsed(&env, "ROLLCALL_DESCRIPTOR_DIM")
                .or(file.descriptor_dim)
                .unwrap_or(DEFAULT_DESCRIPTOR_DIM),
            late_cutoff,
            bus: parsed(&env, "ROLLCALL_BUS")
                .or_else(|| file.bus.and_then(|b| b.parse().ok()))
                .unwrap_or_default(),
        }
    }
}

fn load_file(path: &str) -> Result<FileConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_string(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_string(),
        source,
    })
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn parsed<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    env(key).and_then(|v| v.trim().parse().ok())
}

/// Accepts `HH:MM` or `HH:MM:SS`.
pub fn parse_cutoff(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .ok()
}
