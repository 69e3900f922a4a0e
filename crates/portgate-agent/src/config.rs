//! Agent configuration
//!
//! Loaded from YAML:
//!
//! ```yaml
//! allowed_ports:
//!   - name: web
//!     target: "10.0.0.5:80"
//!     static: true
//!     local_port: 8080
//! max_streams: 100
//! idle_timeout: 5m
//! connect_timeout: 10s
//! metrics_port: 9100
//! ```

use crate::error::{AgentError, Result};
use portgate_proto::PortConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Server agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Targets clients may ask the agent to dial
    pub allowed_ports: Vec<PortConfig>,
    /// Concurrent streams admitted per session
    #[serde(deserialize_with = "stream_limit")]
    pub max_streams: usize,
    /// Deadline for the first message on a new stream
    #[serde(with = "duration")]
    pub idle_timeout: Duration,
    /// Deadline for dialing a target
    #[serde(with = "duration")]
    pub connect_timeout: Duration,
    /// Local metrics endpoint port, 0 disables it
    pub metrics_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            allowed_ports: Vec::new(),
            max_streams: 100,
            idle_timeout: Duration::from_secs(5 * 60),
            connect_timeout: Duration::from_secs(10),
            metrics_port: 0,
        }
    }
}

impl ServerConfig {
    /// Parse a YAML document; missing keys keep their defaults
    pub fn from_yaml(text: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Load `path`, falling back to the same relative path next to the
    /// running executable. Returns the config and the file it came from.
    pub fn load(path: &Path) -> Result<(Self, PathBuf)> {
        let mut candidates = vec![path.to_path_buf()];
        if path.is_relative() {
            if let Some(exe_dir) = std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_path_buf))
            {
                candidates.push(exe_dir.join(path));
            }
        }

        let mut last_error = None;
        for candidate in candidates {
            match std::fs::read_to_string(&candidate) {
                Ok(text) => {
                    let config = Self::from_yaml(&text).map_err(|source| AgentError::ConfigParse {
                        path: candidate.clone(),
                        source,
                    })?;
                    return Ok((config, candidate));
                }
                Err(source) => {
                    last_error = Some(AgentError::ConfigRead {
                        path: candidate,
                        source,
                    })
                }
            }
        }

        Err(last_error.unwrap_or_else(|| AgentError::ConfigRead {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no candidate paths"),
        }))
    }

    /// Like [`ServerConfig::load`], but a missing or broken file only warns
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok((config, source)) => {
                info!(
                    "Loaded config from {} ({} allowed targets)",
                    source.display(),
                    config.allowed_ports.len()
                );
                config
            }
            Err(e) => {
                warn!("{}. Using defaults.", e);
                Self::default()
            }
        }
    }
}

fn stream_limit<'de, D>(deserializer: D) -> std::result::Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let limit = usize::deserialize(deserializer)?;
    if limit > tokio::sync::Semaphore::MAX_PERMITS {
        return Err(serde::de::Error::custom(format!(
            "max_streams {} exceeds {}",
            limit,
            tokio::sync::Semaphore::MAX_PERMITS
        )));
    }
    Ok(limit)
}

/// Durations as integer seconds or strings like `500ms`, `10s`, `5m`, `1h30m`
mod duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis();
        let text = if millis % 3_600_000 == 0 && millis > 0 {
            format!("{}h", millis / 3_600_000)
        } else if millis % 60_000 == 0 && millis > 0 {
            format!("{}m", millis / 60_000)
        } else if millis % 1000 == 0 {
            format!("{}s", millis / 1000)
        } else {
            format!("{}ms", millis)
        };
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse(&text).map_err(serde::de::Error::custom),
        }
    }

    pub(super) fn parse(text: &str) -> Result<Duration, String> {
        let text = text.trim();
        if text.is_empty() {
            return Err("empty duration".to_string());
        }
        if let Ok(secs) = text.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        let mut total = Duration::ZERO;
        let mut rest = text;
        while !rest.is_empty() {
            let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
            if digits == 0 {
                return Err(format!("invalid duration: {}", text));
            }
            let value: u64 = rest[..digits]
                .parse()
                .map_err(|_| format!("invalid duration: {}", text))?;
            rest = &rest[digits..];

            let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
            let secs_per_unit = match &rest[..unit_len] {
                "ms" => None,
                "s" => Some(1),
                "m" => Some(60),
                "h" => Some(3600),
                other => return Err(format!("unknown duration unit '{}' in {}", other, text)),
            };
            let unit = match secs_per_unit {
                None => Some(Duration::from_millis(value)),
                Some(scale) => value.checked_mul(scale).map(Duration::from_secs),
            };
            total = unit
                .and_then(|unit| total.checked_add(unit))
                .ok_or_else(|| format!("duration out of range: {}", text))?;
            rest = &rest[unit_len..];
        }
        Ok(total)
    }
}
