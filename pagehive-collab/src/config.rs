//! Server configuration, loaded from the process environment.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Secrets shorter than this are accepted but logged as weak.
pub const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable(s): {}", .0.join(", "))]
    Missing(Vec<String>),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// HS256 signing secret shared with the HTTP auth layer
    pub jwt_secret: String,
    /// RocksDB directory (None = in-memory store)
    pub storage_path: Option<PathBuf>,
    /// JSON file of users and pages applied to the store at startup
    pub seed_path: Option<PathBuf>,
    /// Per-connection outbound queue length
    pub outbound_capacity: usize,
    /// 0 = unlimited
    pub max_members_per_room: usize,
    /// Upgrade + identity lookup deadline
    pub auth_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3001".to_string(),
            jwt_secret: String::new(),
            storage_path: None,
            seed_path: None,
            outbound_capacity: 256,
            max_members_per_room: 100,
            auth_timeout: Duration::from_secs(10),
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("jwt_secret", &"<redacted>")
            .field("storage_path", &self.storage_path)
            .field("seed_path", &self.seed_path)
            .field("outbound_capacity", &self.outbound_capacity)
            .field("max_members_per_room", &self.max_members_per_room)
            .field("auth_timeout", &self.auth_timeout)
            .finish()
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let Some(jwt_secret) = get("JWT_SECRET") else {
            return Err(ConfigError::Missing(vec!["JWT_SECRET".to_string()]));
        };
        if jwt_secret.len() < MIN_SECRET_LEN {
            log::warn!("JWT_SECRET is shorter than {MIN_SECRET_LEN} bytes");
        }

        let bind_addr = match (get("PAGEHIVE_BIND"), get("PORT")) {
            (Some(addr), _) => addr,
            (None, Some(port)) => {
                let port: u16 = parse("PORT", &port)?;
                format!("0.0.0.0:{port}")
            }
            (None, None) => defaults.bind_addr,
        };

        let storage_path = match get("PAGEHIVE_STORAGE_PATH") {
            Some(path) => Some(PathBuf::from(path)),
            None => get("DATABASE_URL").map(|url| storage_path_from_url(&url)).transpose()?,
        };
        let seed_path = get("PAGEHIVE_SEED").map(PathBuf::from);

        let outbound_capacity = match get("PAGEHIVE_OUTBOUND_CAPACITY") {
            Some(v) => positive("PAGEHIVE_OUTBOUND_CAPACITY", &v)?,
            None => defaults.outbound_capacity,
        };
        let max_members_per_room = match get("PAGEHIVE_MAX_MEMBERS_PER_ROOM") {
            Some(v) => parse("PAGEHIVE_MAX_MEMBERS_PER_ROOM", &v)?,
            None => defaults.max_members_per_room,
        };
        let auth_timeout = match get("PAGEHIVE_AUTH_TIMEOUT_SECS") {
            Some(v) => Duration::from_secs(positive("PAGEHIVE_AUTH_TIMEOUT_SECS", &v)? as u64),
            None => defaults.auth_timeout,
        };

        Ok(Self {
            bind_addr,
            jwt_secret,
            storage_path,
            seed_path,
            outbound_capacity,
            max_members_per_room,
            auth_timeout,
        })
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn positive(key: &str, value: &str) -> Result<usize, ConfigError> {
    match parse::<usize>(key, value)? {
        0 => Err(ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        }),
        n => Ok(n),
    }
}

/// `DATABASE_URL` may be a bare path or a `file:` URL. Network databases are
/// not something this process can open.
fn storage_path_from_url(url: &str) -> Result<PathBuf, ConfigError> {
    if let Some(path) = url.strip_prefix("file://").or_else(|| url.strip_prefix("file:")) {
        return Ok(PathBuf::from(path));
    }
    if url.contains("://") {
        return Err(ConfigError::Invalid {
            key: "DATABASE_URL".to_string(),
            value: url.to_string(),
            reason: "only filesystem paths and file: URLs are supported".to_string(),
        });
    }
    Ok(PathBuf::from(url))
}
