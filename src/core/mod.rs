/// Core abstractions shared by the pool, the monitor and the dispatcher
pub mod codec;
pub mod connection;
pub mod pool;
pub mod preference;

#[cfg(test)]
pub(crate) mod mock;

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant, SystemTime};

pub use preference::{Preference, ReadPreferenceMode, TagSet};

/// Port used when a host is given without one
pub const DEFAULT_PORT: u16 = 27017;

/// One server address. Identity is the (host, port) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    /// Parse `host`, `host:port` or `[ipv6]:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ConfigError::invalid_host(s, "host cannot be empty"));
        }

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let end = rest
                .find(']')
                .ok_or_else(|| ConfigError::invalid_host(s, "unterminated IPv6 literal"))?;
            let host = &rest[..end];
            match &rest[end + 1..] {
                "" => (host, None),
                tail => match tail.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => return Err(ConfigError::invalid_host(s, "unexpected characters after IPv6 literal")),
                },
            }
        } else {
            match s.rsplit_once(':') {
                Some((host, _)) if host.contains(':') => {
                    return Err(ConfigError::invalid_host(s, "IPv6 addresses must be enclosed in brackets"))
                }
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        };

        if host.is_empty() {
            return Err(ConfigError::invalid_host(s, "host cannot be empty"));
        }

        let port = match port {
            None => DEFAULT_PORT,
            Some(port) => match port.parse::<u16>() {
                Ok(0) | Err(_) => {
                    return Err(ConfigError::invalid_host(s, "port must be between 1 and 65535"))
                }
                Ok(port) => port,
            },
        };

        Ok(Endpoint::new(host, port))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

/// Classification of an endpoint as last observed by the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerRole {
    Unknown,
    Primary,
    Secondary,
    Down,
}

impl ServerRole {
    /// Primaries and secondaries can serve commands
    pub fn is_data_bearing(&self) -> bool {
        matches!(self, ServerRole::Primary | ServerRole::Secondary)
    }
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerRole::Unknown => write!(f, "Unknown"),
            ServerRole::Primary => write!(f, "Primary"),
            ServerRole::Secondary => write!(f, "Secondary"),
            ServerRole::Down => write!(f, "Down"),
        }
    }
}

/// What the monitor knows about one endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointState {
    pub endpoint: Endpoint,
    pub role: ServerRole,
    /// Exponentially weighted moving average of heartbeat round trips
    pub round_trip_time: Option<Duration>,
    pub last_heartbeat_at: Option<Instant>,
    pub consecutive_failures: u32,
    /// Tags advertised by the server in its `hello` reply
    pub tags: BTreeMap<String, String>,
    /// `lastWrite.lastWriteDate` from the last `hello`, used for staleness
    pub last_write_date: Option<SystemTime>,
}

impl EndpointState {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            role: ServerRole::Unknown,
            round_trip_time: None,
            last_heartbeat_at: None,
            consecutive_failures: 0,
            tags: BTreeMap::new(),
            last_write_date: None,
        }
    }

    /// Build a known state directly, mostly useful for tests and tooling
    pub fn with_role(endpoint: Endpoint, role: ServerRole, round_trip_time: Duration) -> Self {
        Self {
            role,
            round_trip_time: Some(round_trip_time),
            ..Self::new(endpoint)
        }
    }

    pub fn with_tags<I, K, V>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.tags = tags.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    /// True when every pair of `tag_set` appears in this endpoint's tags
    pub fn matches_tags(&self, tag_set: &TagSet) -> bool {
        tag_set
            .iter()
            .all(|(k, v)| self.tags.get(k).map(|t| t == v).unwrap_or(false))
    }
}
