//! Server Configuration Module
//!
//! Configuration is loaded from environment variables with sensible
//! defaults for development.

use std::net::SocketAddr;

use freshet_core::{ConfigError, Sequence};

use crate::broadcaster::BroadcasterConfig;

/// Where the broadcaster starts counting for keys it has not seen yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceFloor {
    /// Wall clock in microseconds at startup. Keeps sequences above any
    /// issued by a previous run of the server.
    Clock,
    /// Start every key at zero.
    Zero,
}

impl SequenceFloor {
    pub fn resolve(self) -> Sequence {
        match self {
            Self::Clock => Sequence::from_clock(),
            Self::Zero => Sequence::ZERO,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind.
    pub bind_host: String,

    /// TCP port.
    pub port: u16,

    /// Per-session queue capacity before a session counts as lagging.
    pub session_queue_capacity: usize,

    /// Maximum concurrent WebSocket sessions (unset = unbounded).
    pub max_sessions: Option<usize>,

    pub sequence_floor: SequenceFloor,

    /// Allowed CORS origins. Empty means allow all origins (dev mode).
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: 3000,
            session_queue_capacity: 256,
            max_sessions: None,
            sequence_floor: SequenceFloor::Clock,
            cors_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Create ServerConfig from environment variables.
    ///
    /// Environment variables:
    /// - `FRESHET_BIND`: Interface to bind (default: 0.0.0.0)
    /// - `PORT`, else `FRESHET_PORT`: TCP port (default: 3000). `PORT` wins
    ///   when both are set, so a platform-assigned port overrides the
    ///   application setting
    /// - `FRESHET_SESSION_QUEUE`: Per-session queue capacity (default: 256)
    /// - `FRESHET_MAX_SESSIONS`: Session limit (default: unbounded)
    /// - `FRESHET_SEQUENCE_FLOOR`: "clock" or "zero" (default: clock)
    /// - `FRESHET_CORS_ORIGINS`: Comma-separated allowed origins (empty = allow all)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let bind_host = lookup("FRESHET_BIND").unwrap_or(defaults.bind_host);

        let port = match lookup("PORT").or_else(|| lookup("FRESHET_PORT")) {
            Some(value) => value.parse::<u16>().map_err(|_| ConfigError::InvalidValue {
                field: "port".to_string(),
                value: value.clone(),
                reason: "expected a TCP port number".to_string(),
            })?,
            None => defaults.port,
        };

        let session_queue_capacity = match lookup("FRESHET_SESSION_QUEUE") {
            Some(value) => match value.parse::<usize>() {
                Ok(capacity) if capacity > 0 => capacity,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        field: "session_queue_capacity".to_string(),
                        value,
                        reason: "expected a positive integer".to_string(),
                    })
                }
            },
            None => defaults.session_queue_capacity,
        };

        let max_sessions = match lookup("FRESHET_MAX_SESSIONS") {
            Some(value) => match value.parse::<usize>() {
                Ok(max) if max > 0 => Some(max),
                _ => {
                    return Err(ConfigError::InvalidValue {
                        field: "max_sessions".to_string(),
                        value,
                        reason: "expected a positive integer".to_string(),
                    })
                }
            },
            None => None,
        };

        let sequence_floor = match lookup("FRESHET_SEQUENCE_FLOOR") {
            Some(value) => match value.to_lowercase().as_str() {
                "clock" => SequenceFloor::Clock,
                "zero" => SequenceFloor::Zero,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        field: "sequence_floor".to_string(),
                        value,
                        reason: "expected \"clock\" or \"zero\"".to_string(),
                    })
                }
            },
            None => defaults.sequence_floor,
        };

        let cors_origins = lookup("FRESHET_CORS_ORIGINS")
            .map(|s| {
                s.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            bind_host,
            port,
            session_queue_capacity,
            max_sessions,
            sequence_floor,
            cors_origins,
        })
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.bind_host, self.port);
        addr.parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue {
                field: "bind".to_string(),
                value: addr.clone(),
                reason: e.to_string(),
            })
    }

    /// Broadcaster settings derived from this configuration. The clock
    /// floor is sampled on every call.
    pub fn broadcaster_config(&self) -> BroadcasterConfig {
        BroadcasterConfig {
            session_queue_capacity: self.session_queue_capacity,
            max_sessions: self.max_sessions,
            sequence_floor: self.sequence_floor.resolve(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).expect("defaults are valid");
        assert_eq!(config.port, 3000);
        assert_eq!(config.session_queue_capacity, 256);
        assert_eq!(config.max_sessions, None);
        assert_eq!(config.sequence_floor, SequenceFloor::Clock);
        assert!(config.bind_addr().is_ok());
    }

    #[test]
    fn test_port_precedence() {
        let config = ServerConfig::from_lookup(lookup(&[("PORT", "8080"), ("FRESHET_PORT", "9090")]))
            .expect("valid");
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("FRESHET_BIND", "127.0.0.1"),
            ("FRESHET_SESSION_QUEUE", "8"),
            ("FRESHET_MAX_SESSIONS", "100"),
            ("FRESHET_SEQUENCE_FLOOR", "zero"),
            ("FRESHET_CORS_ORIGINS", "https://a.example, https://b.example"),
        ]))
        .expect("valid");
        assert_eq!(config.bind_host, "127.0.0.1");
        assert_eq!(config.session_queue_capacity, 8);
        assert_eq!(config.max_sessions, Some(100));
        assert_eq!(config.broadcaster_config().sequence_floor, Sequence::ZERO);
        assert_eq!(config.cors_origins.len(), 2);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(ServerConfig::from_lookup(lookup(&[("PORT", "eighty")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("FRESHET_SESSION_QUEUE", "0")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("FRESHET_SEQUENCE_FLOOR", "later")])).is_err());
    }

    #[test]
    fn test_clock_floor_is_nonzero() {
        assert!(SequenceFloor::Clock.resolve() > Sequence::ZERO);
    }
}
