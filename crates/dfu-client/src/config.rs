//! Buffer and fragment sizing for a download session.
//!
//! The response buffer must hold one complete HTTP response (status line,
//! headers and a full fragment), otherwise the engine can never see a
//! fragment end and stalls.

use std::time::Duration;

use crate::error::{DfuError, DfuResult};

/// HTTP port used when none is configured.
pub const DEFAULT_PORT: u16 = 80;

/// Request buffer size in bytes. Fits the range request for typical
/// host and resource names.
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 256;

/// Response buffer size in bytes: one fragment plus header headroom.
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 2048;

/// Bytes requested per range request.
pub const DEFAULT_MAX_FRAGMENT_SIZE: usize = 1024;

/// Environment keys read by [`DfuConfig::from_env`].
pub const ENV_PORT: &str = "DFU_PORT";
pub const ENV_MAX_REQUEST_SIZE: &str = "DFU_MAX_REQUEST_SIZE";
pub const ENV_MAX_RESPONSE_SIZE: &str = "DFU_MAX_RESPONSE_SIZE";
pub const ENV_MAX_FRAGMENT_SIZE: &str = "DFU_MAX_FRAGMENT_SIZE";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "DFU_CONNECT_TIMEOUT_MS";

/// Download session configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuConfig {
    /// Server port.
    pub port: u16,
    /// Capacity of the request buffer.
    pub max_request_size: usize,
    /// Capacity of the response buffer.
    pub max_response_size: usize,
    /// Size of each requested range.
    pub max_fragment_size: usize,
    /// Per-address connect timeout. `None` blocks until the OS gives up.
    pub connect_timeout: Option<Duration>,
}

impl Default for DfuConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
            connect_timeout: None,
        }
    }
}

impl DfuConfig {
    /// Check the sizes against each other.
    pub fn validate(&self) -> DfuResult<()> {
        if self.port == 0 {
            return Err(DfuError::InvalidConfig("port must be non-zero".into()));
        }
        if self.max_request_size == 0 {
            return Err(DfuError::InvalidConfig(
                "max_request_size must be non-zero".into(),
            ));
        }
        if self.max_fragment_size == 0 {
            return Err(DfuError::InvalidConfig(
                "max_fragment_size must be non-zero".into(),
            ));
        }
        if self.max_fragment_size >= self.max_response_size {
            return Err(DfuError::InvalidConfig(format!(
                "max_response_size ({}) must exceed max_fragment_size ({}) to leave room for headers",
                self.max_response_size, self.max_fragment_size
            )));
        }
        Ok(())
    }

    /// Read overrides from the process environment.
    pub fn from_env() -> DfuResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from defaults plus whatever `lookup` returns for the
    /// `DFU_*` keys. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> DfuResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(port) = parse_key(&lookup, ENV_PORT)? {
            config.port = port;
        }
        if let Some(size) = parse_key(&lookup, ENV_MAX_REQUEST_SIZE)? {
            config.max_request_size = size;
        }
        if let Some(size) = parse_key(&lookup, ENV_MAX_RESPONSE_SIZE)? {
            config.max_response_size = size;
        }
        if let Some(size) = parse_key(&lookup, ENV_MAX_FRAGMENT_SIZE)? {
            config.max_fragment_size = size;
        }
        if let Some(ms) = parse_key::<u64, _>(&lookup, ENV_CONNECT_TIMEOUT_MS)? {
            config.connect_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_key<T, F>(lookup: &F, key: &str) -> DfuResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| DfuError::InvalidConfig(format!("{key}={raw:?}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = DfuConfig::default();
        assert_eq!(config.port, 80);
        assert_eq!(config.max_fragment_size, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fragment_must_fit_response_buffer() {
        let config = DfuConfig {
            max_fragment_size: 2048,
            max_response_size: 2048,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DfuError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let config = DfuConfig {
            max_request_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = DfuConfig {
            max_fragment_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lookup_overrides() {
        let config = DfuConfig::from_lookup(lookup_from(&[
            ("DFU_PORT", "8080"),
            ("DFU_MAX_FRAGMENT_SIZE", "512"),
            ("DFU_MAX_RESPONSE_SIZE", " 1024 "),
            ("DFU_CONNECT_TIMEOUT_MS", "1500"),
        ]))
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.max_fragment_size, 512);
        assert_eq!(config.max_response_size, 1024);
        assert_eq!(config.max_request_size, DEFAULT_MAX_REQUEST_SIZE);
        assert_eq!(config.connect_timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_zero_timeout_means_none() {
        let config =
            DfuConfig::from_lookup(lookup_from(&[("DFU_CONNECT_TIMEOUT_MS", "0")])).unwrap();
        assert_eq!(config.connect_timeout, None);
    }

    #[test]
    fn test_lookup_rejects_garbage() {
        let err = DfuConfig::from_lookup(lookup_from(&[("DFU_PORT", "eighty")])).unwrap_err();
        assert!(err.to_string().contains("DFU_PORT"));
    }

    #[test]
    fn test_lookup_validates_result() {
        let result = DfuConfig::from_lookup(lookup_from(&[("DFU_MAX_FRAGMENT_SIZE", "4096")]));
        assert!(matches!(result, Err(DfuError::InvalidConfig(_))));
    }
}
