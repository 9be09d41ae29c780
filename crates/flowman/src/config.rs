//! Flow manager configuration.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use log::info;
use serde::Deserialize;
use thiserror::Error;

use crate::types::PciAddress;

/// Errors while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to open {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Flow manager configuration.
///
/// Every field has a default, so a JSON document only needs to name what it
/// changes:
///
/// ```json
/// {
///   "rq_count": 8,
///   "ports": { "1": "05:00.1" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FlowManagerConfig {
    /// Entries per group-0 TCAM table.
    pub tcam_table_size: u32,
    /// Entries per on-demand exact-match table.
    pub exact_table_size: u32,
    /// Entries per default (placeholder) table.
    pub default_table_size: u32,
    /// Counters added to the pool per growth step.
    pub counters_expand: u32,
    /// Ceiling on the counter pool; growth beyond it is declined.
    pub max_counters: Option<u32>,
    /// Cap on concurrently open exact-match tables.
    pub max_exact_tables: usize,
    /// Receive queues available for QUEUE and RSS.
    pub rq_count: u16,
    /// The one RSS hash type set the device is configured for.
    pub rss_hf: u64,
    /// Peer ports reachable with PORT_ID, by port id.
    pub ports: HashMap<u16, PciAddress>,
}

impl Default for FlowManagerConfig {
    fn default() -> Self {
        Self {
            tcam_table_size: 1024,
            exact_table_size: 4096,
            default_table_size: 128,
            counters_expand: 100,
            max_counters: None,
            max_exact_tables: 64,
            rq_count: 1,
            rss_hf: 0,
            ports: HashMap::new(),
        }
    }
}

impl FlowManagerConfig {
    pub fn with_rq_count(mut self, rq_count: u16) -> Self {
        self.rq_count = rq_count;
        self
    }

    pub fn with_rss_hf(mut self, rss_hf: u64) -> Self {
        self.rss_hf = rss_hf;
        self
    }

    pub fn with_max_counters(mut self, max_counters: u32) -> Self {
        self.max_counters = Some(max_counters);
        self
    }

    pub fn with_max_exact_tables(mut self, max_exact_tables: usize) -> Self {
        self.max_exact_tables = max_exact_tables;
        self
    }

    pub fn with_port(mut self, port_id: u16, addr: PciAddress) -> Self {
        self.ports.insert(port_id, addr);
        self
    }

    /// Checks the values the device would reject.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tcam_table_size == 0 || self.exact_table_size == 0 || self.default_table_size == 0 {
            return Err(ConfigError::Invalid("table sizes must be non-zero".to_string()));
        }
        if self.counters_expand == 0 {
            return Err(ConfigError::Invalid("counters_expand must be non-zero".to_string()));
        }
        if self.rq_count == 0 {
            return Err(ConfigError::Invalid("rq_count must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        info!(
            "Loaded flow manager config from {}: {} queues, {} ports",
            path.display(),
            config.rq_count,
            config.ports.len()
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = FlowManagerConfig::default();
        assert_eq!(config.tcam_table_size, 1024);
        assert_eq!(config.exact_table_size, 4096);
        assert_eq!(config.default_table_size, 128);
        assert_eq!(config.counters_expand, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config =
            FlowManagerConfig::from_json_str(r#"{"rq_count": 8, "ports": {"2": "05:00.1"}}"#)
                .unwrap();
        assert_eq!(config.rq_count, 8);
        assert_eq!(config.tcam_table_size, 1024);
        assert_eq!(config.ports[&2].bdf(), 0x0501);
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            FlowManagerConfig::from_json_str(r#"{"rq_count": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            FlowManagerConfig::from_json_str(r#"{"ports": {"1": "bogus"}}"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_json_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"counters_expand": 16, "max_counters": 64}}"#).unwrap();
        file.flush().unwrap();

        let config = FlowManagerConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.counters_expand, 16);
        assert_eq!(config.max_counters, Some(64));

        assert!(matches!(
            FlowManagerConfig::from_json_file("/nonexistent/flowman.json"),
            Err(ConfigError::Io { .. })
        ));
    }
}
