use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::LedgerOptions;

/// Process configuration, read once from `COTTAGE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub reject_guest_overlap: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7878,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            reject_guest_overlap: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            bind: lookup("COTTAGE_BIND").unwrap_or(defaults.bind),
            port: parse_var(&lookup, "COTTAGE_PORT").unwrap_or(defaults.port),
            data_dir: lookup("COTTAGE_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            max_connections: parse_var::<usize>(&lookup, "COTTAGE_MAX_CONNECTIONS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_connections),
            compact_threshold: parse_var(&lookup, "COTTAGE_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            metrics_port: parse_var(&lookup, "COTTAGE_METRICS_PORT"),
            reject_guest_overlap: lookup("COTTAGE_REJECT_GUEST_OVERLAP")
                .and_then(|s| parse_flag(&s))
                .unwrap_or(defaults.reject_guest_overlap),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("ledger.wal")
    }

    pub fn ledger_options(&self) -> LedgerOptions {
        LedgerOptions {
            reject_guest_overlap: self.reject_guest_overlap,
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = config(&[]);
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.addr(), "0.0.0.0:7878");
        assert_eq!(cfg.wal_path(), PathBuf::from("./data/ledger.wal"));
        assert!(!cfg.ledger_options().reject_guest_overlap);
    }

    #[test]
    fn reads_overrides() {
        let cfg = config(&[
            ("COTTAGE_BIND", "127.0.0.1"),
            ("COTTAGE_PORT", "9000"),
            ("COTTAGE_DATA_DIR", "/var/lib/cottages"),
            ("COTTAGE_MAX_CONNECTIONS", "8"),
            ("COTTAGE_COMPACT_THRESHOLD", "50"),
            ("COTTAGE_METRICS_PORT", "9100"),
            ("COTTAGE_REJECT_GUEST_OVERLAP", "yes"),
        ]);
        assert_eq!(cfg.addr(), "127.0.0.1:9000");
        assert_eq!(cfg.wal_path(), PathBuf::from("/var/lib/cottages/ledger.wal"));
        assert_eq!(cfg.max_connections, 8);
        assert_eq!(cfg.compact_threshold, 50);
        assert_eq!(cfg.metrics_port, Some(9100));
        assert!(cfg.reject_guest_overlap);
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        let cfg = config(&[
            ("COTTAGE_PORT", "not-a-port"),
            ("COTTAGE_MAX_CONNECTIONS", "0"),
            ("COTTAGE_METRICS_PORT", "70000"),
            ("COTTAGE_REJECT_GUEST_OVERLAP", "maybe"),
        ]);
        assert_eq!(cfg.port, 7878);
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.metrics_port, None);
        assert!(!cfg.reject_guest_overlap);
    }
}
