use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server settings, read from `KINEDESK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// Journal appends before the compactor rewrites the log.
    pub compact_threshold: u64,
    pub audit_interval: Duration,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub metrics_port: Option<u16>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid value for {}: {:?}", self.var, self.value)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let text = |var: &str, default: &str| lookup(var).unwrap_or_else(|| default.to_string());
        Ok(Self {
            bind: text("KINEDESK_BIND", "0.0.0.0"),
            port: parsed(&lookup, "KINEDESK_PORT")?.unwrap_or(5433),
            data_dir: PathBuf::from(text("KINEDESK_DATA_DIR", "./data")),
            password: text("KINEDESK_PASSWORD", "kinedesk"),
            max_connections: parsed(&lookup, "KINEDESK_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parsed(&lookup, "KINEDESK_COMPACT_THRESHOLD")?.unwrap_or(1000),
            audit_interval: Duration::from_secs(
                parsed(&lookup, "KINEDESK_AUDIT_INTERVAL_SECS")?.unwrap_or(60),
            ),
            tls_cert: lookup("KINEDESK_TLS_CERT").map(PathBuf::from),
            tls_key: lookup("KINEDESK_TLS_KEY").map(PathBuf::from),
            metrics_port: parsed(&lookup, "KINEDESK_METRICS_PORT")?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_port.map(|p| ([0, 0, 0, 0], p).into())
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("kinedesk.wal")
    }
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let c = from(&[]).unwrap();
        assert_eq!(c.listen_addr(), "0.0.0.0:5433");
        assert_eq!(c.password, "kinedesk");
        assert_eq!(c.max_connections, 256);
        assert_eq!(c.compact_threshold, 1000);
        assert_eq!(c.audit_interval, Duration::from_secs(60));
        assert_eq!(c.wal_path(), PathBuf::from("./data/kinedesk.wal"));
        assert_eq!(c.metrics_addr(), None);
        assert_eq!(c.tls_cert, None);
    }

    #[test]
    fn overrides() {
        let c = from(&[
            ("KINEDESK_PORT", "6000"),
            ("KINEDESK_BIND", "127.0.0.1"),
            ("KINEDESK_METRICS_PORT", "9100"),
            ("KINEDESK_AUDIT_INTERVAL_SECS", "5"),
        ])
        .unwrap();
        assert_eq!(c.listen_addr(), "127.0.0.1:6000");
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.audit_interval, Duration::from_secs(5));
    }

    #[test]
    fn malformed_numbers_are_errors() {
        let err = from(&[("KINEDESK_MAX_CONNECTIONS", "lots")]).unwrap_err();
        assert_eq!(err.var, "KINEDESK_MAX_CONNECTIONS");
        assert!(err.to_string().contains("lots"));
    }
}
