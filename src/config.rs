use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use thiserror::Error;

use crate::engine::DEFAULT_LOCK_TIMEOUT;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("both SLOTKEEP_TLS_CERT and SLOTKEEP_TLS_KEY must be set, or neither")]
    PartialTls,
    #[error("tls: {0}")]
    Tls(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Server settings, read from `SLOTKEEP_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub staff_password: String,
    pub public_user: String,
    pub public_password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub lock_timeout: Duration,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let text = |var: &str, default: &str| lookup(var).unwrap_or_else(|| default.to_string());
        let number = |var: &'static str| -> Result<Option<u64>, ConfigError> {
            lookup(var).map(|value| parse(var, value)).transpose()
        };

        let tls_cert = lookup("SLOTKEEP_TLS_CERT").map(PathBuf::from);
        let tls_key = lookup("SLOTKEEP_TLS_KEY").map(PathBuf::from);
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }

        Ok(Self {
            bind: text("SLOTKEEP_BIND", "0.0.0.0"),
            port: lookup("SLOTKEEP_PORT")
                .map(|v| parse("SLOTKEEP_PORT", v))
                .transpose()?
                .unwrap_or(5433),
            data_dir: PathBuf::from(text("SLOTKEEP_DATA_DIR", "./data")),
            staff_password: text("SLOTKEEP_PASSWORD", "slotkeep"),
            public_user: text("SLOTKEEP_PUBLIC_USER", "public"),
            public_password: text("SLOTKEEP_PUBLIC_PASSWORD", "public"),
            max_connections: lookup("SLOTKEEP_MAX_CONNECTIONS")
                .map(|v| parse("SLOTKEEP_MAX_CONNECTIONS", v))
                .transpose()?
                .unwrap_or(256),
            compact_threshold: number("SLOTKEEP_COMPACT_THRESHOLD")?.unwrap_or(1000),
            lock_timeout: number("SLOTKEEP_LOCK_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_LOCK_TIMEOUT),
            metrics_port: lookup("SLOTKEEP_METRICS_PORT")
                .map(|v| parse("SLOTKEEP_METRICS_PORT", v))
                .transpose()?,
            tls_cert,
            tls_key,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotkeep.wal")
    }

    /// Build a TLS acceptor from the configured PEM files, if any.
    pub fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>, ConfigError> {
        let (Some(cert_path), Some(key_path)) = (&self.tls_cert, &self.tls_key) else {
            return Ok(None);
        };

        let certs: Vec<_> =
            rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?)).collect::<Result<_, _>>()?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| ConfigError::Tls(format!("no private key in {}", key_path.display())))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ConfigError::Tls(e.to_string()))?;
        config.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }
}

fn parse<T: FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { var, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|var| map.get(var).cloned())
    }

    #[test]
    fn defaults() {
        let c = config(&[]).unwrap();
        assert_eq!(c.listen_addr(), "0.0.0.0:5433");
        assert_eq!(c.wal_path(), PathBuf::from("./data/slotkeep.wal"));
        assert_eq!(c.staff_password, "slotkeep");
        assert_eq!(c.public_user, "public");
        assert_eq!(c.max_connections, 256);
        assert_eq!(c.compact_threshold, 1000);
        assert_eq!(c.lock_timeout, DEFAULT_LOCK_TIMEOUT);
        assert_eq!(c.metrics_port, None);
        assert!(c.tls_acceptor().unwrap().is_none());
    }

    #[test]
    fn overrides() {
        let c = config(&[
            ("SLOTKEEP_PORT", "6543"),
            ("SLOTKEEP_BIND", "127.0.0.1"),
            ("SLOTKEEP_LOCK_TIMEOUT_MS", "250"),
            ("SLOTKEEP_METRICS_PORT", "9100"),
            ("SLOTKEEP_DATA_DIR", "/var/lib/slotkeep"),
        ])
        .unwrap();
        assert_eq!(c.listen_addr(), "127.0.0.1:6543");
        assert_eq!(c.lock_timeout, Duration::from_millis(250));
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.wal_path(), PathBuf::from("/var/lib/slotkeep/slotkeep.wal"));
    }

    #[test]
    fn bad_number_is_an_error() {
        let err = config(&[("SLOTKEEP_MAX_CONNECTIONS", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "SLOTKEEP_MAX_CONNECTIONS", .. }));
        assert!(config(&[("SLOTKEEP_PORT", "70000")]).is_err());
    }

    #[test]
    fn tls_needs_both_files() {
        let err = config(&[("SLOTKEEP_TLS_CERT", "cert.pem")]).unwrap_err();
        assert!(matches!(err, ConfigError::PartialTls));
    }
}
