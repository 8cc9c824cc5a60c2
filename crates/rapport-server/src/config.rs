use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, bail};

/// Secrets that ship in sample files and must never reach production.
const PLACEHOLDER_SECRETS: &[&str] = &["", "changeme", "change-me", "dev-secret-change-me", "secret"];

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    /// 0 disables the typing sweep.
    pub typing_sweep_secs: u64,
    pub signal_channel_capacity: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let jwt_secret = lookup("RAPPORT_JWT_SECRET").context("RAPPORT_JWT_SECRET must be set")?;
        if PLACEHOLDER_SECRETS.contains(&jwt_secret.trim()) {
            bail!("RAPPORT_JWT_SECRET is a placeholder value; set a real secret");
        }

        let port = var("RAPPORT_PORT", "3000")
            .parse()
            .context("RAPPORT_PORT must be a port number")?;
        let typing_sweep_secs = var("RAPPORT_TYPING_SWEEP_SECS", "30")
            .parse()
            .context("RAPPORT_TYPING_SWEEP_SECS must be a whole number of seconds")?;
        let signal_channel_capacity = var("RAPPORT_SIGNAL_CHANNEL_CAPACITY", "256")
            .parse()
            .context("RAPPORT_SIGNAL_CHANNEL_CAPACITY must be a positive integer")?;
        if signal_channel_capacity == 0 {
            bail!("RAPPORT_SIGNAL_CHANNEL_CAPACITY must be at least 1");
        }

        Ok(Self {
            host: var("RAPPORT_HOST", "0.0.0.0"),
            port,
            db_path: PathBuf::from(var("RAPPORT_DB_PATH", "rapport.db")),
            jwt_secret,
            typing_sweep_secs,
            signal_channel_capacity,
        })
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_secret_is_set() {
        let config = Config::from_lookup(lookup(&[("RAPPORT_JWT_SECRET", "s3cr3t-value")])).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.db_path, PathBuf::from("rapport.db"));
        assert_eq!(config.typing_sweep_secs, 30);
        assert_eq!(config.signal_channel_capacity, 256);
        assert_eq!(config.addr().unwrap().to_string(), "0.0.0.0:3000");
    }

    #[test]
    fn missing_or_placeholder_secret_is_rejected() {
        assert!(Config::from_lookup(lookup(&[])).is_err());
        assert!(Config::from_lookup(lookup(&[("RAPPORT_JWT_SECRET", "dev-secret-change-me")])).is_err());
    }

    #[test]
    fn bad_numbers_are_rejected() {
        let result = Config::from_lookup(lookup(&[
            ("RAPPORT_JWT_SECRET", "s3cr3t-value"),
            ("RAPPORT_PORT", "http"),
        ]));
        assert!(result.is_err());

        let result = Config::from_lookup(lookup(&[
            ("RAPPORT_JWT_SECRET", "s3cr3t-value"),
            ("RAPPORT_SIGNAL_CHANNEL_CAPACITY", "0"),
        ]));
        assert!(result.is_err());
    }
}
