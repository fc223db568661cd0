//! Configuration loading from `.env` files.

use std::env;

use anyhow::{Context, Result};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Relays queried and subscribed to, e.g. `wss://relay.damus.io`.
    pub relays: Vec<String>,
    /// Optional HTTP sidecar bind address, e.g. `127.0.0.1:7787`. Empty
    /// disables the sidecar.
    pub bind_http: Option<String>,
    /// Optional Tor SOCKS proxy (host:port) for relay connections.
    pub tor_socks: Option<String>,
    /// Enable Schnorr signature verification on received events.
    pub verify_sig: bool,
    /// Capacity of each identity's notification store.
    pub notify_capacity: usize,
    /// Per-lookup timeout for content resolution, seconds.
    pub lookup_timeout_secs: u64,
    /// Collection window for one-shot relay queries, seconds.
    pub collect_window_secs: u64,
    /// Default recursion ceiling for content resolution.
    pub resolve_depth: usize,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let relays = csv_strings(env::var("RELAYS").unwrap_or_default());
        let bind_http = env::var("BIND_HTTP").ok().filter(|s| !s.is_empty());
        let tor_socks = env::var("TOR_SOCKS").ok().filter(|s| !s.is_empty());
        let verify_sig = env::var("VERIFY_SIG").unwrap_or_else(|_| "0".into()) == "1";
        let notify_capacity = parse_or("NOTIFY_CAPACITY", 1000)?;
        let lookup_timeout_secs = parse_or("LOOKUP_TIMEOUT_SECS", 10)?;
        let collect_window_secs = parse_or("COLLECT_WINDOW_SECS", 3)?;
        let resolve_depth = parse_or("RESOLVE_DEPTH", 2)?;
        Ok(Self {
            relays,
            bind_http,
            tor_socks,
            verify_sig,
            notify_capacity,
            lookup_timeout_secs,
            collect_window_secs,
            resolve_depth,
        })
    }
}

/// Parse an optional numeric variable, erroring on garbage rather than
/// silently falling back.
fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .with_context(|| format!("parsing {name}={raw}")),
        _ => Ok(default),
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    input
        .as_ref()
        .split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, sync::Mutex};
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: [&str; 8] = [
        "RELAYS",
        "BIND_HTTP",
        "TOR_SOCKS",
        "VERIFY_SIG",
        "NOTIFY_CAPACITY",
        "LOOKUP_TIMEOUT_SECS",
        "COLLECT_WINDOW_SECS",
        "RESOLVE_DEPTH",
    ];

    fn clear_vars() {
        for v in VARS {
            env::remove_var(v);
        }
    }

    #[test]
    fn loads_env() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "RELAYS=wss://r1, wss://r2\n",
                "BIND_HTTP=127.0.0.1:7787\n",
                "TOR_SOCKS=127.0.0.1:9050\n",
                "VERIFY_SIG=1\n",
                "NOTIFY_CAPACITY=50\n",
                "LOOKUP_TIMEOUT_SECS=4\n",
                "COLLECT_WINDOW_SECS=1\n",
                "RESOLVE_DEPTH=3\n"
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.relays, vec!["wss://r1".to_string(), "wss://r2".into()]);
        assert_eq!(cfg.bind_http, Some("127.0.0.1:7787".into()));
        assert_eq!(cfg.tor_socks, Some("127.0.0.1:9050".into()));
        assert!(cfg.verify_sig);
        assert_eq!(cfg.notify_capacity, 50);
        assert_eq!(cfg.lookup_timeout_secs, 4);
        assert_eq!(cfg.collect_window_secs, 1);
        assert_eq!(cfg.resolve_depth, 3);
    }

    #[test]
    fn defaults_when_optional_absent() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "RELAYS=wss://r1\n").unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.relays.len(), 1);
        assert!(cfg.bind_http.is_none());
        assert!(cfg.tor_socks.is_none());
        assert!(!cfg.verify_sig);
        assert_eq!(cfg.notify_capacity, 1000);
        assert_eq!(cfg.lookup_timeout_secs, 10);
        assert_eq!(cfg.collect_window_secs, 3);
        assert_eq!(cfg.resolve_depth, 2);
    }

    #[test]
    fn empty_bind_disables_sidecar() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "RELAYS=wss://r1\nBIND_HTTP=\n").unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert!(cfg.bind_http.is_none());
    }

    #[test]
    fn garbage_numeric_value_errors() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "RELAYS=wss://r1\nNOTIFY_CAPACITY=lots\n").unwrap();
        assert!(Settings::from_env(env_path.to_str().unwrap()).is_err());
    }

    #[test]
    fn csv_helper() {
        assert_eq!(csv_strings("a, b , ,c"), vec!["a", "b", "c"]);
        assert!(csv_strings("").is_empty());
    }
}
