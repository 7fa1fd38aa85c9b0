//! Server configuration from environment variables.
//!
//! All settings live under `CITADEL_*` with sensible defaults; `PORT` is
//! honored for platform deployments that inject it. A reload (SIGHUP)
//! re-reads the logging level but never the storage stanza.

use std::net::SocketAddr;

/// Supported storage backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackendType {
    /// In-memory, development only.
    Memory,
    /// Local redb file, single node.
    Redb { path: String },
    /// The replicated log-backed store.
    Raft { path: String },
}

/// Supported seal providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SealStanza {
    Shamir,
    /// Static key material, hex-encoded 32 bytes.
    Static { key_hex: String },
    /// Local AEAD wrapper standing in for an external KMS.
    Kms { key_hex: String, key_id: String },
}

/// Full server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub api_addr: String,
    pub node_id: String,
    pub storage: StorageBackendType,
    pub seal: SealStanza,
    pub log_level: String,
    pub default_lease_ttl: i64,
    pub max_lease_ttl: i64,
    pub request_timeout_secs: u64,
    pub expiration_interval_secs: u64,
    pub ha_tick_interval_secs: u64,
}

impl ServerConfig {
    /// Load configuration from the environment.
    ///
    /// Variables:
    /// - `CITADEL_BIND_ADDR` — full bind address (default `127.0.0.1:8200`)
    /// - `PORT` — port only, binds `0.0.0.0` (platform convention)
    /// - `CITADEL_API_ADDR` — address advertised for redirects
    /// - `CITADEL_NODE_ID` — stable node identifier (default: random)
    /// - `CITADEL_STORAGE` — `memory`, `redb`, or `raft` (default `memory`)
    /// - `CITADEL_STORAGE_PATH` — file path for persistent backends
    /// - `CITADEL_SEAL` — `shamir`, `static`, or `kms` (default `shamir`)
    /// - `CITADEL_SEAL_KEY` — hex key material for static/kms seals
    /// - `CITADEL_KMS_KEY_ID` — wrapping key identifier for the kms seal
    /// - `CITADEL_LOG_LEVEL` — tracing filter (default `info`)
    /// - `CITADEL_DEFAULT_LEASE_TTL` / `CITADEL_MAX_LEASE_TTL` — seconds
    /// - `CITADEL_REQUEST_TIMEOUT` — seconds (default 90)
    /// - `CITADEL_EXPIRATION_INTERVAL` — seconds between lease sweeps
    #[must_use]
    pub fn from_env() -> Self {
        let bind_addr = if let Ok(addr) = std::env::var("CITADEL_BIND_ADDR") {
            addr.parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8200)))
        } else if let Ok(port) = std::env::var("PORT") {
            let port: u16 = port.parse().unwrap_or(8200);
            SocketAddr::from(([0, 0, 0, 0], port))
        } else {
            SocketAddr::from(([127, 0, 0, 1], 8200))
        };

        let api_addr = std::env::var("CITADEL_API_ADDR")
            .unwrap_or_else(|_| format!("http://{bind_addr}"));

        let node_id = std::env::var("CITADEL_NODE_ID")
            .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

        let storage_path = std::env::var("CITADEL_STORAGE_PATH")
            .unwrap_or_else(|_| "./citadel-data".to_owned());
        let storage = match std::env::var("CITADEL_STORAGE")
            .unwrap_or_else(|_| "memory".to_owned())
            .to_lowercase()
            .as_str()
        {
            "redb" => StorageBackendType::Redb { path: storage_path },
            "raft" => StorageBackendType::Raft { path: storage_path },
            _ => StorageBackendType::Memory,
        };

        let seal_key = std::env::var("CITADEL_SEAL_KEY").unwrap_or_default();
        let seal = match std::env::var("CITADEL_SEAL")
            .unwrap_or_else(|_| "shamir".to_owned())
            .to_lowercase()
            .as_str()
        {
            "static" => SealStanza::Static { key_hex: seal_key },
            "kms" => SealStanza::Kms {
                key_hex: seal_key,
                key_id: std::env::var("CITADEL_KMS_KEY_ID")
                    .unwrap_or_else(|_| "local".to_owned()),
            },
            _ => SealStanza::Shamir,
        };

        let int_var = |name: &str, default: i64| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };

        Self {
            bind_addr,
            api_addr,
            node_id,
            storage,
            seal,
            log_level: std::env::var("CITADEL_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned()),
            default_lease_ttl: int_var("CITADEL_DEFAULT_LEASE_TTL", 32 * 24 * 3600),
            max_lease_ttl: int_var("CITADEL_MAX_LEASE_TTL", 32 * 24 * 3600),
            #[allow(clippy::cast_sign_loss)]
            request_timeout_secs: int_var("CITADEL_REQUEST_TIMEOUT", 90).max(1) as u64,
            #[allow(clippy::cast_sign_loss)]
            expiration_interval_secs: int_var("CITADEL_EXPIRATION_INTERVAL", 60).max(1) as u64,
            #[allow(clippy::cast_sign_loss)]
            ha_tick_interval_secs: int_var("CITADEL_HA_TICK_INTERVAL", 5).max(1) as u64,
        }
    }
}
