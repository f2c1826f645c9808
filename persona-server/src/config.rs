//! Boot-time environment (§6 "Environment at boot"): the master-key
//! secret, team API key hash, worker token, and the handful of optional
//! knobs the core needs before it can start accepting work.

use base64::Engine;
use thiserror::Error;

const MASTER_KEY_VAR: &str = "PERSONA_MASTER_KEY";
const TEAM_API_KEY_HASH_VAR: &str = "PERSONA_TEAM_API_KEY_HASH";
const WORKER_TOKEN_VAR: &str = "PERSONA_WORKER_TOKEN";
const BIND_ADDR_VAR: &str = "PERSONA_BIND_ADDR";
const STATIC_TOKEN_VAR: &str = "PERSONA_STATIC_TOKEN";
const JWT_SECRET_VAR: &str = "PERSONA_JWT_SECRET";
const OAUTH_REFRESH_URL_VAR: &str = "PERSONA_OAUTH_REFRESH_URL";
const OAUTH_CLIENT_ID_VAR: &str = "PERSONA_OAUTH_CLIENT_ID";
const BUS_URL_VAR: &str = "PERSONA_BUS_URL";
const BUS_TOKEN_VAR: &str = "PERSONA_BUS_TOKEN";

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:7420";

/// Errors loading the boot-time environment.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is unset.
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),

    /// `PERSONA_MASTER_KEY` is set but isn't valid base64 or isn't 32 bytes.
    #[error("invalid {MASTER_KEY_VAR}: {0}")]
    InvalidMasterKey(String),

    /// `PERSONA_BIND_ADDR` is set but doesn't parse as a socket address.
    #[error("invalid {BIND_ADDR_VAR}: {0}")]
    InvalidBindAddr(String),
}

/// Optional OAuth-style refresh endpoint (§4.5). Present only when both
/// halves of the pair are configured.
pub struct OAuthConfig {
    /// Refresh-token endpoint URL.
    pub refresh_url: String,
    /// OAuth client id sent alongside the refresh grant.
    pub client_id: String,
}

/// Optional external message bus credentials. The core never actually
/// speaks the bus wire protocol (Non-goals) — when present, `main` logs
/// that a [`persona_bus::NoopBus`] is substituted anyway.
pub struct BusConfig {
    /// Bus endpoint URL.
    pub url: String,
    /// Bus auth token.
    pub token: String,
}

/// Everything `main` needs to wire up the orchestrator, read once at
/// startup from the process environment.
pub struct ServerConfig {
    /// Raw 32-byte AES-256-GCM credential-decryption key.
    pub master_key: [u8; 32],
    /// Opaque team API key hash. CRUD auth is out of scope; only its
    /// presence is validated, never its shape.
    pub team_api_key_hash: String,
    /// Shared secret workers present on the pool's WebSocket handshake.
    pub worker_token: String,
    /// Address the Worker Pool's axum listener binds to.
    pub bind_addr: std::net::SocketAddr,
    /// Static bearer token used when no [`OAuthConfig`] is configured,
    /// or as a fallback while the token provider has nothing seeded yet.
    pub static_token: Option<String>,
    /// Secret used to verify externally-issued user-scoping JWTs. Read
    /// but otherwise unused — the HTTP surface that would consume it is
    /// a Non-goal.
    pub jwt_secret: Option<String>,
    /// OAuth refresh endpoint, if configured.
    pub oauth: Option<OAuthConfig>,
    /// External bus credentials, if configured.
    pub bus: Option<BusConfig>,
}

impl ServerConfig {
    /// Load the boot-time environment (§6).
    pub fn from_env() -> Result<Self, ConfigError> {
        let master_key_b64 = require_var(MASTER_KEY_VAR)?;
        let master_key_bytes = base64::engine::general_purpose::STANDARD
            .decode(master_key_b64)
            .map_err(|e| ConfigError::InvalidMasterKey(e.to_string()))?;
        let master_key: [u8; 32] = master_key_bytes
            .try_into()
            .map_err(|v: Vec<u8>| ConfigError::InvalidMasterKey(format!("expected 32 bytes, got {}", v.len())))?;

        let team_api_key_hash = require_var(TEAM_API_KEY_HASH_VAR)?;
        let worker_token = require_var(WORKER_TOKEN_VAR)?;

        let bind_addr = std::env::var(BIND_ADDR_VAR)
            .unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string())
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::InvalidBindAddr(e.to_string()))?;

        let static_token = optional_var(STATIC_TOKEN_VAR);
        let jwt_secret = optional_var(JWT_SECRET_VAR);

        let oauth = match (optional_var(OAUTH_REFRESH_URL_VAR), optional_var(OAUTH_CLIENT_ID_VAR)) {
            (Some(refresh_url), Some(client_id)) => Some(OAuthConfig { refresh_url, client_id }),
            _ => None,
        };

        let bus = match (optional_var(BUS_URL_VAR), optional_var(BUS_TOKEN_VAR)) {
            (Some(url), Some(token)) => Some(BusConfig { url, token }),
            _ => None,
        };

        Ok(Self {
            master_key,
            team_api_key_hash,
            worker_token,
            bind_addr,
            static_token,
            jwt_secret,
            oauth,
            bus,
        })
    }
}

fn require_var(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingVar(name))
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
