//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address, TLS).
    pub listener: ListenerConfig,

    /// Session cookie and token settings.
    pub session: SessionConfig,

    /// Authenticate/authorize service endpoints.
    pub services: ServicesConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Base64 encoded PEM EC private key used to sign identity assertions.
    pub signing_key: Option<String>,

    /// Route policies mapping source hosts to destinations.
    pub policies: Vec<PolicyConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8443").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Maximum request body accepted from clients.
    pub max_body_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8443".to_string(),
            tls: None,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Session cookie and token transport settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    pub cookie_name: String,

    /// Cookie domain; empty means host-only.
    pub cookie_domain: String,

    pub cookie_secure: bool,

    pub cookie_http_only: bool,

    /// Cookie lifetime in seconds; 0 makes it a browser-session cookie.
    pub cookie_expire_secs: u64,

    /// Base64 encoded 32-byte key sealing session payloads.
    pub cookie_secret: String,

    /// `Authorization` scheme accepted for session tokens.
    pub header_scheme: String,

    /// Query parameter accepted for session tokens.
    pub query_param: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "_gatehouse".to_string(),
            cookie_domain: String::new(),
            cookie_secure: true,
            cookie_http_only: true,
            cookie_expire_secs: 14 * 60 * 60,
            cookie_secret: String::new(),
            header_scheme: crate::sessions::loader::DEFAULT_AUTH_SCHEME.to_string(),
            query_param: crate::sessions::loader::DEFAULT_QUERY_PARAM.to_string(),
        }
    }
}

impl SessionConfig {
    pub fn cookie_expire(&self) -> Duration {
        Duration::from_secs(self.cookie_expire_secs)
    }
}

/// External service endpoints.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServicesConfig {
    /// Where unauthenticated users are sent to sign in.
    pub authenticate_url: String,

    /// Authorization service base URL.
    pub authorize_url: String,

    /// Optional host answering forward-auth verification requests.
    pub forward_auth_url: Option<String>,

    /// Secret authenticating the gateway to the authorization service.
    pub shared_secret: String,
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upstream timeout for policies that do not set their own, in milliseconds.
    pub default_upstream_ms: u64,

    /// Authorization call timeout in milliseconds.
    pub authorize_ms: u64,

    /// Upstream connect timeout in milliseconds.
    pub connect_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_upstream_ms: 30_000,
            authorize_ms: 10_000,
            connect_ms: 5_000,
        }
    }
}

impl TimeoutConfig {
    pub fn default_upstream(&self) -> Duration {
        Duration::from_millis(self.default_upstream_ms)
    }

    pub fn authorize(&self) -> Duration {
        Duration::from_millis(self.authorize_ms)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }
}

/// A route policy as written in the config file.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PolicyConfig {
    /// Source URL; only its host is matched (e.g. "https://httpbin.corp.example.com").
    pub from: String,

    /// Destination URL requests are forwarded to.
    pub to: String,

    pub allow_websockets: bool,

    pub allow_public_unauthenticated_access: bool,

    /// Let CORS preflight requests through without a session.
    pub cors_allow_preflight: bool,

    /// Upstream timeout override in milliseconds.
    pub timeout_ms: Option<u64>,

    pub tls_skip_verify: bool,

    /// PEM bundle of CAs trusted for this destination instead of the defaults.
    pub tls_custom_ca_file: Option<String>,

    pub tls_client_cert_file: Option<String>,

    pub tls_client_key_file: Option<String>,

    /// SNI / verification name override.
    pub tls_server_name: Option<String>,

    /// Headers added to every request forwarded on this route.
    pub set_request_headers: BTreeMap<String, String>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// "pretty" or "json".
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
