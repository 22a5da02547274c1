//! Compiled route policies.
//!
//! A [`Policy`] is the validated, immutable form of a [`PolicyConfig`]: URLs
//! parsed, TLS material loaded, headers checked. Any failure rejects the
//! policy, and with it the whole reconfiguration.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use url::Url;

use crate::config::PolicyConfig;
use crate::net::tls::{load_certs, load_private_key};

/// Reasons a policy is rejected.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("invalid '{field}' url: {reason}")]
    Url { field: &'static str, reason: String },

    #[error("tls: {0}")]
    Tls(String),

    #[error("invalid request header: {0}")]
    Header(String),

    #[error("timeout must be greater than zero")]
    Timeout,
}

/// Client certificate presented to a destination.
pub struct ClientIdentity {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// Per-destination TLS overrides.
#[derive(Clone, Default)]
pub struct TlsSettings {
    pub skip_verify: bool,
    pub root_cas: Option<Arc<RootCertStore>>,
    pub client_identity: Option<Arc<ClientIdentity>>,
    pub server_name: Option<ServerName<'static>>,
}

impl TlsSettings {
    /// True when any override is set and the default client TLS will not do.
    pub fn is_custom(&self) -> bool {
        self.skip_verify
            || self.root_cas.is_some()
            || self.client_identity.is_some()
            || self.server_name.is_some()
    }
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSettings")
            .field("skip_verify", &self.skip_verify)
            .field("root_cas", &self.root_cas.as_ref().map(|r| r.len()))
            .field("client_identity", &self.client_identity.is_some())
            .field("server_name", &self.server_name)
            .finish()
    }
}

/// A validated route policy.
#[derive(Debug, Clone)]
pub struct Policy {
    pub source: Url,
    pub destination: Url,
    pub tls: TlsSettings,
    pub allow_websockets: bool,
    pub allow_public_unauthenticated_access: bool,
    pub cors_allow_preflight: bool,
    pub upstream_timeout: Option<Duration>,
    pub set_request_headers: HeaderMap,
}

impl Policy {
    /// Parse, load and validate a policy from its config form.
    pub fn from_config(config: &PolicyConfig) -> Result<Self, PolicyError> {
        let source = parse_url("from", &config.from)?;
        let destination = parse_url("to", &config.to)?;

        let policy = Self {
            source,
            destination,
            tls: tls_settings(config)?,
            allow_websockets: config.allow_websockets,
            allow_public_unauthenticated_access: config.allow_public_unauthenticated_access,
            cors_allow_preflight: config.cors_allow_preflight,
            upstream_timeout: config.timeout_ms.map(Duration::from_millis),
            set_request_headers: request_headers(config)?,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Structural checks on an assembled policy.
    pub fn validate(&self) -> Result<(), PolicyError> {
        for (field, url) in [("from", &self.source), ("to", &self.destination)] {
            if !matches!(url.scheme(), "http" | "https") {
                return Err(PolicyError::Url {
                    field,
                    reason: format!("unsupported scheme '{}'", url.scheme()),
                });
            }
            if url.host_str().map_or(true, str::is_empty) {
                return Err(PolicyError::Url {
                    field,
                    reason: "missing host".into(),
                });
            }
        }

        if !matches!(self.source.path(), "" | "/") || self.source.query().is_some() {
            return Err(PolicyError::Url {
                field: "from",
                reason: "only a host may be matched; remove path and query".into(),
            });
        }

        if self.upstream_timeout.is_some_and(|t| t.is_zero()) {
            return Err(PolicyError::Timeout);
        }
        Ok(())
    }

    /// Host key this policy is served under (lowercase, port only if explicit).
    pub fn source_host(&self) -> String {
        let host = self.source.host_str().unwrap_or_default().to_ascii_lowercase();
        match self.source.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host,
        }
    }

    /// Destination authority, used for timeouts, metrics and assertion audience.
    pub fn destination_host(&self) -> String {
        let host = self.destination.host_str().unwrap_or_default();
        match self.destination.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination)
    }
}

fn parse_url(field: &'static str, raw: &str) -> Result<Url, PolicyError> {
    Url::parse(raw).map_err(|e| PolicyError::Url {
        field,
        reason: e.to_string(),
    })
}

fn tls_settings(config: &PolicyConfig) -> Result<TlsSettings, PolicyError> {
    let root_cas = match &config.tls_custom_ca_file {
        Some(path) => {
            let mut store = RootCertStore::empty();
            let certs = load_certs(Path::new(path))
                .map_err(|e| PolicyError::Tls(format!("custom ca {}: {}", path, e)))?;
            for cert in certs {
                store
                    .add(cert)
                    .map_err(|e| PolicyError::Tls(format!("custom ca {}: {}", path, e)))?;
            }
            Some(Arc::new(store))
        }
        None => None,
    };

    let client_identity = match (&config.tls_client_cert_file, &config.tls_client_key_file) {
        (Some(cert), Some(key)) => {
            let certs = load_certs(Path::new(cert))
                .map_err(|e| PolicyError::Tls(format!("client cert {}: {}", cert, e)))?;
            let key = load_private_key(Path::new(key))
                .map_err(|e| PolicyError::Tls(format!("client key {}: {}", key, e)))?;
            Some(Arc::new(ClientIdentity { certs, key }))
        }
        (None, None) => None,
        _ => {
            return Err(PolicyError::Tls(
                "client certificate and key must be set together".into(),
            ))
        }
    };

    let server_name = match &config.tls_server_name {
        Some(name) => Some(
            ServerName::try_from(name.clone())
                .map_err(|e| PolicyError::Tls(format!("server name {}: {}", name, e)))?,
        ),
        None => None,
    };

    Ok(TlsSettings {
        skip_verify: config.tls_skip_verify,
        root_cas,
        client_identity,
        server_name,
    })
}

fn request_headers(config: &PolicyConfig) -> Result<HeaderMap, PolicyError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.set_request_headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| PolicyError::Header(format!("{}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| PolicyError::Header(format!("{}: {}", name, e)))?;
        headers.insert(name, value);
    }
    Ok(headers)
}
