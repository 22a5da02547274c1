//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate secrets, service URLs and value ranges
//! - Validate every policy and detect conflicting source hosts
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system
//! - TLS files are checked when the routing table loads them, not here

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use url::Url;

use crate::config::schema::{GatewayConfig, PolicyConfig};
use crate::security::Signer;
use crate::sessions::codec::{decode_secret, KEY_SIZE};

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_body_bytes == 0 {
        errors.push(ValidationError::new("listener.max_body_bytes", "must be greater than zero"));
    }

    let session = &config.session;
    if session.cookie_name.is_empty() {
        errors.push(ValidationError::new("session.cookie_name", "is required"));
    }
    match decode_secret(&session.cookie_secret) {
        Ok(key) if key.len() == KEY_SIZE => {}
        Ok(key) => errors.push(ValidationError::new(
            "session.cookie_secret",
            format!("must decode to {} bytes, got {}", KEY_SIZE, key.len()),
        )),
        Err(_) => errors.push(ValidationError::new("session.cookie_secret", "must be base64")),
    }
    if session.header_scheme.trim().is_empty() {
        errors.push(ValidationError::new("session.header_scheme", "is required"));
    }
    if session.query_param.trim().is_empty() {
        errors.push(ValidationError::new("session.query_param", "is required"));
    }

    let services = &config.services;
    check_url(&mut errors, "services.authenticate_url", &services.authenticate_url);
    check_url(&mut errors, "services.authorize_url", &services.authorize_url);
    if let Some(url) = &services.forward_auth_url {
        check_url(&mut errors, "services.forward_auth_url", url);
    }
    if services.shared_secret.is_empty() {
        errors.push(ValidationError::new("services.shared_secret", "is required"));
    }

    for (field, value) in [
        ("timeouts.default_upstream_ms", config.timeouts.default_upstream_ms),
        ("timeouts.authorize_ms", config.timeouts.authorize_ms),
        ("timeouts.connect_ms", config.timeouts.connect_ms),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than zero"));
        }
    }

    if let Some(key) = config.signing_key.as_deref().filter(|k| !k.trim().is_empty()) {
        if let Err(e) = Signer::new(key, "validation") {
            errors.push(ValidationError::new("signing_key", e.to_string()));
        }
    }

    let mut hosts = HashSet::new();
    for (index, policy) in config.policies.iter().enumerate() {
        validate_policy(&mut errors, index, policy, &mut hosts);
    }

    let observability = &config.observability;
    if !matches!(observability.log_format.as_str(), "pretty" | "json") {
        errors.push(ValidationError::new(
            "observability.log_format",
            "must be 'pretty' or 'json'",
        ));
    }
    if observability.metrics_enabled && observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_policy(
    errors: &mut Vec<ValidationError>,
    index: usize,
    policy: &PolicyConfig,
    hosts: &mut HashSet<String>,
) {
    let field = |name: &str| format!("policies[{}].{}", index, name);

    if let Some(from) = check_url(errors, &field("from"), &policy.from) {
        if !matches!(from.path(), "" | "/") || from.query().is_some() {
            errors.push(ValidationError::new(field("from"), "must not have a path or query"));
        }
        let host = match from.port() {
            Some(port) => format!("{}:{}", from.host_str().unwrap_or_default(), port),
            None => from.host_str().unwrap_or_default().to_string(),
        };
        if !hosts.insert(host.clone()) {
            errors.push(ValidationError::new(
                field("from"),
                format!("host '{}' is already routed", host),
            ));
        }
    }
    check_url(errors, &field("to"), &policy.to);

    if policy.timeout_ms == Some(0) {
        errors.push(ValidationError::new(field("timeout_ms"), "must be greater than zero"));
    }
    if policy.tls_client_cert_file.is_some() != policy.tls_client_key_file.is_some() {
        errors.push(ValidationError::new(
            field("tls_client_cert_file"),
            "client certificate and key must be set together",
        ));
    }
}

fn check_url(errors: &mut Vec<ValidationError>, field: &str, raw: &str) -> Option<Url> {
    match Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() => Some(url),
        Ok(_) => {
            errors.push(ValidationError::new(field, format!("'{}' is not an http(s) url", raw)));
            None
        }
        Err(e) => {
            errors.push(ValidationError::new(field, format!("'{}': {}", raw, e)));
            None
        }
    }
}
