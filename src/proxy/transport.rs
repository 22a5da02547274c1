//! Upstream transports.
//!
//! # Responsibilities
//! - Build the shared baseline client (HTTP and HTTPS with webpki roots)
//! - Build a policy-specific TLS client only when a policy overrides TLS
//! - Record upstream request counts and latencies per destination
//!
//! # Design Decisions
//! - Policies without TLS overrides share one client and its connection pool
//! - The crypto provider is passed explicitly, never taken from process state

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, Response};
use hyper::body::Incoming;
use hyper_rustls::{FixedServerNameResolver, HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::observability::metrics;
use crate::proxy::policy::{Policy, TlsSettings};

/// Pooled upstream client.
pub type UpstreamClient = Client<HttpsConnector<HttpConnector>, Body>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("tls configuration: {0}")]
    Tls(#[from] rustls::Error),
}

/// Builds upstream transports for policies.
#[derive(Clone)]
pub struct TransportFactory {
    provider: Arc<CryptoProvider>,
    connect_timeout: Duration,
    baseline: UpstreamClient,
}

impl TransportFactory {
    pub fn new(connect_timeout: Duration) -> Result<Self, TransportError> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let tls = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(webpki_root_store())
            .with_no_client_auth();

        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector(connect_timeout));

        Ok(Self {
            provider,
            connect_timeout,
            baseline: Client::builder(TokioExecutor::new()).build(connector),
        })
    }

    /// Transport for `policy`: the shared baseline unless TLS is overridden.
    pub fn for_policy(&self, policy: &Policy) -> Result<InstrumentedTransport, TransportError> {
        let destination = policy.destination_host();
        let client = if policy.tls.is_custom() {
            if policy.tls.skip_verify {
                tracing::warn!(policy = %policy, "TLS verification disabled for route");
            }
            tracing::debug!(policy = %policy, tls = ?policy.tls, "Custom upstream TLS settings");
            self.custom_client(&policy.tls)?
        } else {
            self.baseline.clone()
        };

        Ok(InstrumentedTransport {
            client,
            destination: Arc::from(destination),
        })
    }

    fn custom_client(&self, settings: &TlsSettings) -> Result<UpstreamClient, TransportError> {
        let builder = ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()?;

        let builder = if settings.skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier(self.provider.clone())))
        } else {
            let roots = match &settings.root_cas {
                Some(roots) => roots.as_ref().clone(),
                None => webpki_root_store(),
            };
            builder.with_root_certificates(roots)
        };

        let tls = match &settings.client_identity {
            Some(identity) => {
                builder.with_client_auth_cert(identity.certs.clone(), identity.key.clone_key())?
            }
            None => builder.with_no_client_auth(),
        };

        let builder = HttpsConnectorBuilder::new().with_tls_config(tls).https_or_http();
        let connector = match &settings.server_name {
            Some(name) => builder
                .with_server_name_resolver(FixedServerNameResolver::new(name.clone()))
                .enable_http1()
                .wrap_connector(http_connector(self.connect_timeout)),
            None => builder
                .enable_http1()
                .wrap_connector(http_connector(self.connect_timeout)),
        };

        Ok(Client::builder(TokioExecutor::new()).build(connector))
    }
}

impl std::fmt::Debug for TransportFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportFactory")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

/// Client bound to one destination that records metrics for every exchange.
#[derive(Clone)]
pub struct InstrumentedTransport {
    client: UpstreamClient,
    destination: Arc<str>,
}

impl InstrumentedTransport {
    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub async fn request(
        &self,
        request: Request<Body>,
    ) -> Result<Response<Incoming>, hyper_util::client::legacy::Error> {
        let start = Instant::now();
        let method = request.method().clone();
        let result = self.client.request(request).await;

        let status = match &result {
            Ok(response) => response.status().as_u16(),
            Err(_) => 0,
        };
        metrics::record_upstream(&self.destination, method.as_str(), status, start);
        result
    }
}

impl std::fmt::Debug for InstrumentedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentedTransport")
            .field("destination", &self.destination)
            .finish_non_exhaustive()
    }
}

fn http_connector(connect_timeout: Duration) -> HttpConnector {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(connect_timeout));
    http
}

fn webpki_root_store() -> RootCertStore {
    RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    }
}

/// Accepts any server certificate. Only installed for `tls_skip_verify` routes.
#[derive(Debug)]
struct NoVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;

    fn policy(to: &str) -> PolicyConfig {
        PolicyConfig {
            from: "https://app.example.com".into(),
            to: to.into(),
            ..Default::default()
        }
    }

    #[test]
    fn baseline_for_plain_policies() {
        let factory = TransportFactory::new(Duration::from_secs(1)).unwrap();
        let p = Policy::from_config(&policy("http://app.internal:8080")).unwrap();
        let transport = factory.for_policy(&p).unwrap();
        assert_eq!(transport.destination(), "app.internal:8080");
    }

    #[test]
    fn custom_client_for_tls_overrides() {
        let factory = TransportFactory::new(Duration::from_secs(1)).unwrap();

        let mut c = policy("https://app.internal");
        c.tls_skip_verify = true;
        c.tls_server_name = Some("app.example.com".into());
        let p = Policy::from_config(&c).unwrap();
        assert!(factory.for_policy(&p).is_ok());
    }
}
