//! HTTP client for the authorization service.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use url::Url;

use crate::authorize::{AuthorizeError, Authorizer, Decision, RouteRequest};
use crate::sessions::SessionState;

#[derive(Serialize)]
struct AuthorizeBody<'a> {
    identity: &'a SessionState,
    route: &'a RouteRequest,
}

/// Posts `{identity, route}` to `{base}/authorize` with the shared secret.
#[derive(Clone)]
pub struct HttpAuthorizer {
    client: reqwest::Client,
    endpoint: Url,
    shared_secret: String,
}

impl HttpAuthorizer {
    pub fn new(base: &Url, shared_secret: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;

        let mut endpoint = base.clone();
        endpoint.set_path(&format!("{}/authorize", base.path().trim_end_matches('/')));

        Ok(Self {
            client,
            endpoint,
            shared_secret: shared_secret.into(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl std::fmt::Debug for HttpAuthorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAuthorizer")
            .field("endpoint", &self.endpoint.as_str())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Authorizer for HttpAuthorizer {
    async fn authorize(
        &self,
        identity: &SessionState,
        route: &RouteRequest,
    ) -> Result<Decision, AuthorizeError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.shared_secret)
            .json(&AuthorizeBody { identity, route })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AuthorizeError::Timeout
                } else {
                    AuthorizeError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthorizeError::Status(status.as_u16()));
        }

        response
            .json::<Decision>()
            .await
            .map_err(|e| AuthorizeError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_base_path() {
        let base = Url::parse("https://authz.example.com/api/").unwrap();
        let authorizer = HttpAuthorizer::new(&base, "secret", Duration::from_secs(1)).unwrap();
        assert_eq!(authorizer.endpoint().as_str(), "https://authz.example.com/api/authorize");

        let base = Url::parse("https://authz.example.com").unwrap();
        let authorizer = HttpAuthorizer::new(&base, "secret", Duration::from_secs(1)).unwrap();
        assert_eq!(authorizer.endpoint().as_str(), "https://authz.example.com/authorize");
    }
}
