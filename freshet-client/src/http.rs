//! HTTP implementation of the Resource Access Facade.
//!
//! Talks to the server's `/api/v1/resources/:key` routes. A `404` maps to
//! [`AccessError::NotFound`], a `400`/`409` on write to
//! [`AccessError::Rejected`]; everything else that is not a success is
//! treated as transient.

use std::time::Duration;

use async_trait::async_trait;
use freshet_core::{AccessError, Payload, ResourceAccess, ResourceKey, ResourceStore};
use reqwest::StatusCode;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ResourceBody {
    payload: Payload,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

#[derive(Debug, Clone)]
pub struct HttpResourceAccess {
    client: reqwest::Client,
    base_url: String,
}

impl HttpResourceAccess {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn resource_url(&self, key: &ResourceKey) -> String {
        format!(
            "{}/api/v1/resources/{}",
            self.base_url,
            urlencoding::encode(key.as_str())
        )
    }

    async fn parse_response(
        &self,
        key: &ResourceKey,
        response: reqwest::Response,
    ) -> Result<Payload, AccessError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<ResourceBody>()
                .await
                .map(|body| body.payload)
                .map_err(|e| transient(key, e));
        }

        let text = response.text().await.unwrap_or_default();
        let reason = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => format!("{}: {}", body.code, body.message),
            Err(_) => format!("HTTP {}: {}", status.as_u16(), text),
        };
        Err(match status {
            StatusCode::NOT_FOUND => AccessError::NotFound {
                key: key.to_string(),
            },
            StatusCode::BAD_REQUEST | StatusCode::CONFLICT => AccessError::Rejected {
                key: key.to_string(),
                reason,
            },
            _ => AccessError::Transient {
                key: key.to_string(),
                reason,
            },
        })
    }
}

fn transient(key: &ResourceKey, err: reqwest::Error) -> AccessError {
    AccessError::Transient {
        key: key.to_string(),
        reason: err.to_string(),
    }
}

#[async_trait]
impl ResourceAccess for HttpResourceAccess {
    async fn read(&self, key: &ResourceKey) -> Result<Payload, AccessError> {
        let response = self
            .client
            .get(self.resource_url(key))
            .send()
            .await
            .map_err(|e| transient(key, e))?;
        self.parse_response(key, response).await
    }
}

#[async_trait]
impl ResourceStore for HttpResourceAccess {
    async fn write(&self, key: &ResourceKey, payload: Payload) -> Result<Payload, AccessError> {
        let response = self
            .client
            .put(self.resource_url(key))
            .json(&payload)
            .send()
            .await
            .map_err(|e| transient(key, e))?;
        self.parse_response(key, response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_url_encodes_key() {
        let access = HttpResourceAccess::with_client(reqwest::Client::new(), "http://localhost:3000/");
        let key = ResourceKey::new("user 42/profile").expect("valid key");
        assert_eq!(
            access.resource_url(&key),
            "http://localhost:3000/api/v1/resources/user%2042%2Fprofile"
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let access = HttpResourceAccess::new("http://127.0.0.1:1", Duration::from_millis(500))
            .expect("client");
        let key = ResourceKey::new("U1").expect("valid key");
        let err = access.read(&key).await.expect_err("nothing listens on port 1");
        assert!(err.is_transient());
    }
}
