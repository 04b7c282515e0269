use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::AgentConfig;

pub mod auth;
pub mod compute;
pub mod secrets;

/// Provider API failure, classified so the ops loop can tell "create it"
/// (404) apart from "re-authenticate" (401/403/invalid_grant).
#[derive(Debug, Error)]
pub enum GcpError {
    #[error("{method} {url} returned {status}: {message}")]
    Api {
        method: &'static str,
        url: String,
        status: StatusCode,
        message: String,
    },
    #[error("auth: {0}")]
    Auth(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl GcpError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            GcpError::Api {
                status: StatusCode::NOT_FOUND,
                ..
            }
        )
    }

    pub fn is_auth_error(&self) -> bool {
        match self {
            GcpError::Auth(_) => true,
            GcpError::Api { status, .. } => {
                *status == StatusCode::UNAUTHORIZED || *status == StatusCode::FORBIDDEN
            }
            GcpError::Http(_) => false,
        }
    }
}

/// Shared provider client: one HTTP connection pool and one cached OAuth
/// token for every poll tick, instead of a token-endpoint round trip each
/// time the status loop fires.
pub struct Gcp {
    http: reqwest::Client,
    tokens: auth::TokenSource,
    compute_endpoint: String,
    secretmanager_endpoint: String,
}

impl Gcp {
    pub fn new(cfg: &AgentConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().build()?;
        let tokens = auth::TokenSource::from_environment(http.clone(), cfg)?;
        Ok(Self {
            http,
            tokens,
            compute_endpoint: cfg.compute_endpoint.trim_end_matches('/').to_string(),
            secretmanager_endpoint: cfg.secretmanager_endpoint.trim_end_matches('/').to_string(),
        })
    }

    /// Client with a fixed bearer token, for tests against a mock server.
    pub fn with_static_token(
        compute_endpoint: &str,
        secretmanager_endpoint: &str,
        token: &str,
    ) -> Self {
        let http = reqwest::Client::new();
        Self {
            tokens: auth::TokenSource::fixed(http.clone(), token),
            http,
            compute_endpoint: compute_endpoint.trim_end_matches('/').to_string(),
            secretmanager_endpoint: secretmanager_endpoint.trim_end_matches('/').to_string(),
        }
    }

    pub(crate) fn compute_url(&self, path: &str) -> String {
        format!("{}{}", self.compute_endpoint, path)
    }

    pub(crate) fn secretmanager_url(&self, path: &str) -> String {
        format!("{}{}", self.secretmanager_endpoint, path)
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, GcpError> {
        let token = self.tokens.token().await?;
        let res = self.http.get(url).bearer_auth(token).send().await?;
        Self::decode("GET", url, res).await
    }

    pub(crate) async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: &str,
        body: Option<&B>,
    ) -> Result<T, GcpError> {
        let token = self.tokens.token().await?;
        let mut req = self.http.post(url).bearer_auth(token);
        if let Some(body) = body {
            req = req.json(body);
        } else {
            req = req.header(reqwest::header::CONTENT_LENGTH, "0");
        }
        let res = req.send().await?;
        Self::decode("POST", url, res).await
    }

    pub(crate) async fn patch_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, GcpError> {
        let token = self.tokens.token().await?;
        let res = self
            .http
            .patch(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        Self::decode("PATCH", url, res).await
    }

    pub(crate) async fn delete_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, GcpError> {
        let token = self.tokens.token().await?;
        let res = self.http.delete(url).bearer_auth(token).send().await?;
        Self::decode("DELETE", url, res).await
    }

    async fn decode<T: DeserializeOwned>(
        method: &'static str,
        url: &str,
        res: reqwest::Response,
    ) -> Result<T, GcpError> {
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            let message = parse_api_error(&body).unwrap_or(body);
            debug!(method, url, %status, %message, "provider API error");
            return Err(GcpError::Api {
                method,
                url: url.to_string(),
                status,
                message,
            });
        }
        Ok(res.json::<T>().await?)
    }
}

/// Pulls `error.message` out of a standard Google error envelope.
fn parse_api_error(body: &str) -> Option<String> {
    #[derive(serde::Deserialize)]
    struct Inner {
        message: String,
    }
    #[derive(serde::Deserialize)]
    struct Envelope {
        error: Inner,
    }
    serde_json::from_str::<Envelope>(body)
        .ok()
        .map(|e| e.error.message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_classification() {
        let err = GcpError::Api {
            method: "GET",
            url: "http://x".into(),
            status: StatusCode::NOT_FOUND,
            message: "missing".into(),
        };
        assert!(err.is_not_found());
        assert!(!err.is_auth_error());
    }

    #[test]
    fn auth_classification() {
        for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
            let err = GcpError::Api {
                method: "GET",
                url: "http://x".into(),
                status,
                message: "denied".into(),
            };
            assert!(err.is_auth_error());
        }
        assert!(GcpError::Auth("invalid_grant".into()).is_auth_error());
    }

    #[test]
    fn error_envelope_message_is_extracted() {
        let body = r#"{"error":{"code":404,"message":"instance not found","status":"NOT_FOUND"}}"#;
        assert_eq!(parse_api_error(body).as_deref(), Some("instance not found"));
        assert_eq!(parse_api_error("plain text"), None);
    }
}
