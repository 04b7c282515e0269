use std::env;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::AgentConfig;
use crate::gcp::GcpError;

const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
/// Refresh this long before the provider-reported expiry.
const EXPIRY_SKEW: Duration = Duration::from_secs(60);

/// Application Default Credentials token source with in-process caching.
///
/// Resolution order matches the gcloud SDK: `GOOGLE_APPLICATION_CREDENTIALS`,
/// then the gcloud ADC file, then the GCE metadata server.
pub struct TokenSource {
    http: reqwest::Client,
    token_endpoint: String,
    kind: CredentialKind,
    cached: Mutex<Option<CachedToken>>,
}

enum CredentialKind {
    AuthorizedUser {
        client_id: String,
        client_secret: String,
        refresh_token: String,
    },
    ServiceAccount {
        client_email: String,
        private_key_pem: String,
        token_uri: Option<String>,
    },
    Metadata,
    Fixed(String),
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct CredentialFile {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    client_secret: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    client_email: String,
    #[serde(default)]
    private_key: String,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

impl TokenSource {
    pub fn from_environment(http: reqwest::Client, cfg: &AgentConfig) -> anyhow::Result<Self> {
        let kind = match credential_file_path() {
            Some(path) => {
                let data = std::fs::read(&path)
                    .with_context(|| format!("read credentials {}", path.display()))?;
                let file: CredentialFile =
                    serde_json::from_slice(&data).context("parse credentials file")?;
                match file.kind.as_str() {
                    "authorized_user" => CredentialKind::AuthorizedUser {
                        client_id: file.client_id,
                        client_secret: file.client_secret,
                        refresh_token: file.refresh_token,
                    },
                    "service_account" => CredentialKind::ServiceAccount {
                        client_email: file.client_email,
                        private_key_pem: file.private_key,
                        token_uri: file.token_uri,
                    },
                    other => anyhow::bail!("unsupported credential type: {other}"),
                }
            }
            None => CredentialKind::Metadata,
        };

        Ok(Self {
            http,
            token_endpoint: cfg.oauth_token_endpoint.clone(),
            kind,
            cached: Mutex::new(None),
        })
    }

    pub fn fixed(http: reqwest::Client, token: &str) -> Self {
        Self {
            http,
            token_endpoint: String::new(),
            kind: CredentialKind::Fixed(token.to_string()),
            cached: Mutex::new(None),
        }
    }

    /// Returns a bearer token, refreshing through the credential flow when
    /// the cached one is within the expiry skew.
    pub async fn token(&self) -> Result<String, GcpError> {
        if let CredentialKind::Fixed(token) = &self.kind {
            return Ok(token.clone());
        }

        let mut cached = self.cached.lock().await;
        if let Some(entry) = cached.as_ref() {
            if entry.expires_at > Instant::now() {
                return Ok(entry.token.clone());
            }
        }

        let fetched = self.fetch().await?;
        let token = fetched.access_token.clone();
        let lifetime = Duration::from_secs(fetched.expires_in).saturating_sub(EXPIRY_SKEW);
        *cached = Some(CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        debug!(expires_in = fetched.expires_in, "access token refreshed");
        Ok(token)
    }

    async fn fetch(&self) -> Result<TokenResponse, GcpError> {
        match &self.kind {
            CredentialKind::AuthorizedUser {
                client_id,
                client_secret,
                refresh_token,
            } => {
                let params = [
                    ("grant_type", "refresh_token"),
                    ("client_id", client_id.as_str()),
                    ("client_secret", client_secret.as_str()),
                    ("refresh_token", refresh_token.as_str()),
                ];
                self.exchange(&self.token_endpoint, &params).await
            }
            CredentialKind::ServiceAccount {
                client_email,
                private_key_pem,
                token_uri,
            } => {
                let endpoint = token_uri.as_deref().unwrap_or(&self.token_endpoint);
                let assertion = signed_jwt(client_email, private_key_pem, endpoint)
                    .map_err(|err| GcpError::Auth(format!("sign JWT assertion: {err}")))?;
                let params = [
                    ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                    ("assertion", assertion.as_str()),
                ];
                self.exchange(endpoint, &params).await
            }
            CredentialKind::Metadata => {
                let res = self
                    .http
                    .get(METADATA_TOKEN_URL)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await?;
                if !res.status().is_success() {
                    return Err(GcpError::Auth(format!(
                        "metadata server returned {}",
                        res.status()
                    )));
                }
                Ok(res.json::<TokenResponse>().await?)
            }
            CredentialKind::Fixed(_) => unreachable!("fixed tokens never hit fetch"),
        }
    }

    async fn exchange(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<TokenResponse, GcpError> {
        let res = self.http.post(endpoint).form(params).send().await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(GcpError::Auth(format!(
                "token endpoint returned {status}: {body}"
            )));
        }
        Ok(res.json::<TokenResponse>().await?)
    }
}

fn credential_file_path() -> Option<PathBuf> {
    if let Ok(path) = env::var("GOOGLE_APPLICATION_CREDENTIALS") {
        return Some(PathBuf::from(path));
    }
    let base = directories::BaseDirs::new()?;
    let adc = base
        .config_dir()
        .join("gcloud")
        .join("application_default_credentials.json");
    adc.exists().then_some(adc)
}

/// RS256 service-account assertion for the jwt-bearer grant.
fn signed_jwt(client_email: &str, private_key_pem: &str, audience: &str) -> anyhow::Result<String> {
    let key = rsa::RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .context("parse service account private key")?;
    let signing_key = rsa::pkcs1v15::SigningKey::<sha2::Sha256>::new(key);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before epoch")?
        .as_secs();

    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(
        serde_json::json!({
            "iss": client_email,
            "scope": CLOUD_PLATFORM_SCOPE,
            "aud": audience,
            "iat": now,
            "exp": now + 3600,
        })
        .to_string(),
    );

    let signing_input = format!("{header}.{claims}");
    let signature = signing_key.sign(signing_input.as_bytes());
    Ok(format!(
        "{signing_input}.{}",
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};
    use rsa::pkcs8::EncodePrivateKey;

    fn source_with_kind(kind: CredentialKind, endpoint: &str) -> TokenSource {
        TokenSource {
            http: reqwest::Client::new(),
            token_endpoint: endpoint.to_string(),
            kind,
            cached: Mutex::new(None),
        }
    }

    #[tokio::test]
    async fn fixed_token_skips_the_network() {
        let source = TokenSource::fixed(reqwest::Client::new(), "static-token");
        assert_eq!(source.token().await.expect("token"), "static-token");
    }

    #[tokio::test]
    async fn authorized_user_refresh_grant_is_cached() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/token")
                .body_contains("grant_type=refresh_token")
                .body_contains("refresh_token=rt-1");
            then.status(200).json_body(serde_json::json!({
                "access_token": "at-1",
                "expires_in": 3600,
                "token_type": "Bearer"
            }));
        });

        let source = source_with_kind(
            CredentialKind::AuthorizedUser {
                client_id: "cid".into(),
                client_secret: "cs".into(),
                refresh_token: "rt-1".into(),
            },
            &server.url("/token"),
        );

        assert_eq!(source.token().await.expect("first"), "at-1");
        assert_eq!(source.token().await.expect("second"), "at-1");
        assert_eq!(mock.hits(), 1, "second call must come from the cache");
    }

    #[tokio::test]
    async fn expired_cache_refreshes() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(200).json_body(serde_json::json!({
                "access_token": "short-lived",
                "expires_in": 1,
                "token_type": "Bearer"
            }));
        });

        let source = source_with_kind(
            CredentialKind::AuthorizedUser {
                client_id: "cid".into(),
                client_secret: "cs".into(),
                refresh_token: "rt".into(),
            },
            &server.url("/token"),
        );

        source.token().await.expect("first");
        // expires_in=1 is inside the refresh skew, so the next call refetches.
        source.token().await.expect("second");
        assert_eq!(mock.hits(), 2);
    }

    #[tokio::test]
    async fn refresh_failure_is_an_auth_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(400).body(r#"{"error":"invalid_grant"}"#);
        });

        let source = source_with_kind(
            CredentialKind::AuthorizedUser {
                client_id: "cid".into(),
                client_secret: "cs".into(),
                refresh_token: "stale".into(),
            },
            &server.url("/token"),
        );

        let err = source.token().await.expect_err("must fail");
        assert!(err.is_auth_error(), "got: {err}");
    }

    #[tokio::test]
    async fn service_account_sends_jwt_assertion() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/token")
                .body_contains("urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer");
            then.status(200).json_body(serde_json::json!({
                "access_token": "sa-token",
                "expires_in": 3600,
                "token_type": "Bearer"
            }));
        });

        let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("test key");
        let pem = key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .expect("pem")
            .to_string();

        let source = source_with_kind(
            CredentialKind::ServiceAccount {
                client_email: "svc@proj.iam.gserviceaccount.com".into(),
                private_key_pem: pem,
                token_uri: Some(server.url("/token")),
            },
            &server.url("/token"),
        );

        assert_eq!(source.token().await.expect("token"), "sa-token");
        mock.assert();
    }

    #[test]
    fn jwt_assertion_has_three_segments() {
        let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("test key");
        let pem = key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .expect("pem")
            .to_string();

        let jwt = signed_jwt("svc@p.iam.gserviceaccount.com", &pem, "https://aud").expect("jwt");
        assert_eq!(jwt.split('.').count(), 3);

        let claims = jwt.split('.').nth(1).expect("claims segment");
        let decoded = URL_SAFE_NO_PAD.decode(claims).expect("base64url");
        let parsed: serde_json::Value = serde_json::from_slice(&decoded).expect("claims json");
        assert_eq!(parsed["scope"], CLOUD_PLATFORM_SCOPE);
        assert_eq!(parsed["aud"], "https://aud");
    }
}
