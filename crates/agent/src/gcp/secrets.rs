use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::gcp::{Gcp, GcpError};

#[derive(Debug, Serialize)]
struct AddVersionRequest {
    payload: SecretPayload,
}

#[derive(Debug, Serialize)]
struct SecretPayload {
    data: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecretVersion {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
}

impl Gcp {
    /// Appends a new version to an existing secret. Prior versions are kept;
    /// the remote host reads `latest` at boot.
    pub async fn add_secret_version(
        &self,
        project: &str,
        secret_id: &str,
        data: &[u8],
    ) -> Result<SecretVersion, GcpError> {
        let url = self.secretmanager_url(&format!(
            "/projects/{project}/secrets/{secret_id}:addVersion"
        ));
        let body = AddVersionRequest {
            payload: SecretPayload {
                data: STANDARD.encode(data),
            },
        };
        self.post_json(&url, Some(&body)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};

    fn client(server: &MockServer) -> Gcp {
        Gcp::with_static_token(&server.url(""), &server.url(""), "test-token")
    }

    #[tokio::test]
    async fn add_version_base64_encodes_the_payload() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/projects/p/secrets/private-llm-server-cert:addVersion")
                .body_contains(&STANDARD.encode(b"PEM BYTES"));
            then.status(200).json_body(serde_json::json!({
                "name": "projects/p/secrets/private-llm-server-cert/versions/7",
                "state": "ENABLED"
            }));
        });

        let version = client(&server)
            .add_secret_version("p", "private-llm-server-cert", b"PEM BYTES")
            .await
            .expect("version");
        assert!(version.name.ends_with("/versions/7"));
        mock.assert();
    }

    #[tokio::test]
    async fn provider_error_surfaces_with_message() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST)
                .path("/projects/p/secrets/private-llm-internal-token:addVersion");
            then.status(403)
                .body(r#"{"error":{"code":403,"message":"permission denied"}}"#);
        });

        let err = client(&server)
            .add_secret_version("p", "private-llm-internal-token", b"t")
            .await
            .expect_err("must fail");
        assert!(err.is_auth_error());
        assert!(err.to_string().contains("permission denied"), "got: {err}");
    }
}
