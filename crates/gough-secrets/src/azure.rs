//! Azure Key Vault backend.
//!
//! Key Vault secret names allow only alphanumerics and hyphens, so logical
//! paths are normalized with [`crate::paths::normalize_name`] at this
//! boundary. The original `/`-delimited path is stored in a secret tag so
//! `list` can return logical paths.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Result, SecretsError};
use crate::paths::normalize_name;
use crate::{SecretMap, SecretsBackend};

const API_VERSION: &str = "7.4";
const PATH_TAG: &str = "gough-path";

/// Secrets backend speaking the Azure Key Vault REST API.
pub struct AzureKeyVaultBackend {
    client: reqwest::Client,
    vault_url: String,
    access_token: String,
}

#[derive(Deserialize)]
struct SecretBundle {
    value: String,
}

#[derive(Deserialize)]
struct SecretListResponse {
    value: Vec<SecretItem>,
    #[serde(rename = "nextLink")]
    next_link: Option<String>,
}

#[derive(Deserialize)]
struct SecretItem {
    #[serde(default)]
    tags: Option<std::collections::HashMap<String, String>>,
}

impl AzureKeyVaultBackend {
    /// Create a backend for the given vault URL and OAuth access token.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(vault_url: String, access_token: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| SecretsError::Backend(e.to_string()))?;
        Ok(Self {
            client,
            vault_url: vault_url.trim_end_matches('/').to_string(),
            access_token,
        })
    }

    fn secret_url(&self, path: &str) -> String {
        format!(
            "{}/secrets/{}?api-version={API_VERSION}",
            self.vault_url,
            normalize_name(path)
        )
    }
}

#[async_trait]
impl SecretsBackend for AzureKeyVaultBackend {
    async fn get(&self, path: &str) -> Result<SecretMap> {
        let response = self
            .client
            .get(self.secret_url(path))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| SecretsError::Backend(e.to_string()))?;

        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Err(SecretsError::NotFound(path.to_string())),
            status if status.is_success() => {
                let bundle: SecretBundle = response
                    .json()
                    .await
                    .map_err(|e| SecretsError::Malformed(path.to_string(), e.to_string()))?;
                serde_json::from_str(&bundle.value)
                    .map_err(|e| SecretsError::Malformed(path.to_string(), e.to_string()))
            }
            status => Err(SecretsError::Backend(format!(
                "key vault returned {status} for {path}"
            ))),
        }
    }

    async fn set(&self, path: &str, data: SecretMap) -> Result<()> {
        let value = serde_json::to_string(&data)
            .map_err(|e| SecretsError::Malformed(path.to_string(), e.to_string()))?;
        let response = self
            .client
            .put(self.secret_url(path))
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({
                "value": value,
                "tags": { PATH_TAG: path },
            }))
            .send()
            .await
            .map_err(|e| SecretsError::Backend(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(SecretsError::Backend(format!(
                "key vault returned {} writing {path}",
                response.status()
            )))
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.secret_url(path))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| SecretsError::Backend(e.to_string()))?;

        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(SecretsError::Backend(format!(
                "key vault returned {} deleting {path}",
                response.status()
            )))
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut url = format!("{}/secrets?api-version={API_VERSION}", self.vault_url);
        let mut paths = Vec::new();

        loop {
            let response = self
                .client
                .get(&url)
                .bearer_auth(&self.access_token)
                .send()
                .await
                .map_err(|e| SecretsError::Backend(e.to_string()))?;

            if !response.status().is_success() {
                return Err(SecretsError::Backend(format!(
                    "key vault returned {} listing secrets",
                    response.status()
                )));
            }

            let page: SecretListResponse = response
                .json()
                .await
                .map_err(|e| SecretsError::Malformed(prefix.to_string(), e.to_string()))?;

            for item in page.value {
                if let Some(path) = item.tags.and_then(|mut t| t.remove(PATH_TAG)) {
                    if path.starts_with(prefix) {
                        paths.push(path);
                    }
                }
            }

            match page.next_link {
                Some(next) => url = next,
                None => break,
            }
        }

        paths.sort_unstable();
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn get_uses_normalized_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/secrets/ssh-ca-default-private-key"))
            .and(query_param("api-version", API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": "{\"pem\":\"data\"}"
            })))
            .mount(&server)
            .await;

        let backend =
            AzureKeyVaultBackend::new(server.uri(), "token".into()).unwrap();
        let value = backend.get("ssh-ca/default/private_key").await.unwrap();
        assert_eq!(value["pem"], "data");
    }

    #[tokio::test]
    async fn list_filters_by_logical_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/secrets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [
                    { "tags": { "gough-path": "cloud/aws/credentials" } },
                    { "tags": { "gough-path": "ssh-ca/default/private_key" } },
                    { "tags": {} }
                ]
            })))
            .mount(&server)
            .await;

        let backend =
            AzureKeyVaultBackend::new(server.uri(), "token".into()).unwrap();
        let paths = backend.list("cloud/").await.unwrap();
        assert_eq!(paths, vec!["cloud/aws/credentials"]);
    }
}
