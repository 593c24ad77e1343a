//! HashiCorp Vault KV v2 backend.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Result, SecretsError};
use crate::{SecretMap, SecretsBackend};

/// Secrets backend speaking the Vault KV version 2 HTTP API.
pub struct VaultBackend {
    client: reqwest::Client,
    addr: String,
    token: String,
    mount: String,
}

#[derive(Deserialize)]
struct KvReadResponse {
    data: KvReadData,
}

#[derive(Deserialize)]
struct KvReadData {
    data: SecretMap,
}

#[derive(Deserialize)]
struct KvListResponse {
    data: KvListData,
}

#[derive(Deserialize)]
struct KvListData {
    keys: Vec<String>,
}

impl VaultBackend {
    /// Create a backend for the given Vault address, token, and KV mount.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(addr: String, token: String, mount: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| SecretsError::Backend(e.to_string()))?;
        Ok(Self {
            client,
            addr: addr.trim_end_matches('/').to_string(),
            token,
            mount,
        })
    }

    fn data_url(&self, path: &str) -> String {
        format!("{}/v1/{}/data/{path}", self.addr, self.mount)
    }

    fn metadata_url(&self, path: &str) -> String {
        format!("{}/v1/{}/metadata/{path}", self.addr, self.mount)
    }
}

#[async_trait]
impl SecretsBackend for VaultBackend {
    async fn get(&self, path: &str) -> Result<SecretMap> {
        let response = self
            .client
            .get(self.data_url(path))
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| SecretsError::Backend(e.to_string()))?;

        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Err(SecretsError::NotFound(path.to_string())),
            status if status.is_success() => {
                let body: KvReadResponse = response
                    .json()
                    .await
                    .map_err(|e| SecretsError::Malformed(path.to_string(), e.to_string()))?;
                Ok(body.data.data)
            }
            status => Err(SecretsError::Backend(format!(
                "vault returned {status} for {path}"
            ))),
        }
    }

    async fn set(&self, path: &str, data: SecretMap) -> Result<()> {
        let response = self
            .client
            .post(self.data_url(path))
            .header("X-Vault-Token", &self.token)
            .json(&serde_json::json!({ "data": data }))
            .send()
            .await
            .map_err(|e| SecretsError::Backend(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(SecretsError::Backend(format!(
                "vault returned {} writing {path}",
                response.status()
            )))
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.metadata_url(path))
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| SecretsError::Backend(e.to_string()))?;

        // 404 on delete means already absent; the contract treats that as ok.
        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(SecretsError::Backend(format!(
                "vault returned {} deleting {path}",
                response.status()
            )))
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let response = self
            .client
            .request(
                reqwest::Method::from_bytes(b"LIST").map_err(|e| {
                    SecretsError::Backend(e.to_string())
                })?,
                self.metadata_url(prefix),
            )
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| SecretsError::Backend(e.to_string()))?;

        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(Vec::new()),
            status if status.is_success() => {
                let body: KvListResponse = response
                    .json()
                    .await
                    .map_err(|e| SecretsError::Malformed(prefix.to_string(), e.to_string()))?;
                let prefix = prefix.trim_end_matches('/');
                Ok(body
                    .data
                    .keys
                    .into_iter()
                    .map(|k| {
                        if prefix.is_empty() {
                            k
                        } else {
                            format!("{prefix}/{k}")
                        }
                    })
                    .collect())
            }
            status => Err(SecretsError::Backend(format!(
                "vault returned {status} listing {prefix}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn backend(server: &MockServer) -> VaultBackend {
        VaultBackend::new(server.uri(), "test-token".into(), "secret".into()).unwrap()
    }

    #[tokio::test]
    async fn get_parses_kv2_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/cloud/aws/credentials"))
            .and(header("X-Vault-Token", "test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "data": { "access_key": "AKIA123" } }
            })))
            .mount(&server)
            .await;

        let value = backend(&server)
            .await
            .get("cloud/aws/credentials")
            .await
            .unwrap();
        assert_eq!(value["access_key"], "AKIA123");
    }

    #[tokio::test]
    async fn missing_secret_maps_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let result = backend(&server).await.get("missing").await;
        assert!(matches!(result, Err(SecretsError::NotFound(_))));
    }

    #[tokio::test]
    async fn set_posts_data_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/secret/data/p"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut data = SecretMap::new();
        data.insert("k".into(), serde_json::Value::String("v".into()));
        backend(&server).await.set("p", data).await.unwrap();
    }

    #[tokio::test]
    async fn delete_tolerates_absent_secret() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/secret/metadata/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        backend(&server).await.delete("gone").await.unwrap();
    }
}
