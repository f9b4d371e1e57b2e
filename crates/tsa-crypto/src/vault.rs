//! HashiCorp Vault transit engine client

use crate::encoding::PublicKeySpki;
use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;
use crate::signing::{BoxFuture, KeyManagementClient, Signature};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DEFAULT_MOUNT: &str = "transit";

/// A [`KeyManagementClient`] for Vault's transit secrets engine
///
/// Key identifiers are either a bare key name or `transit/keys/<name>`.
pub struct VaultTransitClient {
    /// Base address of the Vault server
    address: String,
    /// Vault token sent as `X-Vault-Token`
    token: String,
    /// Mount path of the transit engine
    mount: String,
    /// HTTP client
    client: reqwest::Client,
}

impl VaultTransitClient {
    /// Create a new client for the transit engine mounted at `transit/`
    pub fn new(address: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            address: address.into().trim_end_matches('/').to_string(),
            token: token.into(),
            mount: DEFAULT_MOUNT.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Use a transit engine mounted somewhere other than `transit/`
    pub fn with_mount(mut self, mount: impl Into<String>) -> Self {
        self.mount = mount.into().trim_matches('/').to_string();
        self
    }

    /// Strip an optional `<mount>/keys/` prefix from a key identifier
    pub fn key_name<'a>(&self, key_id: &'a str) -> &'a str {
        let prefix = format!("{}/keys/", self.mount);
        key_id.strip_prefix(prefix.as_str()).unwrap_or(key_id)
    }

    async fn sign(&self, key_id: &str, digest: &[u8], algorithm: HashAlgorithm) -> Result<Signature> {
        let url = format!(
            "{}/v1/{}/sign/{}/{}",
            self.address,
            self.mount,
            self.key_name(key_id),
            vault_hash_name(algorithm)
        );

        let request = SignRequest {
            input: STANDARD.encode(digest),
            prehashed: true,
            marshaling_algorithm: "asn1",
        };

        let response = self
            .client
            .post(&url)
            .header("X-Vault-Token", &self.token)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::SigningUnavailable(format!("vault sign request failed: {}", e)))?;

        let response = check_status(response, key_id).await?;
        let body: VaultResponse<SignData> = response
            .json()
            .await
            .map_err(|e| Error::SigningUnavailable(format!("failed to parse JSON: {}", e)))?;

        // "vault:v<version>:<base64 signature>"
        let encoded = body
            .data
            .signature
            .rsplit(':')
            .next()
            .unwrap_or_default();
        let der = STANDARD.decode(encoded).map_err(|e| {
            Error::SigningUnavailable(format!("vault returned a malformed signature: {}", e))
        })?;

        Ok(Signature::new(der))
    }

    async fn fetch_public_key(&self, key_id: &str) -> Result<PublicKeySpki> {
        let url = format!(
            "{}/v1/{}/keys/{}",
            self.address,
            self.mount,
            self.key_name(key_id)
        );

        let response = self
            .client
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| Error::SigningUnavailable(format!("vault key request failed: {}", e)))?;

        let response = check_status(response, key_id).await?;
        let body: VaultResponse<KeyData> = response
            .json()
            .await
            .map_err(|e| Error::SigningUnavailable(format!("failed to parse JSON: {}", e)))?;

        let latest = body.data.latest_version.to_string();
        let version = body.data.keys.get(&latest).ok_or_else(|| {
            Error::KeyNotFound(format!("{} has no version {}", key_id, latest))
        })?;

        PublicKeySpki::from_pem(&version.public_key)
    }
}

impl KeyManagementClient for VaultTransitClient {
    fn provider(&self) -> &'static str {
        "hashivault"
    }

    fn sign_digest<'a>(
        &'a self,
        key_id: &'a str,
        digest: &'a [u8],
        algorithm: HashAlgorithm,
    ) -> BoxFuture<'a, Signature> {
        Box::pin(self.sign(key_id, digest, algorithm))
    }

    fn public_key<'a>(&'a self, key_id: &'a str) -> BoxFuture<'a, PublicKeySpki> {
        Box::pin(self.fetch_public_key(key_id))
    }
}

fn vault_hash_name(algorithm: HashAlgorithm) -> &'static str {
    match algorithm {
        HashAlgorithm::Sha2256 => "sha2-256",
        HashAlgorithm::Sha2384 => "sha2-384",
        HashAlgorithm::Sha2512 => "sha2-512",
    }
}

async fn check_status(response: reqwest::Response, key_id: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(Error::KeyNotFound(key_id.to_string()));
    }

    let body = response.text().await.unwrap_or_default();
    tracing::debug!(%status, body = %body, "vault request rejected");
    Err(Error::SigningUnavailable(format!("vault returned status {}", status)))
}

#[derive(Serialize)]
struct SignRequest {
    input: String,
    prehashed: bool,
    marshaling_algorithm: &'static str,
}

#[derive(Deserialize)]
struct VaultResponse<T> {
    data: T,
}

#[derive(Deserialize)]
struct SignData {
    signature: String,
}

#[derive(Deserialize)]
struct KeyData {
    latest_version: u64,
    keys: BTreeMap<String, KeyVersion>,
}

#[derive(Deserialize)]
struct KeyVersion {
    public_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_name_prefix() {
        let client = VaultTransitClient::new("http://127.0.0.1:8200/", "token");
        assert_eq!(client.key_name("transit/keys/tsa-leaf"), "tsa-leaf");
        assert_eq!(client.key_name("tsa-leaf"), "tsa-leaf");
        assert_eq!(client.address, "http://127.0.0.1:8200");

        let client = client.with_mount("/pki-transit/");
        assert_eq!(client.key_name("pki-transit/keys/root"), "root");
    }

    #[test]
    fn test_key_data_parsing() {
        let json = r#"{"data":{"latest_version":2,"keys":{
            "1":{"public_key":"old"},
            "2":{"public_key":"new"}}}}"#;
        let body: VaultResponse<KeyData> = serde_json::from_str(json).unwrap();
        let latest = body.data.latest_version.to_string();
        assert_eq!(body.data.keys[&latest].public_key, "new");
    }

    #[test]
    fn test_sign_request_shape() {
        let request = SignRequest {
            input: STANDARD.encode([1u8, 2, 3]),
            prehashed: true,
            marshaling_algorithm: "asn1",
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["input"], "AQID");
        assert_eq!(value["prehashed"], true);
        assert_eq!(value["marshaling_algorithm"], "asn1");
    }
}
