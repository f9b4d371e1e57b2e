//! Key-management configuration
//!
//! [`KmsConfig`] names the provider and the key used for each certificate
//! role. It is validated once, before anything is signed, and then turned
//! into a [`KmsBackend`] that hands out one [`SigningCapability`] per role.

use crate::error::{Error, Result};
use crate::signing::{EphemeralSigner, KeyManagementClient, RemoteSigner, SigningCapability};
use crate::vault::VaultTransitClient;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// AWS region option
pub const OPT_AWS_REGION: &str = "aws-region";
/// Azure tenant option
pub const OPT_AZURE_TENANT_ID: &str = "azure-tenant-id";
/// GCP service-account credentials file option
pub const OPT_GCP_CREDENTIALS_FILE: &str = "gcp-credentials-file";
/// Vault token option
pub const OPT_VAULT_TOKEN: &str = "vault-token";
/// Vault address option
pub const OPT_VAULT_ADDRESS: &str = "vault-address";

/// Key-management provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KmsType {
    /// In-process ephemeral keys
    #[serde(alias = "ephemeral")]
    Memory,
    /// AWS KMS
    AwsKms,
    /// Google Cloud KMS
    GcpKms,
    /// Azure Key Vault
    AzureKms,
    /// HashiCorp Vault transit engine
    HashiVault,
}

impl KmsType {
    /// Configuration name of the provider
    pub fn as_str(&self) -> &'static str {
        match self {
            KmsType::Memory => "memory",
            KmsType::AwsKms => "awskms",
            KmsType::GcpKms => "gcpkms",
            KmsType::AzureKms => "azurekms",
            KmsType::HashiVault => "hashivault",
        }
    }
}

impl std::str::FromStr for KmsType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "memory" | "ephemeral" => Ok(KmsType::Memory),
            "awskms" => Ok(KmsType::AwsKms),
            "gcpkms" => Ok(KmsType::GcpKms),
            "azurekms" => Ok(KmsType::AzureKms),
            "hashivault" => Ok(KmsType::HashiVault),
            other => Err(Error::Configuration(format!("unsupported KMS type: {}", other))),
        }
    }
}

impl std::fmt::Display for KmsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Certificate role a key signs for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyRole {
    /// Self-signed root
    Root,
    /// Optional intermediate CA
    Intermediate,
    /// Timestamping leaf
    Leaf,
}

impl std::fmt::Display for KeyRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            KeyRole::Root => "root",
            KeyRole::Intermediate => "intermediate",
            KeyRole::Leaf => "leaf",
        })
    }
}

/// Provider type, per-role key identifiers and provider options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KmsConfig {
    /// Provider
    #[serde(rename = "type")]
    pub kms_type: KmsType,
    /// Key for the root certificate
    #[serde(default)]
    pub root_key_id: String,
    /// Key for the intermediate certificate; no intermediate is issued when unset
    #[serde(default)]
    pub intermediate_key_id: Option<String>,
    /// Key for the leaf certificate
    #[serde(default)]
    pub leaf_key_id: String,
    /// Provider-specific options, e.g. `aws-region` or `vault-address`
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Bound on every remote signing call, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    crate::signing::DEFAULT_REMOTE_TIMEOUT.as_secs()
}

impl KmsConfig {
    /// Configuration for in-process ephemeral keys
    pub fn memory() -> Self {
        Self::new(KmsType::Memory, "", "")
    }

    /// Create a configuration for `kms_type` with root and leaf keys
    pub fn new(kms_type: KmsType, root_key_id: impl Into<String>, leaf_key_id: impl Into<String>) -> Self {
        Self {
            kms_type,
            root_key_id: root_key_id.into(),
            intermediate_key_id: None,
            leaf_key_id: leaf_key_id.into(),
            options: BTreeMap::new(),
            timeout_secs: default_timeout_secs(),
        }
    }

    /// Issue an intermediate certificate signed with `key_id`
    pub fn with_intermediate(mut self, key_id: impl Into<String>) -> Self {
        self.intermediate_key_id = Some(key_id.into());
        self
    }

    /// Set a provider option
    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    /// Set the remote signing timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    /// Remote signing timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Whether an intermediate certificate is configured
    pub fn has_intermediate(&self) -> bool {
        self.intermediate_key_id
            .as_deref()
            .is_some_and(|id| !id.is_empty())
    }

    /// Key identifier for `role`, if that role is configured
    pub fn key_id(&self, role: KeyRole) -> Option<&str> {
        let id = match role {
            KeyRole::Root => Some(self.root_key_id.as_str()),
            KeyRole::Intermediate => self.intermediate_key_id.as_deref(),
            KeyRole::Leaf => Some(self.leaf_key_id.as_str()),
        };
        id.filter(|id| !id.is_empty())
    }

    /// Roles that will be issued, root first
    pub fn roles(&self) -> Vec<KeyRole> {
        let mut roles = vec![KeyRole::Root];
        if self.has_intermediate() {
            roles.push(KeyRole::Intermediate);
        }
        roles.push(KeyRole::Leaf);
        roles
    }

    fn option(&self, name: &str) -> Option<&str> {
        self.options
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    fn require_option(&self, name: &str) -> Result<&str> {
        self.option(name).ok_or_else(|| {
            Error::Configuration(format!("{} is required for {}", name, self.kms_type))
        })
    }

    /// Check the configuration before any key is used
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(Error::Configuration("timeout must be positive".to_string()));
        }

        if self.kms_type == KmsType::Memory {
            return Ok(());
        }

        for role in [KeyRole::Root, KeyRole::Leaf] {
            if self.key_id(role).is_none() {
                return Err(Error::Configuration(format!("{} key id is required", role)));
            }
        }

        match self.kms_type {
            KmsType::Memory => {}
            KmsType::AwsKms => {
                self.require_option(OPT_AWS_REGION)?;
            }
            KmsType::AzureKms => {
                self.require_option(OPT_AZURE_TENANT_ID)?;
            }
            KmsType::GcpKms => {
                if let Some(path) = self.option(OPT_GCP_CREDENTIALS_FILE) {
                    if !Path::new(path).exists() {
                        return Err(Error::Configuration(format!(
                            "{} does not exist: {}",
                            OPT_GCP_CREDENTIALS_FILE, path
                        )));
                    }
                }
            }
            KmsType::HashiVault => {
                self.require_option(OPT_VAULT_TOKEN)?;
                self.require_option(OPT_VAULT_ADDRESS)?;
            }
        }

        for role in self.roles() {
            if let Some(id) = self.key_id(role) {
                validate_key_id(self.kms_type, role, id)?;
            }
        }

        Ok(())
    }

    /// Validate and connect to the configured provider
    ///
    /// Only providers that need no cloud SDK can be connected directly
    /// (`memory` and `hashivault`); the others must be given a client through
    /// [`KmsConfig::connect_with`].
    pub async fn connect(&self) -> Result<KmsBackend> {
        self.validate()?;
        match self.kms_type {
            KmsType::Memory => Ok(KmsBackend::ephemeral(&self.roles())),
            KmsType::HashiVault => {
                let address = self.require_option(OPT_VAULT_ADDRESS)?;
                let token = self.require_option(OPT_VAULT_TOKEN)?;
                let client = Arc::new(VaultTransitClient::new(address, token));
                self.connect_with(client).await
            }
            other => Err(Error::Configuration(format!(
                "{} needs an externally provided key-management client",
                other
            ))),
        }
    }

    /// Validate and build remote signers on top of an existing provider client
    ///
    /// Each key's public half is fetched once so its signer advertises the
    /// scheme of the key's curve.
    pub async fn connect_with(&self, client: Arc<dyn KeyManagementClient>) -> Result<KmsBackend> {
        self.validate()?;
        if self.kms_type == KmsType::Memory {
            return Err(Error::Configuration(
                "memory KMS does not use a key-management client".to_string(),
            ));
        }

        let mut signers: BTreeMap<KeyRole, Arc<dyn SigningCapability>> = BTreeMap::new();
        for role in self.roles() {
            let key_id = self
                .key_id(role)
                .ok_or_else(|| Error::Configuration(format!("{} key id is required", role)))?;
            let signer = RemoteSigner::new(Arc::clone(&client), key_id)
                .with_timeout(self.timeout())
                .resolve_scheme()
                .await?;
            signers.insert(role, Arc::new(signer));
        }

        tracing::debug!(
            provider = client.provider(),
            roles = signers.len(),
            "connected remote signers"
        );
        Ok(KmsBackend { signers })
    }
}

/// Check a key identifier has the shape the provider expects
fn validate_key_id(kms_type: KmsType, role: KeyRole, key_id: &str) -> Result<()> {
    let ok = match kms_type {
        KmsType::Memory => true,
        KmsType::AwsKms => key_id.starts_with("arn:aws:kms:") || key_id.starts_with("alias/"),
        KmsType::GcpKms => {
            key_id.starts_with("projects/")
                && ["/locations/", "/keyRings/", "/cryptoKeys/", "/cryptoKeyVersions/"]
                    .iter()
                    .all(|part| key_id.contains(part))
        }
        KmsType::AzureKms => key_id.starts_with("azurekms:name=") && key_id.contains(";vault="),
        KmsType::HashiVault => !key_id.chars().any(char::is_whitespace),
    };

    if ok {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "invalid {} key id for {}: {}",
            role, kms_type, key_id
        )))
    }
}

/// One signing capability per configured role
#[derive(Clone)]
pub struct KmsBackend {
    signers: BTreeMap<KeyRole, Arc<dyn SigningCapability>>,
}

impl KmsBackend {
    /// Fresh ephemeral keys for `roles`
    pub fn ephemeral(roles: &[KeyRole]) -> Self {
        let signers = roles
            .iter()
            .map(|role| {
                let signer: Arc<dyn SigningCapability> = Arc::new(EphemeralSigner::generate());
                (*role, signer)
            })
            .collect();
        Self { signers }
    }

    /// Build a backend from explicit signers
    pub fn from_signers(signers: impl IntoIterator<Item = (KeyRole, Arc<dyn SigningCapability>)>) -> Self {
        Self {
            signers: signers.into_iter().collect(),
        }
    }

    /// Signing capability for `role`
    pub fn signer(&self, role: KeyRole) -> Result<Arc<dyn SigningCapability>> {
        self.signers
            .get(&role)
            .cloned()
            .ok_or_else(|| Error::Configuration(format!("no signer configured for {} role", role)))
    }

    /// Whether a signer exists for `role`
    pub fn has_role(&self, role: KeyRole) -> bool {
        self.signers.contains_key(&role)
    }
}

impl std::fmt::Debug for KmsBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KmsBackend")
            .field("roles", &self.signers.keys().collect::<Vec<_>>())
            .finish()
    }
}
