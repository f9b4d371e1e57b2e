//! Signing capabilities
//!
//! A [`SigningCapability`] signs a precomputed digest and reports its public
//! key. The timestamp engine and the certificate builder only ever talk to
//! this trait, so they cannot tell an in-process [`EphemeralSigner`] from a
//! [`RemoteSigner`] backed by a key-management service.

use crate::encoding::PublicKeySpki;
use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;
use const_oid::ObjectIdentifier;
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::pkcs8::EncodePublicKey;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Default bound on a single remote signing or public-key request
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Boxed future returned by the async signing traits
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A DER-encoded signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature(Vec<u8>);

impl Signature {
    /// Create a new Signature from raw bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get the raw signature bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume and return the inner bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Get the length of the signature in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the signature is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Supported signing schemes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningScheme {
    /// ECDSA P-256 with SHA-256
    EcdsaP256Sha256,
    /// ECDSA P-384 with SHA-384
    EcdsaP384Sha384,
}

impl SigningScheme {
    /// Get the name of this scheme
    pub fn name(&self) -> &'static str {
        match self {
            SigningScheme::EcdsaP256Sha256 => "ECDSA_P256_SHA256",
            SigningScheme::EcdsaP384Sha384 => "ECDSA_P384_SHA384",
        }
    }

    /// Digest the signer expects to be handed
    pub fn hash_algorithm(&self) -> HashAlgorithm {
        match self {
            SigningScheme::EcdsaP256Sha256 => HashAlgorithm::Sha2256,
            SigningScheme::EcdsaP384Sha384 => HashAlgorithm::Sha2384,
        }
    }

    /// X.509/CMS signature algorithm OID (ecdsa-with-SHA256 / ecdsa-with-SHA384)
    pub fn signature_algorithm_oid(&self) -> ObjectIdentifier {
        match self {
            SigningScheme::EcdsaP256Sha256 => const_oid::db::rfc5912::ECDSA_WITH_SHA_256,
            SigningScheme::EcdsaP384Sha384 => const_oid::db::rfc5912::ECDSA_WITH_SHA_384,
        }
    }

    /// Signature algorithm identifier as it appears in certificates and SignerInfo
    ///
    /// ECDSA identifiers carry no parameters (RFC 5758 section 3.2).
    pub fn signature_algorithm(&self) -> spki::AlgorithmIdentifierOwned {
        spki::AlgorithmIdentifierOwned {
            oid: self.signature_algorithm_oid(),
            parameters: None,
        }
    }

    /// Scheme matching the curve of an EC public key
    pub fn for_public_key(public_key: &PublicKeySpki) -> Result<Self> {
        use const_oid::db::rfc5912::{ID_EC_PUBLIC_KEY, SECP_256_R_1, SECP_384_R_1};

        let spki = public_key.to_spki()?;
        if spki.algorithm.oid != ID_EC_PUBLIC_KEY {
            return Err(Error::UnsupportedAlgorithm(format!(
                "not an EC key: {}",
                spki.algorithm.oid
            )));
        }
        let curve = spki
            .algorithm
            .parameters
            .as_ref()
            .ok_or_else(|| Error::InvalidKey("missing EC curve parameters".to_string()))?
            .decode_as::<ObjectIdentifier>()
            .map_err(|e| Error::InvalidKey(format!("failed to decode curve OID: {}", e)))?;

        match curve {
            SECP_256_R_1 => Ok(SigningScheme::EcdsaP256Sha256),
            SECP_384_R_1 => Ok(SigningScheme::EcdsaP384Sha384),
            other => Err(Error::UnsupportedAlgorithm(format!(
                "unsupported EC curve: {}",
                other
            ))),
        }
    }
}

/// Anything that can sign a digest on behalf of a timestamping identity
pub trait SigningCapability: Send + Sync {
    /// Sign a precomputed digest produced with `algorithm`
    ///
    /// Returns a DER-encoded signature.
    fn sign_digest<'a>(
        &'a self,
        digest: &'a [u8],
        algorithm: HashAlgorithm,
    ) -> BoxFuture<'a, Signature>;

    /// DER-encoded SubjectPublicKeyInfo of the signing key
    fn public_key(&self) -> BoxFuture<'_, PublicKeySpki>;

    /// Scheme the produced signatures follow
    fn signing_scheme(&self) -> SigningScheme;
}

/// In-process NIST P-256 key, generated at construction and never persisted
///
/// Only suitable for local development and tests.
pub struct EphemeralSigner {
    key: p256::ecdsa::SigningKey,
}

impl EphemeralSigner {
    /// Generate a fresh P-256 key
    pub fn generate() -> Self {
        Self {
            key: p256::ecdsa::SigningKey::random(&mut rand_core::OsRng),
        }
    }

    fn sign_now(&self, digest: &[u8], algorithm: HashAlgorithm) -> Result<Signature> {
        if digest.len() != algorithm.digest_size() {
            return Err(Error::Signing(format!(
                "digest is {} bytes, {} requires {}",
                digest.len(),
                algorithm,
                algorithm.digest_size()
            )));
        }
        let signature: p256::ecdsa::Signature = self
            .key
            .sign_prehash(digest)
            .map_err(|e| Error::Signing(format!("ECDSA P-256 signing failed: {}", e)))?;
        Ok(Signature::new(signature.to_der().as_bytes().to_vec()))
    }

    fn public_key_now(&self) -> Result<PublicKeySpki> {
        let document = self
            .key
            .verifying_key()
            .to_public_key_der()
            .map_err(|e| Error::InvalidKey(format!("failed to encode public key: {}", e)))?;
        Ok(PublicKeySpki::new(document.as_bytes().to_vec()))
    }
}

impl std::fmt::Debug for EphemeralSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralSigner").finish_non_exhaustive()
    }
}

impl SigningCapability for EphemeralSigner {
    fn sign_digest<'a>(
        &'a self,
        digest: &'a [u8],
        algorithm: HashAlgorithm,
    ) -> BoxFuture<'a, Signature> {
        Box::pin(async move { self.sign_now(digest, algorithm) })
    }

    fn public_key(&self) -> BoxFuture<'_, PublicKeySpki> {
        Box::pin(async move { self.public_key_now() })
    }

    fn signing_scheme(&self) -> SigningScheme {
        SigningScheme::EcdsaP256Sha256
    }
}

/// Provider boundary for remote key-management services
///
/// Implementations wrap a provider SDK or HTTP API and must map every failure
/// to [`Error::SigningUnavailable`] or [`Error::KeyNotFound`].
pub trait KeyManagementClient: Send + Sync {
    /// Short provider name used in logs
    fn provider(&self) -> &'static str;

    /// Sign `digest` with the key called `key_id`
    fn sign_digest<'a>(
        &'a self,
        key_id: &'a str,
        digest: &'a [u8],
        algorithm: HashAlgorithm,
    ) -> BoxFuture<'a, Signature>;

    /// Fetch the public half of `key_id`
    fn public_key<'a>(&'a self, key_id: &'a str) -> BoxFuture<'a, PublicKeySpki>;
}

/// Signing capability backed by a key held in a remote key-management service
///
/// No key material is handled locally; every request is bounded by `timeout`
/// and attempted exactly once.
#[derive(Clone)]
pub struct RemoteSigner {
    client: Arc<dyn KeyManagementClient>,
    key_id: String,
    scheme: SigningScheme,
    timeout: Duration,
}

impl RemoteSigner {
    /// Create a signer for `key_id` using the default scheme and timeout
    ///
    /// The default is P-256; call [`RemoteSigner::resolve_scheme`] to follow
    /// the remote key instead.
    pub fn new(client: Arc<dyn KeyManagementClient>, key_id: impl Into<String>) -> Self {
        Self {
            client,
            key_id: key_id.into(),
            scheme: SigningScheme::EcdsaP256Sha256,
            timeout: DEFAULT_REMOTE_TIMEOUT,
        }
    }

    /// Set the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the scheme the remote key signs with
    pub fn with_scheme(mut self, scheme: SigningScheme) -> Self {
        self.scheme = scheme;
        self
    }

    /// Fetch the remote public key and adopt the scheme of its curve
    pub async fn resolve_scheme(mut self) -> Result<Self> {
        let public_key = self
            .bounded("public key", self.client.public_key(&self.key_id))
            .await?;
        self.scheme = SigningScheme::for_public_key(&public_key)?;
        tracing::debug!(
            provider = self.client.provider(),
            key_id = %self.key_id,
            scheme = self.scheme.name(),
            "resolved remote signing scheme"
        );
        Ok(self)
    }

    /// Identifier of the remote key
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    provider = self.client.provider(),
                    key_id = %self.key_id,
                    "{} timed out after {:?}",
                    operation,
                    self.timeout
                );
                Err(Error::SigningUnavailable(format!(
                    "{} request to {} timed out after {:?}",
                    operation,
                    self.client.provider(),
                    self.timeout
                )))
            }
        }
    }
}

impl std::fmt::Debug for RemoteSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSigner")
            .field("provider", &self.client.provider())
            .field("key_id", &self.key_id)
            .field("scheme", &self.scheme)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl SigningCapability for RemoteSigner {
    fn sign_digest<'a>(
        &'a self,
        digest: &'a [u8],
        algorithm: HashAlgorithm,
    ) -> BoxFuture<'a, Signature> {
        Box::pin(async move {
            tracing::debug!(key_id = %self.key_id, "requesting remote signature");
            self.bounded(
                "sign",
                self.client.sign_digest(&self.key_id, digest, algorithm),
            )
            .await
        })
    }

    fn public_key(&self) -> BoxFuture<'_, PublicKeySpki> {
        Box::pin(async move {
            self.bounded("public key", self.client.public_key(&self.key_id))
                .await
        })
    }

    fn signing_scheme(&self) -> SigningScheme {
        self.scheme
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::digest;
    use crate::verification::verify_signature;

    struct StalledClient;

    impl KeyManagementClient for StalledClient {
        fn provider(&self) -> &'static str {
            "stalled"
        }

        fn sign_digest<'a>(
            &'a self,
            _key_id: &'a str,
            _digest: &'a [u8],
            _algorithm: HashAlgorithm,
        ) -> BoxFuture<'a, Signature> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Signature::new(vec![]))
            })
        }

        fn public_key<'a>(&'a self, key_id: &'a str) -> BoxFuture<'a, PublicKeySpki> {
            Box::pin(async move { Err(Error::KeyNotFound(key_id.to_string())) })
        }
    }

    #[tokio::test]
    async fn test_ephemeral_signature_verifies() {
        let signer = EphemeralSigner::generate();
        let message = b"tbs bytes";
        let hashed = digest(HashAlgorithm::Sha2256, message);

        let sig = signer
            .sign_digest(&hashed.digest, HashAlgorithm::Sha2256)
            .await
            .unwrap();
        let spki = signer.public_key().await.unwrap();

        verify_signature(&spki, message, sig.as_bytes(), SigningScheme::EcdsaP256Sha256)
            .expect("ephemeral signature should verify over the original message");
    }

    #[tokio::test]
    async fn test_ephemeral_rejects_wrong_digest_length() {
        let signer = EphemeralSigner::generate();
        let result = signer.sign_digest(&[0u8; 20], HashAlgorithm::Sha2256).await;
        assert!(matches!(result, Err(Error::Signing(_))));
    }

    #[tokio::test]
    async fn test_ephemeral_keys_are_fresh() {
        let a = EphemeralSigner::generate().public_key().await.unwrap();
        let b = EphemeralSigner::generate().public_key().await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_timeout_is_signing_unavailable() {
        let signer = RemoteSigner::new(Arc::new(StalledClient), "leaf-key")
            .with_timeout(Duration::from_secs(30));
        let result = signer.sign_digest(&[0u8; 32], HashAlgorithm::Sha2256).await;
        assert!(matches!(result, Err(Error::SigningUnavailable(_))));
    }

    #[test]
    fn test_scheme_follows_key_curve() {
        let p256 = EphemeralSigner::generate().public_key_now().unwrap();
        assert_eq!(
            SigningScheme::for_public_key(&p256).unwrap(),
            SigningScheme::EcdsaP256Sha256
        );
        assert!(matches!(
            SigningScheme::for_public_key(&PublicKeySpki::new(vec![0x30, 0x00])),
            Err(Error::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_remote_propagates_key_not_found() {
        let signer = RemoteSigner::new(Arc::new(StalledClient), "missing");
        let result = signer.public_key().await;
        assert!(matches!(result, Err(Error::KeyNotFound(k)) if k == "missing"));
    }
}
