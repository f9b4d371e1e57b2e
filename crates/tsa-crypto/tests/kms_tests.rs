//! Remote signers built from a `KmsConfig` over an in-process provider

use const_oid::db::rfc5912::{ID_EC_PUBLIC_KEY, SECP_384_R_1};
use der::asn1::{Any, BitString};
use der::Encode;
use spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tsa_crypto::{
    digest, digest_reader, verify_signature, BoxFuture, EphemeralSigner, Error, HashAlgorithm,
    KeyManagementClient, KeyRole, KmsConfig, KmsType, PublicKeySpki, Signature, SigningCapability,
    SigningScheme,
};

/// Provider holding one ephemeral key per key id
struct InMemoryKms {
    keys: BTreeMap<String, EphemeralSigner>,
}

impl InMemoryKms {
    fn with_keys(ids: &[&str]) -> Self {
        let keys = ids
            .iter()
            .map(|id| (id.to_string(), EphemeralSigner::generate()))
            .collect();
        Self { keys }
    }

    fn key(&self, key_id: &str) -> tsa_crypto::Result<&EphemeralSigner> {
        self.keys
            .get(key_id)
            .ok_or_else(|| Error::KeyNotFound(key_id.to_string()))
    }
}

impl KeyManagementClient for InMemoryKms {
    fn provider(&self) -> &'static str {
        "in-memory"
    }

    fn sign_digest<'a>(
        &'a self,
        key_id: &'a str,
        digest: &'a [u8],
        algorithm: HashAlgorithm,
    ) -> BoxFuture<'a, Signature> {
        Box::pin(async move { self.key(key_id)?.sign_digest(digest, algorithm).await })
    }

    fn public_key<'a>(&'a self, key_id: &'a str) -> BoxFuture<'a, PublicKeySpki> {
        Box::pin(async move { self.key(key_id)?.public_key().await })
    }
}

/// Provider whose keys all sit on P-384 and never sign
struct P384Kms;

impl KeyManagementClient for P384Kms {
    fn provider(&self) -> &'static str {
        "p384"
    }

    fn sign_digest<'a>(
        &'a self,
        _key_id: &'a str,
        _digest: &'a [u8],
        _algorithm: HashAlgorithm,
    ) -> BoxFuture<'a, Signature> {
        Box::pin(async { Err(Error::SigningUnavailable("read-only provider".to_string())) })
    }

    fn public_key<'a>(&'a self, _key_id: &'a str) -> BoxFuture<'a, PublicKeySpki> {
        Box::pin(async {
            let spki = SubjectPublicKeyInfoOwned {
                algorithm: AlgorithmIdentifierOwned {
                    oid: ID_EC_PUBLIC_KEY,
                    parameters: Some(Any::encode_from(&SECP_384_R_1).unwrap()),
                },
                subject_public_key: BitString::from_bytes(&[0x04; 97]).unwrap(),
            };
            Ok(PublicKeySpki::new(spki.to_der().unwrap()))
        })
    }
}

fn aws_config() -> KmsConfig {
    KmsConfig::new(
        KmsType::AwsKms,
        "alias/tsa-root",
        "alias/tsa-leaf",
    )
    .with_option("aws-region", "eu-west-1")
    .with_timeout(Duration::from_secs(5))
}

#[tokio::test]
async fn test_remote_leaf_signature_verifies() {
    let kms = Arc::new(InMemoryKms::with_keys(&["alias/tsa-root", "alias/tsa-leaf"]));
    let backend = aws_config().connect_with(kms.clone()).await.unwrap();

    let leaf = backend.signer(KeyRole::Leaf).unwrap();
    let message = b"TSTInfo bytes";
    let hashed = digest(HashAlgorithm::Sha2256, message);
    let signature = leaf
        .sign_digest(&hashed.digest, HashAlgorithm::Sha2256)
        .await
        .unwrap();

    let public_key = leaf.public_key().await.unwrap();
    assert_eq!(
        public_key,
        kms.public_key("alias/tsa-leaf").await.unwrap()
    );
    verify_signature(
        &public_key,
        message,
        signature.as_bytes(),
        leaf.signing_scheme(),
    )
    .unwrap();
    assert_eq!(leaf.signing_scheme(), SigningScheme::EcdsaP256Sha256);

    // The root key is a different key
    let root_key = backend.signer(KeyRole::Root).unwrap().public_key().await.unwrap();
    assert!(verify_signature(&root_key, message, signature.as_bytes(), leaf.signing_scheme()).is_err());
}

#[tokio::test]
async fn test_scheme_follows_remote_curve() {
    let backend = aws_config().connect_with(Arc::new(P384Kms)).await.unwrap();

    for role in [KeyRole::Root, KeyRole::Leaf] {
        let signer = backend.signer(role).unwrap();
        assert_eq!(signer.signing_scheme(), SigningScheme::EcdsaP384Sha384);
        assert_eq!(signer.signing_scheme().hash_algorithm(), HashAlgorithm::Sha2384);
    }
}

#[tokio::test]
async fn test_unknown_remote_key_surfaces() {
    let kms = Arc::new(InMemoryKms::with_keys(&["alias/tsa-root"]));
    let err = aws_config().connect_with(kms).await.unwrap_err();
    assert!(matches!(err, Error::KeyNotFound(id) if id == "alias/tsa-leaf"));
}

#[tokio::test]
async fn test_invalid_config_rejected_before_connecting() {
    let kms = Arc::new(InMemoryKms::with_keys(&[]));
    let config = KmsConfig::new(KmsType::AwsKms, "tsa-root", "alias/tsa-leaf")
        .with_option("aws-region", "eu-west-1");
    assert!(matches!(
        config.connect_with(kms).await,
        Err(Error::Configuration(_))
    ));
}

#[test]
fn test_streamed_digest_matches_one_shot() {
    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    for algorithm in [
        HashAlgorithm::Sha2256,
        HashAlgorithm::Sha2384,
        HashAlgorithm::Sha2512,
    ] {
        let streamed = digest_reader(algorithm, data.as_slice()).unwrap();
        assert_eq!(streamed, digest(algorithm, &data));
        assert_eq!(streamed.digest.len(), algorithm.digest_size());
    }
}
