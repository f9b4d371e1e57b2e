//! Cryptographic primitives for the timestamp authority
//!
//! This crate provides hashing, the [`SigningCapability`] abstraction with
//! its ephemeral and remote implementations, key-management configuration,
//! and the X.509 helpers shared by certificate issuance and verification.
//! aws-lc-rs is the verification backend; ephemeral keys use the RustCrypto
//! `p256` crate because they sign prehashed digests.

pub mod encoding;
pub mod error;
pub mod hash;
pub mod kms;
pub mod signing;
pub mod vault;
pub mod verification;
pub mod x509;

pub use encoding::{encode_pem_chain, parse_pem_chain, CertificateDer, PublicKeySpki};
pub use error::{Error, Result};
pub use hash::{digest, digest_reader, sha256, HashAlgorithm, HashOutput, Hasher};
pub use kms::{KeyRole, KmsBackend, KmsConfig, KmsType};
pub use signing::{
    BoxFuture, EphemeralSigner, KeyManagementClient, RemoteSigner, Signature, SigningCapability,
    SigningScheme,
};
pub use vault::VaultTransitClient;
pub use verification::verify_signature;
