//! Type-safe wrappers for encoded cryptographic data
//!
//! Newtypes that make it clear whether bytes are a DER certificate or a DER
//! SubjectPublicKeyInfo, plus PEM chain helpers and a serde adapter for
//! base64 byte fields.

use crate::error::{Error, Result};

const CERTIFICATE_TAG: &str = "CERTIFICATE";
const PUBLIC_KEY_TAG: &str = "PUBLIC KEY";

/// DER-encoded bytes (Distinguished Encoding Rules)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerBytes(Vec<u8>);

impl DerBytes {
    /// Create a new DER-encoded bytes wrapper
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get the underlying bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Convert to owned bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl AsRef<[u8]> for DerBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A DER-encoded X.509 certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateDer(DerBytes);

impl CertificateDer {
    /// Create from DER bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(DerBytes::new(bytes))
    }

    /// Create from a single PEM-encoded certificate
    pub fn from_pem(pem_str: &str) -> Result<Self> {
        let parsed = pem::parse(pem_str)
            .map_err(|e| Error::InvalidCertificate(format!("failed to parse PEM: {}", e)))?;

        if parsed.tag() != CERTIFICATE_TAG {
            return Err(Error::InvalidCertificate(format!(
                "expected CERTIFICATE PEM block, got {}",
                parsed.tag()
            )));
        }

        Ok(Self::new(parsed.contents().to_vec()))
    }

    /// Encode as a PEM `CERTIFICATE` block
    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new(CERTIFICATE_TAG, self.as_bytes().to_vec()))
    }

    /// Parse into an `x509_cert::Certificate`
    pub fn to_certificate(&self) -> Result<x509_cert::Certificate> {
        use der::Decode;
        x509_cert::Certificate::from_der(self.as_bytes())
            .map_err(|e| Error::InvalidCertificate(format!("failed to parse certificate: {}", e)))
    }

    /// Get the underlying DER bytes
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Convert to owned DER bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.0.into_bytes()
    }
}

impl From<Vec<u8>> for CertificateDer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl TryFrom<&x509_cert::Certificate> for CertificateDer {
    type Error = Error;

    fn try_from(cert: &x509_cert::Certificate) -> Result<Self> {
        use der::Encode;
        Ok(Self::new(cert.to_der()?))
    }
}

impl AsRef<[u8]> for CertificateDer {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// A DER-encoded SubjectPublicKeyInfo (SPKI)
///
/// This is the standard format for public keys that includes the algorithm identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeySpki(DerBytes);

impl PublicKeySpki {
    /// Create from DER bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(DerBytes::new(bytes))
    }

    /// Create from PEM-encoded public key
    pub fn from_pem(pem_str: &str) -> Result<Self> {
        let parsed = pem::parse(pem_str)
            .map_err(|e| Error::InvalidKey(format!("failed to parse PEM: {}", e)))?;

        if parsed.tag() != PUBLIC_KEY_TAG {
            return Err(Error::InvalidKey(format!(
                "expected PUBLIC KEY PEM block, got {}",
                parsed.tag()
            )));
        }

        Ok(Self::new(parsed.contents().to_vec()))
    }

    /// Parse into an owned `SubjectPublicKeyInfo`, as embedded in certificates
    pub fn to_spki(&self) -> Result<spki::SubjectPublicKeyInfoOwned> {
        use der::Decode;
        spki::SubjectPublicKeyInfoOwned::from_der(self.as_bytes())
            .map_err(|e| Error::InvalidKey(format!("failed to parse SPKI: {}", e)))
    }

    /// Extract the raw public key bytes (without the algorithm identifier)
    pub fn raw_key_bytes(&self) -> Result<Vec<u8>> {
        let spki = self.to_spki()?;
        Ok(spki.subject_public_key.raw_bytes().to_vec())
    }

    /// Get the underlying DER bytes
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Convert to owned DER bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.0.into_bytes()
    }
}

impl From<Vec<u8>> for PublicKeySpki {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl AsRef<[u8]> for PublicKeySpki {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// Parse every `CERTIFICATE` block of a PEM bundle, in file order
///
/// Blocks with other tags are an error; an input with no certificate at all
/// is an error too.
pub fn parse_pem_chain(pem_str: &str) -> Result<Vec<CertificateDer>> {
    let blocks = pem::parse_many(pem_str)
        .map_err(|e| Error::Pem(format!("failed to parse PEM chain: {}", e)))?;

    if blocks.is_empty() {
        return Err(Error::Pem("no certificates found in PEM chain".to_string()));
    }

    blocks
        .into_iter()
        .map(|block| {
            if block.tag() != CERTIFICATE_TAG {
                return Err(Error::Pem(format!(
                    "unexpected {} block in certificate chain",
                    block.tag()
                )));
            }
            Ok(CertificateDer::new(block.into_contents()))
        })
        .collect()
}

/// Encode certificates as a concatenated PEM bundle, in the given order
pub fn encode_pem_chain<'a, I>(certs: I) -> String
where
    I: IntoIterator<Item = &'a CertificateDer>,
{
    let blocks: Vec<pem::Pem> = certs
        .into_iter()
        .map(|cert| pem::Pem::new(CERTIFICATE_TAG, cert.as_bytes().to_vec()))
        .collect();
    pem::encode_many(&blocks)
}

/// Serde helper for base64 encoding/decoding of byte arrays
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
