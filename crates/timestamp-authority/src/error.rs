//! Error types for timestamp-authority

use thiserror::Error;

/// Who is responsible for a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Bad input; retrying the same bytes will fail the same way
    Client,
    /// The authority could not produce a response
    Server,
    /// The authority or provisioning is misconfigured
    Configuration,
}

/// Which leaf-identity comparison failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafCheck {
    /// Issuer and serial of the signer against the expected leaf
    IssuerSerial,
    /// signingCertificateV2 hash against the expected leaf
    CertificateHash,
    /// RFC 4514 subject rendering
    Subject,
    /// Byte equality of the embedded signer certificate
    Certificate,
}

impl std::fmt::Display for LeafCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LeafCheck::IssuerSerial => "issuer/serial",
            LeafCheck::CertificateHash => "certificate hash",
            LeafCheck::Subject => "subject",
            LeafCheck::Certificate => "certificate",
        })
    }
}

/// Reasons a timestamp response fails verification
#[derive(Error, Debug)]
pub enum VerificationError {
    /// The CMS signature or messageDigest attribute does not verify
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// No path from the signer to a trusted root
    #[error("untrusted certificate chain: {0}")]
    UntrustedChain(String),

    #[error("nonce mismatch: expected {expected}, got {actual}")]
    NonceMismatch { expected: String, actual: String },

    #[error("policy OID mismatch: expected {expected}, got {actual}")]
    PolicyMismatch { expected: String, actual: String },

    /// A certificate in the signing path is not restricted to time stamping
    #[error("invalid extended key usage: {0}")]
    InvalidExtendedKeyUsage(String),

    #[error("leaf certificate mismatch ({check}): {reason}")]
    LeafCertificateMismatch { check: LeafCheck, reason: String },

    #[error("message hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// The artifact could not be read
    #[error("failed to read artifact: {0}")]
    Artifact(String),
}

/// Errors that can occur in TSA operations
#[derive(Error, Debug)]
pub enum Error {
    /// Request bytes could not be decoded or violate a structural rule
    #[error("Malformed timestamp request: {0}")]
    MalformedRequest(String),

    /// Request uses a broken hash algorithm
    #[error("Weak hash algorithm: {0}")]
    WeakHashAlgorithm(String),

    /// Response or token bytes could not be decoded
    #[error("Malformed timestamp token: {0}")]
    MalformedToken(String),

    /// The response carries a non-granted status
    #[error("Timestamp request rejected by authority (status {status}){}", format_status_text(.status_string))]
    RejectedByAuthority {
        status: u8,
        status_string: Vec<String>,
        fail_info: Option<u32>,
    },

    /// Signing failed or the deadline passed; details are only logged
    #[error("Failed to generate timestamp response")]
    ResponseGenerationFailed,

    /// Timestamp verification error
    #[error("Timestamp verification error: {0}")]
    Verification(#[from] VerificationError),

    /// Authority setup is invalid
    #[error("Configuration error: {0}")]
    Configuration(String),
}

fn format_status_text(text: &[String]) -> String {
    if text.is_empty() {
        String::new()
    } else {
        format!(": {}", text.join("; "))
    }
}

impl Error {
    /// Classify the failure
    pub fn fault(&self) -> Fault {
        match self {
            Error::MalformedRequest(_)
            | Error::WeakHashAlgorithm(_)
            | Error::MalformedToken(_)
            | Error::RejectedByAuthority { .. }
            | Error::Verification(_) => Fault::Client,
            Error::ResponseGenerationFailed => Fault::Server,
            Error::Configuration(_) => Fault::Configuration,
        }
    }
}

/// Result type for TSA operations
pub type Result<T> = std::result::Result<T, Error>;
