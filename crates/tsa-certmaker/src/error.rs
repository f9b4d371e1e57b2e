//! Error types for tsa-certmaker

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while provisioning a certificate chain
#[derive(Error, Debug)]
pub enum Error {
    /// Template file does not exist
    #[error("Template not found: {}", .0.display())]
    TemplateNotFound(PathBuf),

    /// Template file could not be read or parsed
    #[error("Failed to parse template {}: {message}", path.display())]
    TemplateParse { path: PathBuf, message: String },

    /// Template parsed but is not acceptable for its role
    #[error("Invalid template: {0}")]
    Template(String),

    /// Key-management or signing failure
    #[error("Signing error: {0}")]
    Kms(#[from] tsa_crypto::Error),

    /// DER encoding/decoding error
    #[error("DER error: {0}")]
    Der(String),

    /// Issued chain failed its own consistency checks
    #[error("Invalid certificate chain: {0}")]
    Chain(String),
}

impl From<der::Error> for Error {
    fn from(e: der::Error) -> Self {
        Error::Der(e.to_string())
    }
}

/// Result type for certificate provisioning
pub type Result<T> = std::result::Result<T, Error>;
