//! Certificate chain provisioning for an RFC 3161 timestamp authority
//!
//! Issues a self-signed root, an optional intermediate and a time-stamping
//! leaf from JSON templates, with every private key held by a
//! [`tsa_crypto::SigningCapability`].
//!
//! # Example
//!
//! ```no_run
//! use tsa_certmaker::{create_certificates, TemplatePaths};
//! use tsa_crypto::KmsConfig;
//!
//! # async fn example() -> Result<(), tsa_certmaker::Error> {
//! let paths = TemplatePaths::new("root-template.json", "leaf-template.json");
//! let chain = create_certificates(&KmsConfig::memory(), &paths, None).await?;
//! std::fs::write("chain.pem", chain.to_pem()?).ok();
//! # Ok(())
//! # }
//! ```

pub mod certificate;
pub mod chain;
pub mod error;
pub mod template;

pub use certificate::{build_name, issue_certificate};
pub use chain::{build_chain, create_certificates, CertificateChain};
pub use error::{Error, Result};
pub use template::{
    BasicConstraintsTemplate, CertificateTemplate, ChainTemplates, ExtKeyUsageName,
    ExtensionTemplate, KeyUsageName, SubjectTemplate, TemplatePaths,
};
