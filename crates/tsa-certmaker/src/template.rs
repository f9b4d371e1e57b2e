//! Declarative certificate templates
//!
//! Templates are JSON documents describing the subject, validity window,
//! basic constraints, key usage and extended key usage of one certificate.
//! Every template is checked against the rules for its role before any key
//! is asked to sign, so a misconfigured chain never costs a remote signing
//! call.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use const_oid::ObjectIdentifier;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tsa_crypto::KeyRole;
use x509_cert::ext::pkix::KeyUsages;

/// Subject distinguished-name fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectTemplate {
    pub common_name: String,
    #[serde(default)]
    pub organization: Vec<String>,
    #[serde(default)]
    pub organizational_unit: Vec<String>,
    #[serde(default)]
    pub country: Vec<String>,
    #[serde(default)]
    pub locality: Vec<String>,
    #[serde(default)]
    pub province: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicConstraintsTemplate {
    #[serde(rename = "isCA")]
    pub is_ca: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_path_len: Option<u8>,
}

/// KeyUsage bit names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyUsageName {
    DigitalSignature,
    ContentCommitment,
    KeyEncipherment,
    DataEncipherment,
    KeyAgreement,
    CertSign,
    CrlSign,
}

impl KeyUsageName {
    pub(crate) fn to_x509(self) -> KeyUsages {
        match self {
            KeyUsageName::DigitalSignature => KeyUsages::DigitalSignature,
            KeyUsageName::ContentCommitment => KeyUsages::NonRepudiation,
            KeyUsageName::KeyEncipherment => KeyUsages::KeyEncipherment,
            KeyUsageName::DataEncipherment => KeyUsages::DataEncipherment,
            KeyUsageName::KeyAgreement => KeyUsages::KeyAgreement,
            KeyUsageName::CertSign => KeyUsages::KeyCertSign,
            KeyUsageName::CrlSign => KeyUsages::CRLSign,
        }
    }
}

/// Extended key usage names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtKeyUsageName {
    TimeStamping,
    ServerAuth,
    ClientAuth,
    CodeSigning,
}

impl ExtKeyUsageName {
    pub fn oid(self) -> ObjectIdentifier {
        use const_oid::db::rfc5280::{
            ID_KP_CLIENT_AUTH, ID_KP_CODE_SIGNING, ID_KP_SERVER_AUTH, ID_KP_TIME_STAMPING,
        };
        match self {
            ExtKeyUsageName::TimeStamping => ID_KP_TIME_STAMPING,
            ExtKeyUsageName::ServerAuth => ID_KP_SERVER_AUTH,
            ExtKeyUsageName::ClientAuth => ID_KP_CLIENT_AUTH,
            ExtKeyUsageName::CodeSigning => ID_KP_CODE_SIGNING,
        }
    }
}

/// Opaque extension copied into the certificate as-is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionTemplate {
    /// Dotted OID
    pub id: String,
    #[serde(default)]
    pub critical: bool,
    /// DER value, base64
    #[serde(with = "tsa_crypto::encoding::base64_bytes")]
    pub value: Vec<u8>,
}

/// One certificate's template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateTemplate {
    pub subject: SubjectTemplate,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    #[serde(default)]
    pub basic_constraints: BasicConstraintsTemplate,
    #[serde(default)]
    pub key_usage: Vec<KeyUsageName>,
    #[serde(default)]
    pub ext_key_usage: Vec<ExtKeyUsageName>,
    #[serde(default)]
    pub extensions: Vec<ExtensionTemplate>,
}

impl CertificateTemplate {
    /// Parse a template from JSON
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Load a template file
    ///
    /// Missing files and parse failures are reported with the offending path.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::TemplateNotFound(path.to_path_buf()));
        }
        let json = std::fs::read_to_string(path).map_err(|e| Error::TemplateParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_json(&json).map_err(|e| Error::TemplateParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Bundled root template
    pub fn default_root() -> Result<Self> {
        bundled(include_str!("../templates/root-template.json"))
    }

    /// Bundled intermediate template
    pub fn default_intermediate() -> Result<Self> {
        bundled(include_str!("../templates/intermediate-template.json"))
    }

    /// Bundled leaf template
    pub fn default_leaf() -> Result<Self> {
        bundled(include_str!("../templates/leaf-template.json"))
    }

    fn has_key_usage(&self, usage: KeyUsageName) -> bool {
        self.key_usage.contains(&usage)
    }

    fn has_only_time_stamping(&self) -> bool {
        self.ext_key_usage == [ExtKeyUsageName::TimeStamping]
    }

    /// Check the template is acceptable for `role`
    pub fn validate_for(&self, role: KeyRole) -> Result<()> {
        if self.subject.common_name.trim().is_empty() {
            return Err(Error::Template(format!("{} template has no commonName", role)));
        }
        if self.not_before >= self.not_after {
            return Err(Error::Template(format!(
                "{} template notBefore {} is not before notAfter {}",
                role, self.not_before, self.not_after
            )));
        }
        for ext in &self.extensions {
            ObjectIdentifier::new(&ext.id).map_err(|e| {
                Error::Template(format!("{} template extension id {}: {}", role, ext.id, e))
            })?;
        }

        let is_ca = self.basic_constraints.is_ca;
        match role {
            KeyRole::Root => {
                if !is_ca {
                    return Err(Error::Template("root certificate must be a CA".to_string()));
                }
                if !self.has_key_usage(KeyUsageName::CertSign) {
                    return Err(Error::Template(
                        "root certificate must have certSign key usage".to_string(),
                    ));
                }
            }
            KeyRole::Intermediate => {
                if !is_ca {
                    return Err(Error::Template(
                        "intermediate certificate must be a CA".to_string(),
                    ));
                }
                if !self.has_key_usage(KeyUsageName::CertSign) {
                    return Err(Error::Template(
                        "intermediate certificate must have certSign key usage".to_string(),
                    ));
                }
                if !self.has_only_time_stamping() {
                    return Err(Error::Template(format!(
                        "intermediate extKeyUsage must be exactly [TimeStamping], got {:?}",
                        self.ext_key_usage
                    )));
                }
            }
            KeyRole::Leaf => {
                if is_ca {
                    return Err(Error::Template("leaf certificate cannot be a CA".to_string()));
                }
                if !self.has_key_usage(KeyUsageName::DigitalSignature) {
                    return Err(Error::Template(
                        "leaf certificate must have digitalSignature key usage".to_string(),
                    ));
                }
                if !self.has_only_time_stamping() {
                    return Err(Error::Template(format!(
                        "leaf extKeyUsage must be exactly [TimeStamping], got {:?}",
                        self.ext_key_usage
                    )));
                }
            }
        }

        Ok(())
    }
}

fn bundled(json: &str) -> Result<CertificateTemplate> {
    CertificateTemplate::from_json(json)
        .map_err(|e| Error::Template(format!("bundled template is invalid: {}", e)))
}

/// Where the templates for each role live on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplatePaths {
    pub root: PathBuf,
    pub intermediate: Option<PathBuf>,
    pub leaf: PathBuf,
}

impl TemplatePaths {
    pub fn new(root: impl Into<PathBuf>, leaf: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            intermediate: None,
            leaf: leaf.into(),
        }
    }

    pub fn with_intermediate(mut self, path: impl Into<PathBuf>) -> Self {
        self.intermediate = Some(path.into());
        self
    }
}

/// Role-checked templates for a whole chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTemplates {
    root: CertificateTemplate,
    intermediate: Option<CertificateTemplate>,
    leaf: CertificateTemplate,
}

impl ChainTemplates {
    /// Check each template against its role
    pub fn new(
        root: CertificateTemplate,
        intermediate: Option<CertificateTemplate>,
        leaf: CertificateTemplate,
    ) -> Result<Self> {
        root.validate_for(KeyRole::Root)?;
        if let Some(intermediate) = &intermediate {
            intermediate.validate_for(KeyRole::Intermediate)?;
        }
        leaf.validate_for(KeyRole::Leaf)?;
        Ok(Self {
            root,
            intermediate,
            leaf,
        })
    }

    /// Load and check every template in `paths`
    ///
    /// All paths are checked for existence before any of them is parsed.
    pub fn load(paths: &TemplatePaths) -> Result<Self> {
        for path in std::iter::once(&paths.root)
            .chain(paths.intermediate.iter())
            .chain(std::iter::once(&paths.leaf))
        {
            if !path.is_file() {
                return Err(Error::TemplateNotFound(path.clone()));
            }
        }

        let root = CertificateTemplate::load(&paths.root)?;
        let intermediate = paths
            .intermediate
            .as_ref()
            .map(CertificateTemplate::load)
            .transpose()?;
        let leaf = CertificateTemplate::load(&paths.leaf)?;

        Self::new(root, intermediate, leaf)
    }

    /// The bundled templates, with or without an intermediate
    pub fn defaults(with_intermediate: bool) -> Result<Self> {
        let intermediate = if with_intermediate {
            Some(CertificateTemplate::default_intermediate()?)
        } else {
            None
        };
        Self::new(
            CertificateTemplate::default_root()?,
            intermediate,
            CertificateTemplate::default_leaf()?,
        )
    }

    pub fn root(&self) -> &CertificateTemplate {
        &self.root
    }

    pub fn intermediate(&self) -> Option<&CertificateTemplate> {
        self.intermediate.as_ref()
    }

    pub fn leaf(&self) -> &CertificateTemplate {
        &self.leaf
    }
}
