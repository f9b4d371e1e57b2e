//! Root → intermediate → leaf chain issuance

use crate::certificate::issue_certificate;
use crate::error::{Error, Result};
use crate::template::{ChainTemplates, TemplatePaths};
use std::sync::Arc;
use tsa_crypto::x509::{has_only_time_stamping_eku, is_ca, verify_issued_by};
use tsa_crypto::{
    encode_pem_chain, parse_pem_chain, CertificateDer, KeyManagementClient, KeyRole, KmsBackend,
    KmsConfig,
};
use x509_cert::Certificate;

/// An issued timestamping chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateChain {
    pub root: Certificate,
    pub intermediate: Option<Certificate>,
    pub leaf: Certificate,
}

impl CertificateChain {
    /// Intermediates between leaf and root, nearest the leaf first
    pub fn intermediates(&self) -> Vec<&Certificate> {
        self.intermediate.iter().collect()
    }

    /// DER certificates, leaf first and root last
    pub fn to_der_chain(&self) -> Result<Vec<CertificateDer>> {
        std::iter::once(&self.leaf)
            .chain(self.intermediate.iter())
            .chain(std::iter::once(&self.root))
            .map(|cert| CertificateDer::try_from(cert).map_err(Error::from))
            .collect()
    }

    /// PEM bundle, leaf first and root last
    pub fn to_pem(&self) -> Result<String> {
        Ok(encode_pem_chain(&self.to_der_chain()?))
    }

    /// Parse a PEM bundle of two (leaf, root) or three (leaf, intermediate, root) certificates
    pub fn from_pem(pem: &str) -> Result<Self> {
        let certs = parse_pem_chain(pem)?
            .iter()
            .map(|der| der.to_certificate())
            .collect::<tsa_crypto::Result<Vec<_>>>()?;

        let mut certs = certs.into_iter();
        match (certs.next(), certs.next(), certs.next(), certs.next()) {
            (Some(leaf), Some(root), None, None) => Ok(Self {
                root,
                intermediate: None,
                leaf,
            }),
            (Some(leaf), Some(intermediate), Some(root), None) => Ok(Self {
                root,
                intermediate: Some(intermediate),
                leaf,
            }),
            _ => Err(Error::Chain(
                "expected leaf, optional intermediate and root certificates".to_string(),
            )),
        }
    }

    /// Check issuer links, signatures, CA flags and time-stamping EKU
    pub fn verify(&self) -> Result<()> {
        let chain_err = |e: tsa_crypto::Error| Error::Chain(e.to_string());

        if !is_ca(&self.root).map_err(chain_err)? {
            return Err(Error::Chain("root is not a CA".to_string()));
        }
        verify_issued_by(&self.root, &self.root).map_err(chain_err)?;

        let leaf_issuer = match &self.intermediate {
            Some(intermediate) => {
                if !is_ca(intermediate).map_err(chain_err)? {
                    return Err(Error::Chain("intermediate is not a CA".to_string()));
                }
                if !has_only_time_stamping_eku(intermediate).map_err(chain_err)? {
                    return Err(Error::Chain(
                        "intermediate EKU must be exactly timeStamping".to_string(),
                    ));
                }
                verify_issued_by(intermediate, &self.root).map_err(chain_err)?;
                intermediate
            }
            None => &self.root,
        };

        if is_ca(&self.leaf).map_err(chain_err)? {
            return Err(Error::Chain("leaf must not be a CA".to_string()));
        }
        if !has_only_time_stamping_eku(&self.leaf).map_err(chain_err)? {
            return Err(Error::Chain(
                "leaf EKU must be exactly timeStamping".to_string(),
            ));
        }
        verify_issued_by(&self.leaf, leaf_issuer).map_err(chain_err)
    }
}

/// Issue root, optional intermediate and leaf, each signed by its issuer's key
///
/// The intermediate is issued when the templates include one; the backend
/// must then hold an intermediate signer. Every role is checked before the
/// first signing call.
pub async fn build_chain(templates: &ChainTemplates, backend: &KmsBackend) -> Result<CertificateChain> {
    let root_signer = backend.signer(KeyRole::Root)?;
    let leaf_signer = backend.signer(KeyRole::Leaf)?;
    let intermediate_signer = match templates.intermediate() {
        Some(_) => Some(backend.signer(KeyRole::Intermediate)?),
        None if backend.has_role(KeyRole::Intermediate) => {
            return Err(Error::Template(
                "an intermediate key is configured but no intermediate template was given"
                    .to_string(),
            ))
        }
        None => None,
    };

    let root_key = root_signer.public_key().await?;
    let root = issue_certificate(templates.root(), &root_key, None, root_signer.as_ref()).await?;
    tracing::info!(subject = %root.tbs_certificate.subject, "issued root certificate");

    let intermediate = match (templates.intermediate(), &intermediate_signer) {
        (Some(template), Some(signer)) => {
            let key = signer.public_key().await?;
            let cert = issue_certificate(template, &key, Some(&root), root_signer.as_ref()).await?;
            tracing::info!(subject = %cert.tbs_certificate.subject, "issued intermediate certificate");
            Some(cert)
        }
        _ => None,
    };

    let (leaf_issuer, leaf_issuer_signer) = match (&intermediate, &intermediate_signer) {
        (Some(cert), Some(signer)) => (cert, signer),
        _ => (&root, &root_signer),
    };
    let leaf_key = leaf_signer.public_key().await?;
    let leaf = issue_certificate(
        templates.leaf(),
        &leaf_key,
        Some(leaf_issuer),
        leaf_issuer_signer.as_ref(),
    )
    .await?;
    tracing::info!(subject = %leaf.tbs_certificate.subject, "issued leaf certificate");

    Ok(CertificateChain {
        root,
        intermediate,
        leaf,
    })
}

/// Provision a chain from configuration and template files
///
/// Order of checks: KMS configuration, template paths and contents, and only
/// then the provider connection and signing. Cloud providers need `client`;
/// `memory` and `hashivault` connect on their own.
pub async fn create_certificates(
    config: &KmsConfig,
    paths: &TemplatePaths,
    client: Option<Arc<dyn KeyManagementClient>>,
) -> Result<CertificateChain> {
    config.validate()?;

    if config.has_intermediate() && paths.intermediate.is_none() {
        return Err(Error::Template(
            "intermediate key id is set but no intermediate template path was given".to_string(),
        ));
    }
    let paths = if config.has_intermediate() {
        paths.clone()
    } else {
        TemplatePaths {
            intermediate: None,
            ..paths.clone()
        }
    };
    let templates = ChainTemplates::load(&paths)?;

    let backend = match client {
        Some(client) => config.connect_with(client).await?,
        None => config.connect().await?,
    };

    let chain = build_chain(&templates, &backend).await?;
    chain.verify()?;
    Ok(chain)
}
