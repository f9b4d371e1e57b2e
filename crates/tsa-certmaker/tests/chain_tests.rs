//! Chain provisioning tests
//!
//! Issued chains are validated with webpki the same way a timestamp
//! verifier validates a signing chain.

use rustls_pki_types::{CertificateDer as WebPkiCert, UnixTime};
use std::path::Path;
use std::time::Duration;
use tsa_certmaker::{
    build_chain, create_certificates, issue_certificate, CertificateChain, CertificateTemplate,
    ChainTemplates, Error, ExtKeyUsageName, TemplatePaths,
};
use tsa_crypto::x509::{extended_key_usages, ID_KP_TIME_STAMPING};
use tsa_crypto::{KeyRole, KmsBackend, KmsConfig, KmsType};
use webpki::{anchor_from_trusted_cert, EndEntityCert, KeyUsage, ALL_VERIFICATION_ALGS};

/// DER content octets of id-kp-timeStamping (1.3.6.1.5.5.7.3.8)
const TIME_STAMPING_EKU: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x03, 0x08];

/// 2025-06-01T00:00:00Z, inside the bundled templates' validity window
const VALIDATION_TIME: u64 = 1_748_736_000;

fn validate_with_webpki(chain: &CertificateChain) -> Result<(), webpki::Error> {
    let ders = chain.to_der_chain().unwrap();
    let leaf = WebPkiCert::from(ders[0].as_bytes().to_vec());
    let root = WebPkiCert::from(ders[ders.len() - 1].as_bytes().to_vec());
    let intermediates: Vec<WebPkiCert<'static>> = ders[1..ders.len() - 1]
        .iter()
        .map(|der| WebPkiCert::from(der.as_bytes().to_vec()))
        .collect();

    let anchors = vec![anchor_from_trusted_cert(&root)?.to_owned()];
    let ee = EndEntityCert::try_from(&leaf)?;
    ee.verify_for_usage(
        ALL_VERIFICATION_ALGS,
        &anchors,
        &intermediates,
        UnixTime::since_unix_epoch(Duration::from_secs(VALIDATION_TIME)),
        KeyUsage::required(TIME_STAMPING_EKU),
        None,
        None,
    )
    .map(|_| ())
}

fn write_template(dir: &Path, name: &str, template: &CertificateTemplate) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, serde_json::to_string_pretty(template).unwrap()).unwrap();
    path
}

#[tokio::test]
async fn test_root_and_leaf_chain_validates() {
    let templates = ChainTemplates::defaults(false).unwrap();
    let backend = KmsBackend::ephemeral(&[KeyRole::Root, KeyRole::Leaf]);

    let chain = build_chain(&templates, &backend).await.unwrap();

    assert!(chain.intermediate.is_none());
    chain.verify().unwrap();
    validate_with_webpki(&chain).unwrap();
}

#[tokio::test]
async fn test_chain_with_intermediate_validates() {
    let templates = ChainTemplates::defaults(true).unwrap();
    let backend = KmsBackend::ephemeral(&[KeyRole::Root, KeyRole::Intermediate, KeyRole::Leaf]);

    let chain = build_chain(&templates, &backend).await.unwrap();

    let intermediate = chain.intermediate.as_ref().unwrap();
    assert_eq!(
        chain.leaf.tbs_certificate.issuer,
        intermediate.tbs_certificate.subject
    );
    assert_eq!(
        intermediate.tbs_certificate.issuer,
        chain.root.tbs_certificate.subject
    );
    assert_eq!(
        extended_key_usages(&chain.leaf).unwrap(),
        vec![ID_KP_TIME_STAMPING]
    );
    validate_with_webpki(&chain).unwrap();
}

#[tokio::test]
async fn test_leaf_key_matches_backend() {
    let templates = ChainTemplates::defaults(false).unwrap();
    let backend = KmsBackend::ephemeral(&[KeyRole::Root, KeyRole::Leaf]);
    let leaf_key = backend.signer(KeyRole::Leaf).unwrap().public_key().await.unwrap();

    let chain = build_chain(&templates, &backend).await.unwrap();

    let spki = leaf_key.to_spki().unwrap();
    assert_eq!(chain.leaf.tbs_certificate.subject_public_key_info, spki);
}

#[test]
fn test_server_auth_leaf_is_rejected_before_signing() {
    let mut leaf = CertificateTemplate::default_leaf().unwrap();
    leaf.ext_key_usage = vec![ExtKeyUsageName::ServerAuth];

    let err = ChainTemplates::new(CertificateTemplate::default_root().unwrap(), None, leaf)
        .unwrap_err();
    assert!(matches!(err, Error::Template(_)));
}

#[tokio::test]
async fn test_misissued_leaf_fails_chain_checks() {
    // Bypass template role checks to issue a leaf without the time-stamping EKU
    let backend = KmsBackend::ephemeral(&[KeyRole::Root, KeyRole::Leaf]);
    let templates = ChainTemplates::defaults(false).unwrap();
    let good = build_chain(&templates, &backend).await.unwrap();

    let mut template = CertificateTemplate::default_leaf().unwrap();
    template.ext_key_usage = vec![ExtKeyUsageName::ServerAuth];
    let root_signer = backend.signer(KeyRole::Root).unwrap();
    let leaf_key = backend.signer(KeyRole::Leaf).unwrap().public_key().await.unwrap();
    let leaf = issue_certificate(&template, &leaf_key, Some(&good.root), root_signer.as_ref())
        .await
        .unwrap();

    let bad = CertificateChain {
        leaf,
        ..good
    };
    assert!(matches!(bad.verify(), Err(Error::Chain(_))));
    assert!(validate_with_webpki(&bad).is_err());
}

#[tokio::test]
async fn test_create_certificates_from_files() {
    let dir = tempfile::tempdir().unwrap();
    let root = write_template(dir.path(), "root.json", &CertificateTemplate::default_root().unwrap());
    let leaf = write_template(dir.path(), "leaf.json", &CertificateTemplate::default_leaf().unwrap());

    let chain = create_certificates(&KmsConfig::memory(), &TemplatePaths::new(root, leaf), None)
        .await
        .unwrap();

    let reparsed = CertificateChain::from_pem(&chain.to_pem().unwrap()).unwrap();
    assert_eq!(reparsed, chain);
    validate_with_webpki(&reparsed).unwrap();
}

#[tokio::test]
async fn test_create_certificates_missing_template() {
    let dir = tempfile::tempdir().unwrap();
    let root = write_template(dir.path(), "root.json", &CertificateTemplate::default_root().unwrap());
    let paths = TemplatePaths::new(root, dir.path().join("absent.json"));

    let err = create_certificates(&KmsConfig::memory(), &paths, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TemplateNotFound(_)));
}

#[tokio::test]
async fn test_create_certificates_rejects_bad_config_first() {
    // Invalid KMS settings are reported even though the template paths are missing too
    let config = KmsConfig::new(KmsType::AwsKms, "not-an-arn", "alias/leaf");
    let paths = TemplatePaths::new("/nonexistent/root.json", "/nonexistent/leaf.json");

    let err = create_certificates(&config, &paths, None).await.unwrap_err();
    assert!(matches!(err, Error::Kms(tsa_crypto::Error::Configuration(_))));
}

#[tokio::test]
async fn test_create_certificates_needs_intermediate_template() {
    let dir = tempfile::tempdir().unwrap();
    let root = write_template(dir.path(), "root.json", &CertificateTemplate::default_root().unwrap());
    let leaf = write_template(dir.path(), "leaf.json", &CertificateTemplate::default_leaf().unwrap());
    let config = KmsConfig::new(KmsType::HashiVault, "tsa-root", "tsa-leaf")
        .with_intermediate("tsa-intermediate")
        .with_option("vault-address", "http://127.0.0.1:8200")
        .with_option("vault-token", "token");

    let err = create_certificates(&config, &TemplatePaths::new(root, leaf), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Template(_)));
}
