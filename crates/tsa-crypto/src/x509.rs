//! X.509 certificate utilities
//!
//! Typed accessors for the extensions a timestamping chain cares about,
//! plus issuer-signature checking between a certificate and its parent.

use crate::encoding::PublicKeySpki;
use crate::error::{Error, Result};
use crate::signing::SigningScheme;
use crate::verification::verify_raw;
use const_oid::db::rfc5912::{ECDSA_WITH_SHA_256, ECDSA_WITH_SHA_384, ID_EC_PUBLIC_KEY};
use const_oid::ObjectIdentifier;
use x509_cert::der::Encode;
use x509_cert::ext::pkix::{BasicConstraints, ExtendedKeyUsage, KeyUsage};
use x509_cert::Certificate;

/// id-kp-timeStamping: 1.3.6.1.5.5.7.3.8
pub const ID_KP_TIME_STAMPING: ObjectIdentifier = const_oid::db::rfc5280::ID_KP_TIME_STAMPING;

/// Extended key usages listed by the certificate, empty when the extension is absent
pub fn extended_key_usages(cert: &Certificate) -> Result<Vec<ObjectIdentifier>> {
    let eku: Option<(bool, ExtendedKeyUsage)> = cert
        .tbs_certificate
        .get()
        .map_err(|e| Error::InvalidCertificate(format!("failed to get EKU extension: {}", e)))?;

    Ok(eku.map(|(_critical, eku)| eku.0).unwrap_or_default())
}

/// Whether the certificate's EKU is exactly `{id-kp-timeStamping}`
///
/// A superset (for example timeStamping plus serverAuth) or a missing
/// extension both fail.
pub fn has_only_time_stamping_eku(cert: &Certificate) -> Result<bool> {
    let ekus = extended_key_usages(cert)?;
    Ok(ekus.len() == 1 && ekus[0] == ID_KP_TIME_STAMPING)
}

/// The BasicConstraints extension, if present
pub fn basic_constraints(cert: &Certificate) -> Result<Option<BasicConstraints>> {
    let bc: Option<(bool, BasicConstraints)> = cert.tbs_certificate.get().map_err(|e| {
        Error::InvalidCertificate(format!("failed to get BasicConstraints extension: {}", e))
    })?;
    Ok(bc.map(|(_, bc)| bc))
}

/// Whether BasicConstraints marks the certificate as a CA
pub fn is_ca(cert: &Certificate) -> Result<bool> {
    Ok(basic_constraints(cert)?.map(|bc| bc.ca).unwrap_or(false))
}

/// The KeyUsage extension, if present
pub fn key_usage(cert: &Certificate) -> Result<Option<KeyUsage>> {
    let ku: Option<(bool, KeyUsage)> = cert
        .tbs_certificate
        .get()
        .map_err(|e| Error::InvalidCertificate(format!("failed to get KeyUsage extension: {}", e)))?;
    Ok(ku.map(|(_, ku)| ku))
}

/// RFC 4514 rendering of the certificate subject
pub fn subject_string(cert: &Certificate) -> String {
    cert.tbs_certificate.subject.to_string()
}

/// Key identifier for a public key
///
/// The first 160 bits of the SHA-256 of the subjectPublicKey bits
/// (RFC 7093 section 2, method 1).
pub fn key_identifier(spki: &PublicKeySpki) -> Result<Vec<u8>> {
    let raw = spki.raw_key_bytes()?;
    Ok(crate::hash::sha256(&raw)[..20].to_vec())
}

/// Named curve of an EC public key in a certificate
pub fn public_key_curve(cert: &Certificate) -> Result<ObjectIdentifier> {
    let spki = &cert.tbs_certificate.subject_public_key_info;
    if spki.algorithm.oid != ID_EC_PUBLIC_KEY {
        return Err(Error::UnsupportedAlgorithm(format!(
            "not an EC key: {}",
            spki.algorithm.oid
        )));
    }

    let params = spki
        .algorithm
        .parameters
        .as_ref()
        .ok_or_else(|| Error::InvalidCertificate("missing EC curve parameters".to_string()))?;

    params
        .decode_as::<ObjectIdentifier>()
        .map_err(|e| Error::InvalidCertificate(format!("failed to decode curve OID: {}", e)))
}

/// Check that `cert` names `issuer` as its issuer and carries a valid
/// signature from the issuer's key
pub fn verify_issued_by(cert: &Certificate, issuer: &Certificate) -> Result<()> {
    if cert.tbs_certificate.issuer != issuer.tbs_certificate.subject {
        return Err(Error::Verification(format!(
            "issuer '{}' does not match parent subject '{}'",
            cert.tbs_certificate.issuer,
            issuer.tbs_certificate.subject
        )));
    }

    let scheme = match cert.signature_algorithm.oid {
        ECDSA_WITH_SHA_256 => SigningScheme::EcdsaP256Sha256,
        ECDSA_WITH_SHA_384 => SigningScheme::EcdsaP384Sha384,
        other => {
            return Err(Error::UnsupportedAlgorithm(format!(
                "certificate signature algorithm {}",
                other
            )))
        }
    };

    let tbs = cert
        .tbs_certificate
        .to_der()
        .map_err(|e| Error::Der(format!("failed to encode TBS certificate: {}", e)))?;
    let signature = cert.signature.as_bytes().ok_or_else(|| {
        Error::InvalidCertificate("certificate signature has unused bits".to_string())
    })?;
    let issuer_key = issuer
        .tbs_certificate
        .subject_public_key_info
        .subject_public_key
        .raw_bytes();

    verify_raw(issuer_key, &tbs, signature, scheme)
}
