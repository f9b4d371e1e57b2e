//! RFC 3161 timestamp verification
//!
//! Verification is a fixed sequence of checks, each a separate predicate over
//! the decoded response and the caller's [`VerifyOpts`]. The first failure
//! stops the pipeline and is reported as a [`VerificationError`]:
//!
//! 1. CMS signature and certificate chain
//! 2. nonce
//! 3. policy OID
//! 4. EKU chaining of the expected leaf and intermediates
//! 5. leaf certificate identity
//! 6. artifact hash

use crate::asn1::{self, SigningCertificateV2};
use crate::error::{Error, LeafCheck, Result, VerificationError};
use crate::parse::{decode_response, matches_signer, TimestampResponse};
use const_oid::ObjectIdentifier;
use der::asn1::OctetStringRef;
use der::{Decode, Encode};
use num_bigint::BigUint;
use rustls_pki_types::{CertificateDer as WebPkiCert, UnixTime};
use std::io::Read;
use std::time::Duration;
use tsa_crypto::verification::{scheme_for, verify_raw};
use tsa_crypto::x509::{
    has_only_time_stamping_eku, public_key_curve, subject_string, ID_KP_TIME_STAMPING,
};
use tsa_crypto::{digest_reader, parse_pem_chain, CertificateDer, HashAlgorithm, HashOutput};
use webpki::{anchor_from_trusted_cert, EndEntityCert, KeyUsage, ALL_VERIFICATION_ALGS};
use x509_cert::attr::Attributes;
use x509_cert::Certificate;

type Check<T = ()> = std::result::Result<T, VerificationError>;

/// Expectations a timestamp must meet
///
/// Every field is optional; an absent expectation leaves that dimension
/// unconstrained. Roots are the exception: without them no chain can be
/// trusted and verification fails.
#[derive(Debug, Clone, Default)]
pub struct VerifyOpts {
    /// Expected TSA policy
    pub oid: Option<ObjectIdentifier>,
    /// Expected signing (leaf) certificate
    pub tsa_certificate: Option<Certificate>,
    pub intermediates: Vec<Certificate>,
    /// Trust anchors
    pub roots: Vec<Certificate>,
    /// Nonce sent with the request
    pub nonce: Option<BigUint>,
    /// Expected RFC 4514 subject of the signing certificate
    pub subject: Option<String>,
    /// Expected message imprint
    pub hashed_message: Option<HashOutput>,
}

impl VerifyOpts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_oid(mut self, oid: ObjectIdentifier) -> Self {
        self.oid = Some(oid);
        self
    }

    pub fn with_tsa_certificate(mut self, cert: Certificate) -> Self {
        self.tsa_certificate = Some(cert);
        self
    }

    pub fn with_intermediate(mut self, cert: Certificate) -> Self {
        self.intermediates.push(cert);
        self
    }

    pub fn with_intermediates(mut self, certs: Vec<Certificate>) -> Self {
        self.intermediates = certs;
        self
    }

    pub fn with_root(mut self, cert: Certificate) -> Self {
        self.roots.push(cert);
        self
    }

    pub fn with_roots(mut self, certs: Vec<Certificate>) -> Self {
        self.roots = certs;
        self
    }

    pub fn with_nonce(mut self, nonce: BigUint) -> Self {
        self.nonce = Some(nonce);
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_hashed_message(mut self, hashed: HashOutput) -> Self {
        self.hashed_message = Some(hashed);
        self
    }

    /// Take roots and intermediates from a PEM chain
    ///
    /// The last certificate is the root; everything before it is treated as
    /// an intermediate.
    pub fn with_certificate_chain_pem(mut self, pem: &str) -> Result<Self> {
        let mut certs = parse_certificates(pem)?;
        let root = certs
            .pop()
            .ok_or_else(|| Error::Configuration("certificate chain is empty".to_string()))?;
        self.roots = vec![root];
        self.intermediates = certs;
        Ok(self)
    }

    /// Take the expected leaf from a PEM file holding exactly one certificate
    pub fn with_tsa_certificate_pem(mut self, pem: &str) -> Result<Self> {
        let mut certs = parse_certificates(pem)?;
        if certs.len() != 1 {
            return Err(Error::Configuration(format!(
                "expected one TSA certificate, found {}",
                certs.len()
            )));
        }
        self.tsa_certificate = certs.pop();
        Ok(self)
    }
}

fn parse_certificates(pem: &str) -> Result<Vec<Certificate>> {
    parse_pem_chain(pem)
        .and_then(|ders| ders.iter().map(CertificateDer::to_certificate).collect())
        .map_err(|e| Error::Configuration(format!("invalid PEM certificates: {}", e)))
}

/// Decode a response and verify it against `artifact`
///
/// Returns the decoded response on success.
pub fn verify_timestamp_response<R: Read>(
    timestamp_bytes: &[u8],
    artifact: R,
    opts: &VerifyOpts,
) -> Result<TimestampResponse> {
    let response = decode_response(timestamp_bytes)?;
    verify_response(&response, artifact, opts)?;
    Ok(response)
}

/// Verify a decoded response against `artifact`
pub fn verify_response<R: Read>(
    response: &TimestampResponse,
    artifact: R,
    opts: &VerifyOpts,
) -> Result<()> {
    tracing::debug!("starting RFC 3161 timestamp verification");

    let signer = verify_signature_and_chain(response, opts)?;
    verify_nonce(response, opts)?;
    verify_oid(response, opts)?;
    verify_leaf_and_intermediates_eku(opts)?;
    verify_leaf_certificate(response, &signer, opts)?;
    verify_hashed_message(response, artifact, opts)?;

    tracing::debug!(time = %response.time, "timestamp verified");
    Ok(())
}

/// Check the CMS signature and return the signer certificate
fn verify_signature_and_chain(response: &TimestampResponse, opts: &VerifyOpts) -> Check<Certificate> {
    let invalid = VerificationError::InvalidSignature;

    if response.signed_data.signer_infos.0.len() != 1 {
        return Err(invalid(format!(
            "expected one SignerInfo, found {}",
            response.signed_data.signer_infos.0.len()
        )));
    }
    let signer_info = response
        .signer_info()
        .map_err(|e| invalid(e.to_string()))?;

    let signer = response
        .certificates
        .iter()
        .chain(opts.tsa_certificate.iter())
        .find(|cert| matches_signer(cert, &signer_info.sid))
        .cloned()
        .ok_or_else(|| invalid("no certificate matches the SignerIdentifier".to_string()))?;

    let signed_attrs = signer_info
        .signed_attrs
        .as_ref()
        .ok_or_else(|| invalid("no signed attributes".to_string()))?;
    verify_content_type_attribute(signed_attrs)?;

    let digest_alg = HashAlgorithm::from_oid(&signer_info.digest_alg.oid)
        .map_err(|e| invalid(format!("signer digest algorithm: {}", e)))?;
    verify_message_digest_attribute(signed_attrs, digest_alg, &response.tst_info_der)?;

    let curve = public_key_curve(&signer).map_err(|e| invalid(e.to_string()))?;
    let scheme =
        scheme_for(&curve, &signer_info.digest_alg.oid).map_err(|e| invalid(e.to_string()))?;
    let attrs_der = signed_attrs
        .to_der()
        .map_err(|e| invalid(format!("failed to re-encode signed attributes: {}", e)))?;
    let public_key = signer
        .tbs_certificate
        .subject_public_key_info
        .subject_public_key
        .raw_bytes();
    verify_raw(public_key, &attrs_der, signer_info.signature.as_bytes(), scheme)
        .map_err(|e| invalid(e.to_string()))?;
    tracing::debug!("CMS signature verified");

    validate_chain(&signer, response, opts)?;
    Ok(signer)
}

fn single_attribute<'a>(attrs: &'a Attributes, oid: ObjectIdentifier, name: &str) -> Check<Option<&'a der::Any>> {
    let Some(attr) = attrs.iter().find(|attr| attr.oid == oid) else {
        return Ok(None);
    };
    if attr.values.len() != 1 {
        return Err(VerificationError::InvalidSignature(format!(
            "{} attribute must have exactly one value",
            name
        )));
    }
    Ok(attr.values.get(0))
}

fn verify_content_type_attribute(attrs: &Attributes) -> Check {
    let value = single_attribute(attrs, asn1::OID_CONTENT_TYPE, "content-type")?.ok_or_else(
        || VerificationError::InvalidSignature("content-type attribute missing".to_string()),
    )?;
    let content_type: ObjectIdentifier = value.decode_as().map_err(|e| {
        VerificationError::InvalidSignature(format!("invalid content-type attribute: {}", e))
    })?;
    if content_type != asn1::OID_TST_INFO {
        return Err(VerificationError::InvalidSignature(format!(
            "content-type attribute is {}, expected TSTInfo",
            content_type
        )));
    }
    Ok(())
}

/// The message-digest attribute must equal the digest of the TSTInfo DER
fn verify_message_digest_attribute(
    attrs: &Attributes,
    algorithm: HashAlgorithm,
    tst_info_der: &[u8],
) -> Check {
    let value = single_attribute(attrs, asn1::OID_MESSAGE_DIGEST, "message-digest")?.ok_or_else(
        || VerificationError::InvalidSignature("message-digest attribute missing".to_string()),
    )?;
    let encoded = value.to_der().map_err(|e| {
        VerificationError::InvalidSignature(format!("failed to encode message-digest: {}", e))
    })?;
    let octets = OctetStringRef::from_der(&encoded).map_err(|e| {
        VerificationError::InvalidSignature(format!("message-digest is not an OCTET STRING: {}", e))
    })?;

    let content_hash = tsa_crypto::digest(algorithm, tst_info_der);
    if content_hash.digest != octets.as_bytes() {
        return Err(VerificationError::InvalidSignature(format!(
            "message-digest {} does not match TSTInfo digest {}",
            hex::encode(octets.as_bytes()),
            content_hash.to_hex()
        )));
    }
    Ok(())
}

/// Path from the signer to a trusted root at genTime, for time stamping
fn validate_chain(signer: &Certificate, response: &TimestampResponse, opts: &VerifyOpts) -> Check {
    let untrusted = VerificationError::UntrustedChain;

    if opts.roots.is_empty() {
        return Err(untrusted("no trusted roots supplied".to_string()));
    }

    let to_webpki = |cert: &Certificate| -> Check<WebPkiCert<'static>> {
        cert.to_der()
            .map(WebPkiCert::from)
            .map_err(|e| untrusted(format!("failed to encode certificate: {}", e)))
    };

    let signer_der = to_webpki(signer)?;
    let end_entity = EndEntityCert::try_from(&signer_der)
        .map_err(|e| untrusted(format!("failed to parse signer certificate: {}", e)))?;

    let root_ders = opts
        .roots
        .iter()
        .map(to_webpki)
        .collect::<Check<Vec<_>>>()?;
    let anchors = root_ders
        .iter()
        .map(|der| {
            anchor_from_trusted_cert(der)
                .map(|anchor| anchor.to_owned())
                .map_err(|e| untrusted(format!("failed to create trust anchor: {}", e)))
        })
        .collect::<Check<Vec<_>>>()?;

    let intermediates = response
        .certificates
        .iter()
        .filter(|cert| *cert != signer)
        .chain(opts.intermediates.iter())
        .map(to_webpki)
        .collect::<Check<Vec<_>>>()?;

    let secs = u64::try_from(response.time.timestamp())
        .map_err(|_| untrusted(format!("genTime {} is before the Unix epoch", response.time)))?;

    tracing::debug!(
        intermediates = intermediates.len(),
        roots = anchors.len(),
        time = %response.time,
        "validating TSA certificate chain"
    );

    end_entity
        .verify_for_usage(
            ALL_VERIFICATION_ALGS,
            &anchors,
            &intermediates,
            UnixTime::since_unix_epoch(Duration::from_secs(secs)),
            KeyUsage::required(ID_KP_TIME_STAMPING.as_bytes()),
            None,
            None,
        )
        .map_err(|e| untrusted(format!("TSA certificate chain validation failed: {}", e)))?;

    tracing::debug!("TSA certificate chain validated");
    Ok(())
}

fn verify_nonce(response: &TimestampResponse, opts: &VerifyOpts) -> Check {
    let Some(expected) = &opts.nonce else {
        return Ok(());
    };
    if response.nonce.as_ref() != Some(expected) {
        return Err(VerificationError::NonceMismatch {
            expected: expected.to_string(),
            actual: response
                .nonce
                .as_ref()
                .map(|n| n.to_string())
                .unwrap_or_else(|| "none".to_string()),
        });
    }
    Ok(())
}

fn verify_oid(response: &TimestampResponse, opts: &VerifyOpts) -> Check {
    match opts.oid {
        Some(expected) if expected != response.policy => Err(VerificationError::PolicyMismatch {
            expected: expected.to_string(),
            actual: response.policy.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Leaf and every intermediate must be restricted to time stamping
fn verify_leaf_and_intermediates_eku(opts: &VerifyOpts) -> Check {
    let Some(leaf) = &opts.tsa_certificate else {
        return Ok(());
    };

    let check = |role: &str, cert: &Certificate| -> Check {
        let ok = has_only_time_stamping_eku(cert)
            .map_err(|e| VerificationError::InvalidExtendedKeyUsage(e.to_string()))?;
        if !ok {
            return Err(VerificationError::InvalidExtendedKeyUsage(format!(
                "{} certificate '{}' must have exactly the time-stamping EKU",
                role,
                subject_string(cert)
            )));
        }
        Ok(())
    };

    check("leaf", leaf)?;
    for cert in &opts.intermediates {
        check("intermediate", cert)?;
    }
    Ok(())
}

fn leaf_mismatch(check: LeafCheck, reason: impl Into<String>) -> VerificationError {
    VerificationError::LeafCertificateMismatch {
        check,
        reason: reason.into(),
    }
}

fn verify_leaf_certificate(
    response: &TimestampResponse,
    signer: &Certificate,
    opts: &VerifyOpts,
) -> Check {
    if let Some(expected) = &opts.tsa_certificate {
        verify_ess_cert_id(response, signer, expected)?;
    }
    if let Some(subject) = &opts.subject {
        let actual = subject_string(signer);
        if &actual != subject {
            return Err(leaf_mismatch(
                LeafCheck::Subject,
                format!("signer subject '{}' is not '{}'", actual, subject),
            ));
        }
    }
    if let (Some(expected), Some(embedded)) = (&opts.tsa_certificate, response.signer_certificate())
    {
        if embedded != expected {
            return Err(leaf_mismatch(
                LeafCheck::Certificate,
                "embedded signer certificate differs from the expected certificate",
            ));
        }
    }
    Ok(())
}

/// Issuer/serial of the signer and the signingCertificateV2 binding
fn verify_ess_cert_id(
    response: &TimestampResponse,
    signer: &Certificate,
    expected: &Certificate,
) -> Check {
    let (tbs, want) = (&signer.tbs_certificate, &expected.tbs_certificate);
    if tbs.issuer != want.issuer {
        return Err(leaf_mismatch(
            LeafCheck::IssuerSerial,
            format!("issuer '{}' is not '{}'", tbs.issuer, want.issuer),
        ));
    }
    if tbs.serial_number != want.serial_number {
        return Err(leaf_mismatch(
            LeafCheck::IssuerSerial,
            format!(
                "serial {} is not {}",
                hex::encode(tbs.serial_number.as_bytes()),
                hex::encode(want.serial_number.as_bytes())
            ),
        ));
    }

    let attrs = response
        .signer_info()
        .ok()
        .and_then(|info| info.signed_attrs.as_ref());
    let Some(attrs) = attrs else {
        return Ok(());
    };
    let value = single_attribute(attrs, asn1::OID_SIGNING_CERTIFICATE_V2, "signingCertificateV2")?;
    let Some(value) = value else {
        return Ok(());
    };

    let signing_cert = value
        .to_der()
        .ok()
        .and_then(|der| SigningCertificateV2::from_der(&der).ok())
        .ok_or_else(|| leaf_mismatch(LeafCheck::CertificateHash, "unreadable signingCertificateV2"))?;
    let cert_id = signing_cert
        .certs
        .first()
        .ok_or_else(|| leaf_mismatch(LeafCheck::CertificateHash, "signingCertificateV2 is empty"))?;

    let algorithm = cert_id
        .hash_algorithm()
        .map_err(|e| leaf_mismatch(LeafCheck::CertificateHash, e.to_string()))?;
    let expected_der = expected
        .to_der()
        .map_err(|e| leaf_mismatch(LeafCheck::CertificateHash, e.to_string()))?;
    let expected_hash = tsa_crypto::digest(algorithm, &expected_der);
    if expected_hash.digest != cert_id.cert_hash.as_bytes() {
        return Err(leaf_mismatch(
            LeafCheck::CertificateHash,
            format!(
                "ESSCertIDv2 hash {} does not match expected certificate hash {}",
                hex::encode(cert_id.cert_hash.as_bytes()),
                expected_hash.to_hex()
            ),
        ));
    }
    if let Some(issuer_serial) = &cert_id.issuer_serial {
        if issuer_serial.serial_number != want.serial_number {
            return Err(leaf_mismatch(
                LeafCheck::IssuerSerial,
                "ESSCertIDv2 serial does not match the expected certificate",
            ));
        }
    }
    Ok(())
}

/// Stream the artifact through the imprint's algorithm and compare
fn verify_hashed_message<R: Read>(
    response: &TimestampResponse,
    artifact: R,
    opts: &VerifyOpts,
) -> Check {
    let computed = digest_reader(response.hash_algorithm, artifact)
        .map_err(|e| VerificationError::Artifact(e.to_string()))?;
    if computed.digest != response.hashed_message {
        return Err(VerificationError::HashMismatch {
            expected: hex::encode(&response.hashed_message),
            actual: computed.to_hex(),
        });
    }

    if let Some(expected) = &opts.hashed_message {
        if expected.algorithm != response.hash_algorithm
            || expected.digest != response.hashed_message
        {
            return Err(VerificationError::HashMismatch {
                expected: format!("{}:{}", expected.algorithm, expected.to_hex()),
                actual: format!(
                    "{}:{}",
                    response.hash_algorithm,
                    hex::encode(&response.hashed_message)
                ),
            });
        }
    }
    Ok(())
}
