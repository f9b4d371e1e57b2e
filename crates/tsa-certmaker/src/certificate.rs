//! X.509 v3 certificate assembly and signing

use crate::error::{Error, Result};
use crate::template::{CertificateTemplate, SubjectTemplate};
use chrono::{DateTime, Datelike, Utc};
use const_oid::{AssociatedOid, ObjectIdentifier};
use der::asn1::{BitString, GeneralizedTime, OctetString, PrintableStringRef, SetOfVec, UtcTime, Utf8StringRef};
use der::{Any, Encode};
use flagset::FlagSet;
use rand::Rng;
use tsa_crypto::x509::key_identifier;
use tsa_crypto::{PublicKeySpki, SigningCapability};
use x509_cert::attr::AttributeTypeAndValue;
use x509_cert::ext::pkix::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, KeyUsages,
    SubjectKeyIdentifier,
};
use x509_cert::ext::{Extension, Extensions};
use x509_cert::name::{Name, RdnSequence, RelativeDistinguishedName};
use x509_cert::serial_number::SerialNumber;
use x509_cert::time::{Time, Validity};
use x509_cert::{Certificate, TbsCertificate, Version};

const OID_COUNTRY: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.6");
const OID_PROVINCE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.8");
const OID_LOCALITY: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.7");
const OID_ORGANIZATION: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.10");
const OID_ORGANIZATIONAL_UNIT: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.11");
const OID_COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");

/// Serial numbers are 16 random bytes, kept positive and free of a leading zero
fn random_serial() -> Result<SerialNumber> {
    let mut bytes: [u8; 16] = rand::rng().random();
    bytes[0] = (bytes[0] & 0x7f) | 0x40;
    Ok(SerialNumber::new(&bytes)?)
}

/// RFC 5280 section 4.1.2.5: UTCTime through 2049, GeneralizedTime after
fn x509_time(time: DateTime<Utc>) -> Result<Time> {
    let secs = u64::try_from(time.timestamp())
        .map_err(|_| Error::Template(format!("time {} is before the Unix epoch", time)))?;
    let since_epoch = std::time::Duration::from_secs(secs);
    if time.year() < 2050 {
        Ok(Time::UtcTime(UtcTime::from_unix_duration(since_epoch)?))
    } else {
        Ok(Time::GeneralTime(GeneralizedTime::from_unix_duration(
            since_epoch,
        )?))
    }
}

fn rdn(oid: ObjectIdentifier, value: &str, printable: bool) -> Result<RelativeDistinguishedName> {
    let value = if printable {
        Any::encode_from(&PrintableStringRef::new(value)?)?
    } else {
        Any::encode_from(&Utf8StringRef::new(value)?)?
    };
    let set = SetOfVec::try_from(vec![AttributeTypeAndValue { oid, value }])?;
    Ok(RelativeDistinguishedName(set))
}

/// Build a distinguished name, most significant attribute first
pub fn build_name(subject: &SubjectTemplate) -> Result<Name> {
    let mut rdns = Vec::new();
    for country in &subject.country {
        rdns.push(rdn(OID_COUNTRY, country, true)?);
    }
    for province in &subject.province {
        rdns.push(rdn(OID_PROVINCE, province, false)?);
    }
    for locality in &subject.locality {
        rdns.push(rdn(OID_LOCALITY, locality, false)?);
    }
    for org in &subject.organization {
        rdns.push(rdn(OID_ORGANIZATION, org, false)?);
    }
    for unit in &subject.organizational_unit {
        rdns.push(rdn(OID_ORGANIZATIONAL_UNIT, unit, false)?);
    }
    rdns.push(rdn(OID_COMMON_NAME, &subject.common_name, false)?);
    Ok(RdnSequence(rdns))
}

fn extension<T: Encode + AssociatedOid>(value: &T, critical: bool) -> Result<Extension> {
    Ok(Extension {
        extn_id: T::OID,
        critical,
        extn_value: OctetString::new(value.to_der()?)?,
    })
}

fn build_extensions(
    template: &CertificateTemplate,
    subject_key_id: &[u8],
    authority_key_id: Option<&[u8]>,
) -> Result<Extensions> {
    let mut extensions = Vec::new();

    let bc = BasicConstraints {
        ca: template.basic_constraints.is_ca,
        path_len_constraint: template
            .basic_constraints
            .max_path_len
            .filter(|_| template.basic_constraints.is_ca),
    };
    extensions.push(extension(&bc, true)?);

    if !template.key_usage.is_empty() {
        let mut flags: FlagSet<KeyUsages> = FlagSet::default();
        for usage in &template.key_usage {
            flags |= usage.to_x509();
        }
        extensions.push(extension(&KeyUsage(flags), true)?);
    }

    if !template.ext_key_usage.is_empty() {
        let eku = ExtendedKeyUsage(template.ext_key_usage.iter().map(|u| u.oid()).collect());
        extensions.push(extension(&eku, true)?);
    }

    let ski = SubjectKeyIdentifier(OctetString::new(subject_key_id)?);
    extensions.push(extension(&ski, false)?);

    if let Some(aki) = authority_key_id {
        let aki = AuthorityKeyIdentifier {
            key_identifier: Some(OctetString::new(aki)?),
            authority_cert_issuer: None,
            authority_cert_serial_number: None,
        };
        extensions.push(extension(&aki, false)?);
    }

    for ext in &template.extensions {
        let extn_id = ObjectIdentifier::new(&ext.id)
            .map_err(|e| Error::Template(format!("extension id {}: {}", ext.id, e)))?;
        extensions.push(Extension {
            extn_id,
            critical: ext.critical,
            extn_value: OctetString::new(ext.value.clone())?,
        });
    }

    Ok(extensions)
}

/// Key identifier of an issuer: its SKI extension, else derived from its key
fn issuer_key_identifier(issuer: &Certificate) -> Result<Vec<u8>> {
    let ski: Option<(bool, SubjectKeyIdentifier)> = issuer
        .tbs_certificate
        .get()
        .map_err(|e| Error::Der(format!("failed to read issuer SKI: {}", e)))?;
    if let Some((_, ski)) = ski {
        return Ok(ski.0.as_bytes().to_vec());
    }
    let spki = PublicKeySpki::new(issuer.tbs_certificate.subject_public_key_info.to_der()?);
    Ok(key_identifier(&spki)?)
}

/// Assemble and sign one certificate
///
/// `issuer` is the parent certificate, or `None` for a self-signed root.
/// `issuer_signer` must hold the key matching the issuer (or, for a root,
/// `subject_key`). No role rules are applied here; see
/// [`CertificateTemplate::validate_for`].
pub async fn issue_certificate(
    template: &CertificateTemplate,
    subject_key: &PublicKeySpki,
    issuer: Option<&Certificate>,
    issuer_signer: &dyn SigningCapability,
) -> Result<Certificate> {
    let subject = build_name(&template.subject)?;
    let issuer_name = match issuer {
        Some(parent) => parent.tbs_certificate.subject.clone(),
        None => subject.clone(),
    };

    let subject_key_id = key_identifier(subject_key)?;
    let authority_key_id = issuer.map(issuer_key_identifier).transpose()?;

    let scheme = issuer_signer.signing_scheme();
    let signature_algorithm = scheme.signature_algorithm();

    let tbs_certificate = TbsCertificate {
        version: Version::V3,
        serial_number: random_serial()?,
        signature: signature_algorithm.clone(),
        issuer: issuer_name,
        validity: Validity {
            not_before: x509_time(template.not_before)?,
            not_after: x509_time(template.not_after)?,
        },
        subject,
        subject_public_key_info: subject_key.to_spki()?,
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: Some(build_extensions(
            template,
            &subject_key_id,
            authority_key_id.as_deref(),
        )?),
    };

    let tbs_der = tbs_certificate.to_der()?;
    let hashed = tsa_crypto::digest(scheme.hash_algorithm(), &tbs_der);
    let signature = issuer_signer
        .sign_digest(&hashed.digest, scheme.hash_algorithm())
        .await?;

    tracing::debug!(
        subject = %tbs_certificate.subject,
        issuer = %tbs_certificate.issuer,
        "issued certificate"
    );

    Ok(Certificate {
        tbs_certificate,
        signature_algorithm,
        signature: BitString::from_bytes(signature.as_bytes())?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tsa_crypto::x509::{extended_key_usages, is_ca, verify_issued_by, ID_KP_TIME_STAMPING};
    use tsa_crypto::EphemeralSigner;

    #[test]
    fn test_time_encoding_switches_at_2050() {
        let before = Utc.with_ymd_and_hms(2049, 12, 31, 23, 59, 59).unwrap();
        let after = Utc.with_ymd_and_hms(2050, 1, 1, 0, 0, 0).unwrap();
        assert!(matches!(x509_time(before).unwrap(), Time::UtcTime(_)));
        assert!(matches!(x509_time(after).unwrap(), Time::GeneralTime(_)));
    }

    #[test]
    fn test_serial_is_positive() {
        for _ in 0..32 {
            let serial = random_serial().unwrap();
            let bytes = serial.as_bytes();
            assert_eq!(bytes.len(), 16);
            assert_eq!(bytes[0] & 0x80, 0);
        }
    }

    #[test]
    fn test_build_name_renders_cn() {
        let subject = SubjectTemplate {
            common_name: "Test TSA".to_string(),
            organization: vec!["Example".to_string()],
            country: vec!["US".to_string()],
            ..Default::default()
        };
        let name = build_name(&subject).unwrap();
        let rendered = name.to_string();
        assert!(rendered.contains("CN=Test TSA"), "{}", rendered);
        assert!(rendered.contains("O=Example"), "{}", rendered);
        assert!(rendered.contains("C=US"), "{}", rendered);
    }

    #[tokio::test]
    async fn test_self_signed_root() {
        let template = CertificateTemplate::default_root().unwrap();
        let signer = EphemeralSigner::generate();
        let key = signer.public_key().await.unwrap();

        let root = issue_certificate(&template, &key, None, &signer).await.unwrap();

        assert_eq!(root.tbs_certificate.issuer, root.tbs_certificate.subject);
        assert!(is_ca(&root).unwrap());
        verify_issued_by(&root, &root).unwrap();
    }

    #[tokio::test]
    async fn test_leaf_signed_by_root() {
        let root_signer = EphemeralSigner::generate();
        let root_key = root_signer.public_key().await.unwrap();
        let root = issue_certificate(
            &CertificateTemplate::default_root().unwrap(),
            &root_key,
            None,
            &root_signer,
        )
        .await
        .unwrap();

        let leaf_signer = EphemeralSigner::generate();
        let leaf_key = leaf_signer.public_key().await.unwrap();
        let leaf = issue_certificate(
            &CertificateTemplate::default_leaf().unwrap(),
            &leaf_key,
            Some(&root),
            &root_signer,
        )
        .await
        .unwrap();

        assert_eq!(leaf.tbs_certificate.issuer, root.tbs_certificate.subject);
        assert!(!is_ca(&leaf).unwrap());
        assert_eq!(extended_key_usages(&leaf).unwrap(), vec![ID_KP_TIME_STAMPING]);
        verify_issued_by(&leaf, &root).unwrap();

        // Signed by the wrong key
        let stray = EphemeralSigner::generate();
        let forged = issue_certificate(
            &CertificateTemplate::default_leaf().unwrap(),
            &leaf_key,
            Some(&root),
            &stray,
        )
        .await
        .unwrap();
        assert!(verify_issued_by(&forged, &root).is_err());
    }
}
