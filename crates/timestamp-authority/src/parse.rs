//! RFC 3161 timestamp response decoding
//!
//! A response arrives either as a full `TimeStampResp` or as the bare token
//! (a CMS `ContentInfo`). Both decode into a [`TimestampResponse`] whose
//! semantic fields come from the signed TSTInfo. The structure walked is:
//!
//! ```text
//! TimeStampResp ::= SEQUENCE {
//!   status PKIStatusInfo,
//!   timeStampToken TimeStampToken OPTIONAL }
//!
//! TimeStampToken ::= ContentInfo {
//!   contentType id-signedData,
//!   content [0] EXPLICIT SignedData {
//!     encapContentInfo {
//!       eContentType id-ct-TSTInfo,
//!       eContent [0] EXPLICIT OCTET STRING (TSTInfo DER) } } }
//! ```
//!
//! A status other than granted surfaces as [`Error::RejectedByAuthority`];
//! anything structurally wrong is [`Error::MalformedToken`].

use crate::asn1::{self, PkiStatus, PkiStatusInfo, TimeStampResp, TstInfo};
use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use cms::cert::CertificateChoices;
use cms::content_info::ContentInfo;
use cms::signed_data::{SignedData, SignerIdentifier, SignerInfo};
use const_oid::ObjectIdentifier;
use der::{Decode, Encode, Tag, Tagged};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tsa_crypto::HashAlgorithm;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::SubjectKeyIdentifier;
use x509_cert::ext::Extension;
use x509_cert::Certificate;

/// A decoded timestamp response
#[derive(Debug, Clone)]
pub struct TimestampResponse {
    /// Granted or granted with modifications
    pub status: PkiStatus,
    pub hash_algorithm: HashAlgorithm,
    pub hashed_message: Vec<u8>,
    /// genTime from the TSTInfo
    pub time: DateTime<Utc>,
    pub nonce: Option<BigUint>,
    pub policy: ObjectIdentifier,
    pub accuracy: Duration,
    pub ordering: bool,
    /// Whether the TSTInfo carries a qcStatements extension
    pub qualified: bool,
    /// Whether the token embeds certificates
    pub add_tsa_certificate: bool,
    pub extensions: Vec<Extension>,
    pub serial_number: BigUint,
    pub tsa_name: Option<GeneralName>,
    /// DER `ContentInfo` of the token
    pub raw_token: Vec<u8>,
    /// Embedded certificates, signer first when it is among them
    pub certificates: Vec<Certificate>,
    pub(crate) signed_data: SignedData,
    pub(crate) tst_info_der: Vec<u8>,
}

impl TimestampResponse {
    /// The embedded certificate that produced the signature, if embedded
    pub fn signer_certificate(&self) -> Option<&Certificate> {
        let signer = self.signer_info().ok()?;
        self.certificates
            .iter()
            .find(|cert| matches_signer(cert, &signer.sid))
    }

    /// The token's single SignerInfo
    pub(crate) fn signer_info(&self) -> Result<&SignerInfo> {
        self.signed_data
            .signer_infos
            .0
            .get(0)
            .ok_or_else(|| Error::MalformedToken("token has no SignerInfo".to_string()))
    }

    /// Encode the JSON form of this response
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let json = JsonResponse {
            status: self.status as u8,
            hash_algorithm: self.hash_algorithm.name().to_string(),
            hashed_message: STANDARD.encode(&self.hashed_message),
            time: self.time.to_rfc3339(),
            nonce: self.nonce.as_ref().map(|n| n.to_string()),
            policy: self.policy.to_string(),
            accuracy_millis: u64::try_from(self.accuracy.as_millis()).unwrap_or(u64::MAX),
            ordering: self.ordering,
            qualified: self.qualified,
            add_tsa_certificate: self.add_tsa_certificate,
            serial_number: self.serial_number.to_string(),
            tsa_name: self.tsa_name.as_ref().and_then(directory_name),
            timestamp_token: STANDARD.encode(&self.raw_token),
        };
        serde_json::to_vec(&json)
            .map_err(|e| Error::MalformedToken(format!("failed to encode JSON response: {}", e)))
    }
}

/// JSON rendering of a timestamp response
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonResponse {
    status: u8,
    hash_algorithm: String,
    hashed_message: String,
    time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,
    policy: String,
    accuracy_millis: u64,
    ordering: bool,
    qualified: bool,
    add_tsa_certificate: bool,
    serial_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tsa_name: Option<String>,
    timestamp_token: String,
}

/// Only the signed token is trusted when reading the JSON form back
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonToken {
    timestamp_token: String,
}

fn directory_name(name: &GeneralName) -> Option<String> {
    match name {
        GeneralName::DirectoryName(name) => Some(name.to_string()),
        _ => None,
    }
}

fn malformed<E: std::fmt::Display>(context: &'static str) -> impl FnOnce(E) -> Error {
    move |e| Error::MalformedToken(format!("{}: {}", context, e))
}

/// Decode a DER `TimeStampResp` or a bare `ContentInfo` token
pub fn decode_response(bytes: &[u8]) -> Result<TimestampResponse> {
    match TimeStampResp::from_der_bytes(bytes) {
        Ok(resp) => {
            let status = check_status(&resp.status)?;
            let token = resp.time_stamp_token.ok_or_else(|| {
                Error::MalformedToken("granted response carries no timeStampToken".to_string())
            })?;
            let raw = token
                .to_der()
                .map_err(malformed("failed to re-encode timeStampToken"))?;
            let mut response = decode_token(&raw)?;
            response.status = status;
            Ok(response)
        }
        Err(e) => {
            tracing::debug!(error = %e, "not a TimeStampResp, decoding as a bare token");
            decode_token(bytes)
        }
    }
}

/// Decode the JSON response form
///
/// Only `timestampToken` is read; every other field is re-derived from the
/// signed token so it cannot disagree with what was signed.
pub fn decode_json_response(bytes: &[u8]) -> Result<TimestampResponse> {
    let json: JsonToken =
        serde_json::from_slice(bytes).map_err(malformed("invalid JSON response"))?;
    let raw = STANDARD
        .decode(json.timestamp_token)
        .map_err(malformed("invalid base64 timestampToken"))?;
    decode_token(&raw)
}

fn check_status(info: &PkiStatusInfo) -> Result<PkiStatus> {
    match info.status_enum() {
        Some(status @ (PkiStatus::Granted | PkiStatus::GrantedWithMods)) => Ok(status),
        _ => {
            tracing::warn!(status = info.status, "timestamp response not granted");
            Err(Error::RejectedByAuthority {
                status: info.status,
                status_string: info.status_string.clone().unwrap_or_default(),
                fail_info: info.fail_info_bits(),
            })
        }
    }
}

/// Decode a timestamp token (DER `ContentInfo` wrapping SignedData)
pub fn decode_token(bytes: &[u8]) -> Result<TimestampResponse> {
    let content_info =
        ContentInfo::from_der(bytes).map_err(malformed("failed to decode ContentInfo"))?;
    if content_info.content_type != asn1::OID_SIGNED_DATA {
        return Err(Error::MalformedToken(format!(
            "content type {} is not SignedData",
            content_info.content_type
        )));
    }

    let signed_data_der = content_info
        .content
        .to_der()
        .map_err(malformed("failed to encode SignedData content"))?;
    let signed_data =
        SignedData::from_der(&signed_data_der).map_err(malformed("failed to decode SignedData"))?;

    let encap = &signed_data.encap_content_info;
    if encap.econtent_type != asn1::OID_TST_INFO {
        return Err(Error::MalformedToken(format!(
            "encapsulated content type {} is not TSTInfo",
            encap.econtent_type
        )));
    }
    let econtent = encap
        .econtent
        .as_ref()
        .ok_or_else(|| Error::MalformedToken("token has no eContent".to_string()))?;
    if econtent.tag() != Tag::OctetString {
        return Err(Error::MalformedToken(format!(
            "eContent is {}, expected OCTET STRING",
            econtent.tag()
        )));
    }
    let tst_info_der = econtent.value().to_vec();

    let tst_info =
        TstInfo::from_der_bytes(&tst_info_der).map_err(malformed("failed to decode TSTInfo"))?;
    if tst_info.version != 1 {
        return Err(Error::MalformedToken(format!(
            "unsupported TSTInfo version {}",
            tst_info.version
        )));
    }

    let hash_algorithm = tst_info
        .message_imprint
        .hash_algorithm
        .to_hash_algorithm()
        .map_err(malformed("unsupported message imprint algorithm"))?;
    let nonce = tst_info
        .nonce
        .as_ref()
        .map(|n| {
            asn1::int_to_uint(n)
                .ok_or_else(|| Error::MalformedToken("nonce is negative".to_string()))
        })
        .transpose()?;
    let serial_number = asn1::int_to_uint(&tst_info.serial_number)
        .ok_or_else(|| Error::MalformedToken("serial number is negative".to_string()))?;
    let gen_time = tst_info
        .gen_time_str()
        .ok_or_else(|| Error::MalformedToken("genTime is not a GeneralizedTime".to_string()))?;
    let time = parse_generalized_time(gen_time)?;

    let signer_sid = signed_data
        .signer_infos
        .0
        .get(0)
        .map(|info| info.sid.clone())
        .ok_or_else(|| Error::MalformedToken("token has no SignerInfo".to_string()))?;

    let extensions = tst_info.extensions.clone().unwrap_or_default();
    let qualified = extensions
        .iter()
        .any(|ext| ext.extn_id == asn1::OID_QC_STATEMENTS);

    let mut certificates = extract_certificates(&signed_data);
    if let Some(pos) = certificates
        .iter()
        .position(|cert| matches_signer(cert, &signer_sid))
    {
        let signer = certificates.remove(pos);
        certificates.insert(0, signer);
    }

    tracing::debug!(
        %time,
        policy = %tst_info.policy,
        certificates = certificates.len(),
        "decoded timestamp token"
    );

    Ok(TimestampResponse {
        status: PkiStatus::Granted,
        hash_algorithm,
        hashed_message: tst_info.message_imprint.hashed_message.as_bytes().to_vec(),
        time,
        nonce,
        policy: tst_info.policy.oid(),
        accuracy: tst_info
            .accuracy
            .as_ref()
            .map(|a| a.to_duration())
            .unwrap_or_default(),
        ordering: tst_info.ordering,
        qualified,
        add_tsa_certificate: !certificates.is_empty(),
        extensions,
        serial_number,
        tsa_name: tst_info.tsa,
        raw_token: bytes.to_vec(),
        certificates,
        signed_data,
        tst_info_der,
    })
}

/// Certificates carried in the SignedData `certificates` field
pub(crate) fn extract_certificates(signed_data: &SignedData) -> Vec<Certificate> {
    let mut certificates = Vec::new();
    if let Some(set) = &signed_data.certificates {
        for choice in set.0.iter() {
            if let CertificateChoices::Certificate(cert) = choice {
                certificates.push(cert.clone());
            } else {
                tracing::debug!("skipping non-X.509 certificate choice");
            }
        }
    }
    certificates
}

/// Whether `cert` is the one named by a SignerIdentifier
pub(crate) fn matches_signer(cert: &Certificate, sid: &SignerIdentifier) -> bool {
    match sid {
        SignerIdentifier::IssuerAndSerialNumber(id) => {
            cert.tbs_certificate.issuer == id.issuer
                && cert.tbs_certificate.serial_number == id.serial_number
        }
        SignerIdentifier::SubjectKeyIdentifier(ski) => {
            let found: Option<(bool, SubjectKeyIdentifier)> =
                cert.tbs_certificate.get().ok().flatten();
            found.is_some_and(|(_, cert_ski)| &cert_ski == ski)
        }
    }
}

/// Extract genTime as Unix seconds from a response or bare token
pub fn parse_timestamp(timestamp_bytes: &[u8]) -> Result<i64> {
    Ok(decode_response(timestamp_bytes)?.time.timestamp())
}

/// Parse a GeneralizedTime value
///
/// Format: `YYYYMMDDHHMMSSZ` or `YYYYMMDDHHMMSS.f...Z` with up to nine
/// fractional digits. Local-time and offset forms are rejected.
pub fn parse_generalized_time(time_str: &str) -> Result<DateTime<Utc>> {
    let invalid = || Error::MalformedToken(format!("invalid GeneralizedTime: {}", time_str));

    let body = time_str.strip_suffix('Z').ok_or_else(invalid)?;
    let (base, fraction) = match body.split_once('.') {
        Some((base, fraction)) => (base, Some(fraction)),
        None => (body, None),
    };
    if base.len() != 14 || !base.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    let field = |range: std::ops::Range<usize>| -> Result<u32> {
        base[range].parse().map_err(|_| invalid())
    };
    let year = i32::try_from(field(0..4)?).map_err(|_| invalid())?;
    let (month, day) = (field(4..6)?, field(6..8)?);
    let (hour, minute, second) = (field(8..10)?, field(10..12)?, field(12..14)?);

    let nanos = match fraction {
        None => 0,
        Some(f) if !f.is_empty() && f.len() <= 9 && f.bytes().all(|b| b.is_ascii_digit()) => {
            let digits: u32 = f.parse().map_err(|_| invalid())?;
            digits * 10u32.pow(9 - f.len() as u32)
        }
        Some(_) => return Err(invalid()),
    };

    let naive = NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_nano_opt(hour, minute, second, nanos))
        .ok_or_else(invalid)?;
    Ok(Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asn1::{Asn1MessageImprint, OID_SIGNED_DATA};
    use chrono::Timelike;
    use cms::content_info::CmsVersion;
    use cms::signed_data::{EncapsulatedContentInfo, SignerInfos};
    use der::asn1::{OctetString, SetOfVec};
    use rstest::rstest;

    fn tst_info(version: u8, hash_algorithm: asn1::AlgorithmIdentifier) -> TstInfo {
        TstInfo {
            version,
            policy: ObjectIdentifier::new_unwrap("1.2.3").into(),
            message_imprint: Asn1MessageImprint {
                hash_algorithm,
                hashed_message: OctetString::new(vec![7u8; 32]).unwrap(),
            },
            serial_number: asn1::uint_to_int(&BigUint::from(42u32)).unwrap(),
            gen_time: TstInfo::gen_time_from_unix(1_700_000_000).unwrap(),
            accuracy: None,
            ordering: false,
            nonce: None,
            tsa: None,
            extensions: None,
        }
    }

    /// A token with no signers; enough to exercise structural decoding
    fn unsigned_token(econtent_type: ObjectIdentifier, tst: &TstInfo) -> Vec<u8> {
        let signed_data = SignedData {
            version: CmsVersion::V3,
            digest_algorithms: SetOfVec::new(),
            encap_content_info: EncapsulatedContentInfo {
                econtent_type,
                econtent: Some(der::Any::new(Tag::OctetString, tst.to_der().unwrap()).unwrap()),
            },
            certificates: None,
            crls: None,
            signer_infos: SignerInfos(SetOfVec::new()),
        };
        ContentInfo {
            content_type: OID_SIGNED_DATA,
            content: der::Any::encode_from(&signed_data).unwrap(),
        }
        .to_der()
        .unwrap()
    }

    #[rstest]
    #[case("20231215120000Z", 0)]
    #[case("20231215120000.5Z", 500_000_000)]
    #[case("20231215120000.123456789Z", 123_456_789)]
    fn test_parse_generalized_time(#[case] text: &str, #[case] nanos: u32) {
        let time = parse_generalized_time(text).unwrap();
        assert_eq!(time.timestamp(), 1_702_641_600);
        assert_eq!(time.nanosecond(), nanos);
    }

    #[rstest]
    #[case("2023")]
    #[case("20231215120000")]
    #[case("20231332120000Z")]
    #[case("20231215120000.Z")]
    #[case("20231215120000+0100")]
    #[case("2023121512000aZ")]
    fn test_parse_generalized_time_invalid(#[case] text: &str) {
        assert!(matches!(
            parse_generalized_time(text),
            Err(Error::MalformedToken(_))
        ));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            decode_response(b"definitely not DER"),
            Err(Error::MalformedToken(_))
        ));
    }

    #[test]
    fn test_rejected_status() {
        let resp = TimeStampResp {
            status: PkiStatusInfo {
                status: PkiStatus::Rejection as u8,
                status_string: Some(vec!["bad request".to_string()]),
                fail_info: Some(der::asn1::BitString::from_bytes(&[0x20]).unwrap()),
            },
            time_stamp_token: None,
        };
        let err = decode_response(&resp.to_der().unwrap()).unwrap_err();
        match err {
            Error::RejectedByAuthority {
                status,
                status_string,
                fail_info,
            } => {
                assert_eq!(status, 2);
                assert_eq!(status_string, vec!["bad request".to_string()]);
                // badRequest is bit 2
                assert_eq!(fail_info, Some(1 << 2));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_granted_without_token_is_malformed() {
        let resp = TimeStampResp {
            status: PkiStatusInfo::granted(),
            time_stamp_token: None,
        };
        assert!(matches!(
            decode_response(&resp.to_der().unwrap()),
            Err(Error::MalformedToken(_))
        ));
    }

    #[test]
    fn test_wrong_content_type_is_malformed() {
        let tst = tst_info(1, HashAlgorithm::Sha2256.into());
        let token = unsigned_token(ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1"), &tst);
        let err = decode_token(&token).unwrap_err();
        assert!(err.to_string().contains("not TSTInfo"));
    }

    #[test]
    fn test_unsupported_version_is_malformed() {
        let tst = tst_info(2, HashAlgorithm::Sha2256.into());
        let err = decode_token(&unsigned_token(asn1::OID_TST_INFO, &tst)).unwrap_err();
        assert!(err.to_string().contains("version 2"));
    }

    #[test]
    fn test_token_without_signer_is_malformed() {
        let tst = tst_info(1, HashAlgorithm::Sha2256.into());
        let err = decode_token(&unsigned_token(asn1::OID_TST_INFO, &tst)).unwrap_err();
        assert!(err.to_string().contains("SignerInfo"));
    }

    #[test]
    fn test_weak_imprint_algorithm_is_malformed() {
        let sha1 = asn1::AlgorithmIdentifier {
            algorithm: tsa_crypto::hash::OID_SHA1,
            parameters: None,
        };
        let tst = tst_info(1, sha1);
        assert!(matches!(
            decode_token(&unsigned_token(asn1::OID_TST_INFO, &tst)),
            Err(Error::MalformedToken(_))
        ));
    }
}
