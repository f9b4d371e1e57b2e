//! ASN.1 types for RFC 3161 Time-Stamp Protocol
//!
//! This module defines the ASN.1 structures used in the Time-Stamp Protocol
//! as specified in RFC 3161, plus the ESS signing-certificate attribute
//! (RFC 5035) that binds a token to its signer.

use const_oid::ObjectIdentifier;
use der::{
    asn1::{BitString, GeneralizedTime, Int, OctetString},
    Decode, DecodeValue, Encode, EncodeValue, FixedTag, Header, Length, Reader, Sequence, Tag,
    Tagged, Writer,
};
use num_bigint::BigUint;
use tsa_crypto::HashAlgorithm;
use x509_cert::ext::pkix::name::{GeneralName, GeneralNames};
use x509_cert::ext::Extensions;
use x509_cert::serial_number::SerialNumber;

/// OID for id-signedData: 1.2.840.113549.1.7.2
pub const OID_SIGNED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2");

/// OID for id-ct-TSTInfo: 1.2.840.113549.1.9.16.1.4
pub const OID_TST_INFO: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.16.1.4");

/// OID for the contentType signed attribute: 1.2.840.113549.1.9.3
pub const OID_CONTENT_TYPE: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.3");

/// OID for the messageDigest signed attribute: 1.2.840.113549.1.9.4
pub const OID_MESSAGE_DIGEST: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.4");

/// OID for the signingTime signed attribute: 1.2.840.113549.1.9.5
pub const OID_SIGNING_TIME: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.5");

/// OID for id-aa-signingCertificateV2: 1.2.840.113549.1.9.16.2.47
pub const OID_SIGNING_CERTIFICATE_V2: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.16.2.47");

/// OID for id-pe-qcStatements: 1.3.6.1.5.5.7.1.3
pub const OID_QC_STATEMENTS: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.1.3");

/// Encode a non-negative integer as a DER INTEGER
pub fn uint_to_int(value: &BigUint) -> Result<Int, der::Error> {
    let mut bytes = value.to_bytes_be();
    if bytes.first().is_some_and(|b| b & 0x80 != 0) {
        bytes.insert(0, 0x00);
    }
    Int::new(&bytes)
}

/// Decode a DER INTEGER, or `None` if it is negative
pub fn int_to_uint(value: &Int) -> Option<BigUint> {
    let bytes = value.as_bytes();
    if bytes.first().is_some_and(|b| b & 0x80 != 0) {
        return None;
    }
    Some(BigUint::from_bytes_be(bytes))
}

/// A policy OBJECT IDENTIFIER
///
/// `ObjectIdentifier`'s own decoder refuses some valid short encodings, e.g.
/// `1.2.3` as `06 02 2a 03`, although it encodes them. Policies are
/// caller-chosen, so their content octets are decoded arc by arc here.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct PolicyOid(pub ObjectIdentifier);

impl PolicyOid {
    pub fn oid(&self) -> ObjectIdentifier {
        self.0
    }
}

impl From<ObjectIdentifier> for PolicyOid {
    fn from(oid: ObjectIdentifier) -> Self {
        Self(oid)
    }
}

impl From<PolicyOid> for ObjectIdentifier {
    fn from(policy: PolicyOid) -> Self {
        policy.0
    }
}

impl std::fmt::Display for PolicyOid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl FixedTag for PolicyOid {
    const TAG: Tag = Tag::ObjectIdentifier;
}

impl<'a> DecodeValue<'a> for PolicyOid {
    fn decode_value<R: Reader<'a>>(reader: &mut R, header: Header) -> der::Result<Self> {
        let content = reader.read_slice(header.length)?;
        let dotted = oid_arcs(content)
            .ok_or_else(|| Tag::ObjectIdentifier.value_error())?
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(".");
        ObjectIdentifier::new(&dotted)
            .map(Self)
            .map_err(|_| Tag::ObjectIdentifier.value_error())
    }
}

impl EncodeValue for PolicyOid {
    fn value_len(&self) -> der::Result<Length> {
        self.0.value_len()
    }

    fn encode_value(&self, writer: &mut impl Writer) -> der::Result<()> {
        self.0.encode_value(writer)
    }
}

/// Arcs of an OID's content octets (X.690 8.19)
///
/// `None` for empty input, a truncated subidentifier, a non-minimal `0x80`
/// lead byte, or an arc above `u32::MAX`.
fn oid_arcs(content: &[u8]) -> Option<Vec<u32>> {
    let mut subidentifiers = Vec::new();
    let mut current: u32 = 0;
    let mut in_progress = false;
    for &byte in content {
        if !in_progress && byte == 0x80 {
            return None;
        }
        current = current.checked_mul(128)?.checked_add(u32::from(byte & 0x7f))?;
        in_progress = byte & 0x80 != 0;
        if !in_progress {
            subidentifiers.push(current);
            current = 0;
        }
    }
    if in_progress {
        return None;
    }

    let (&first, rest) = subidentifiers.split_first()?;
    let (root, second) = match first {
        0..=39 => (0, first),
        40..=79 => (1, first - 40),
        _ => (2, first - 80),
    };
    let mut arcs = vec![root, second];
    arcs.extend_from_slice(rest);
    Some(arcs)
}

/// Algorithm identifier with optional parameters
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct AlgorithmIdentifier {
    /// Algorithm OID
    pub algorithm: ObjectIdentifier,
    /// Optional parameters (usually absent or NULL for hash algorithms)
    #[asn1(optional = "true")]
    pub parameters: Option<der::Any>,
}

impl AlgorithmIdentifier {
    /// Look up the hash algorithm, rejecting broken and unknown ones
    pub fn to_hash_algorithm(&self) -> tsa_crypto::Result<HashAlgorithm> {
        HashAlgorithm::from_oid(&self.algorithm)
    }
}

impl From<HashAlgorithm> for AlgorithmIdentifier {
    fn from(algo: HashAlgorithm) -> Self {
        Self {
            algorithm: algo.oid(),
            parameters: None,
        }
    }
}

/// Message imprint containing hash algorithm and hashed message.
///
/// RFC 3161 Section 2.4.1
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct Asn1MessageImprint {
    /// Hash algorithm used
    pub hash_algorithm: AlgorithmIdentifier,
    /// Hashed message
    pub hashed_message: OctetString,
}

impl Asn1MessageImprint {
    /// Create a new message imprint
    pub fn new(algorithm: AlgorithmIdentifier, digest: Vec<u8>) -> Result<Self, der::Error> {
        Ok(Self {
            hash_algorithm: algorithm,
            hashed_message: OctetString::new(digest)?,
        })
    }
}

/// Time-stamp request
/// RFC 3161 Section 2.4.1
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct TimeStampReq {
    /// Version (must be 1)
    pub version: u8,
    /// Message imprint to be timestamped
    pub message_imprint: Asn1MessageImprint,
    /// Optional policy OID
    #[asn1(optional = "true")]
    pub req_policy: Option<PolicyOid>,
    /// Optional nonce
    #[asn1(optional = "true")]
    pub nonce: Option<Int>,
    /// Whether to include certificates in response
    #[asn1(default = "default_false")]
    pub cert_req: bool,
    /// Extensions
    #[asn1(context_specific = "0", optional = "true", tag_mode = "IMPLICIT")]
    pub extensions: Option<Extensions>,
}

fn default_false() -> bool {
    false
}

impl TimeStampReq {
    /// Decode from DER bytes
    pub fn from_der_bytes(bytes: &[u8]) -> Result<Self, der::Error> {
        Self::from_der(bytes)
    }

    /// Encode to DER
    pub fn to_der(&self) -> Result<Vec<u8>, der::Error> {
        Encode::to_der(self)
    }
}

/// PKI status values
/// RFC 3161 Section 2.4.2
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum PkiStatus {
    /// Granted
    Granted = 0,
    /// Granted with modifications
    GrantedWithMods = 1,
    /// Rejection
    Rejection = 2,
    /// Waiting
    Waiting = 3,
    /// Revocation warning
    RevocationWarning = 4,
    /// Revocation notification
    RevocationNotification = 5,
}

impl TryFrom<u8> for PkiStatus {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PkiStatus::Granted),
            1 => Ok(PkiStatus::GrantedWithMods),
            2 => Ok(PkiStatus::Rejection),
            3 => Ok(PkiStatus::Waiting),
            4 => Ok(PkiStatus::RevocationWarning),
            5 => Ok(PkiStatus::RevocationNotification),
            _ => Err(()),
        }
    }
}

/// PKI status info
/// RFC 3161 Section 2.4.2
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct PkiStatusInfo {
    /// Status value
    pub status: u8,
    /// Optional human-readable text (PKIFreeText)
    #[asn1(optional = "true")]
    pub status_string: Option<Vec<String>>,
    /// Optional failure info
    #[asn1(optional = "true")]
    pub fail_info: Option<BitString>,
}

impl PkiStatusInfo {
    /// Status granted, no text or failure info
    pub fn granted() -> Self {
        Self {
            status: PkiStatus::Granted as u8,
            status_string: None,
            fail_info: None,
        }
    }

    /// Check if the status indicates success
    pub fn is_success(&self) -> bool {
        self.status == PkiStatus::Granted as u8 || self.status == PkiStatus::GrantedWithMods as u8
    }

    /// Get the status as an enum
    pub fn status_enum(&self) -> Option<PkiStatus> {
        PkiStatus::try_from(self.status).ok()
    }

    /// PKIFailureInfo as a bit mask, bit `n` of the BIT STRING at `1 << n`
    pub fn fail_info_bits(&self) -> Option<u32> {
        self.fail_info.as_ref().map(|bits| {
            bits.bits()
                .take(32)
                .enumerate()
                .filter(|(_, set)| *set)
                .fold(0u32, |acc, (i, _)| acc | (1 << i))
        })
    }
}

/// Accuracy of the timestamp
/// RFC 3161 Section 2.4.2
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct Accuracy {
    /// Seconds
    #[asn1(optional = "true")]
    pub seconds: Option<u64>,
    /// Milliseconds (1-999)
    #[asn1(context_specific = "0", optional = "true", tag_mode = "IMPLICIT")]
    pub millis: Option<u16>,
    /// Microseconds (1-999)
    #[asn1(context_specific = "1", optional = "true", tag_mode = "IMPLICIT")]
    pub micros: Option<u16>,
}

impl Accuracy {
    /// Split a duration into seconds, millis and micros, omitting zero parts
    pub fn from_duration(duration: std::time::Duration) -> Self {
        let millis = duration.subsec_millis() as u16;
        let micros = (duration.subsec_micros() % 1000) as u16;
        Self {
            seconds: Some(duration.as_secs()).filter(|s| *s > 0),
            millis: Some(millis).filter(|m| *m > 0),
            micros: Some(micros).filter(|m| *m > 0),
        }
    }

    pub fn to_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.seconds.unwrap_or(0))
            + std::time::Duration::from_millis(u64::from(self.millis.unwrap_or(0)))
            + std::time::Duration::from_micros(u64::from(self.micros.unwrap_or(0)))
    }
}

/// TSTInfo - the actual timestamp token info
/// RFC 3161 Section 2.4.2
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct TstInfo {
    /// Version (must be 1)
    pub version: u8,
    /// Policy OID
    pub policy: PolicyOid,
    /// Message imprint
    pub message_imprint: Asn1MessageImprint,
    /// Serial number
    pub serial_number: Int,
    /// Generation time, kept raw so fractional seconds survive decoding
    pub gen_time: der::Any,
    /// Accuracy
    #[asn1(optional = "true")]
    pub accuracy: Option<Accuracy>,
    /// Ordering
    #[asn1(default = "default_false")]
    pub ordering: bool,
    /// Nonce
    #[asn1(optional = "true")]
    pub nonce: Option<Int>,
    /// TSA name
    #[asn1(context_specific = "0", optional = "true", tag_mode = "EXPLICIT")]
    pub tsa: Option<GeneralName>,
    /// Extensions
    #[asn1(context_specific = "1", optional = "true", tag_mode = "IMPLICIT")]
    pub extensions: Option<Extensions>,
}

impl TstInfo {
    /// Decode from DER bytes
    pub fn from_der_bytes(bytes: &[u8]) -> Result<Self, der::Error> {
        Self::from_der(bytes)
    }

    /// Encode a whole-second generation time
    pub fn gen_time_from_unix(secs: u64) -> Result<der::Any, der::Error> {
        let time = GeneralizedTime::from_unix_duration(std::time::Duration::from_secs(secs))?;
        der::Any::encode_from(&time)
    }

    /// Generation time as text, if it is a GeneralizedTime
    pub fn gen_time_str(&self) -> Option<&str> {
        if self.gen_time.tag() != Tag::GeneralizedTime {
            return None;
        }
        std::str::from_utf8(self.gen_time.value()).ok()
    }
}

/// Time-stamp response
/// RFC 3161 Section 2.4.2
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct TimeStampResp {
    /// Status information
    pub status: PkiStatusInfo,
    /// Time-stamp token (CMS ContentInfo)
    #[asn1(optional = "true")]
    pub time_stamp_token: Option<der::Any>,
}

impl TimeStampResp {
    /// Decode from DER bytes
    pub fn from_der_bytes(bytes: &[u8]) -> Result<Self, der::Error> {
        Self::from_der(bytes)
    }

    /// Check if the response indicates success
    pub fn is_success(&self) -> bool {
        self.status.is_success() && self.time_stamp_token.is_some()
    }
}

/// IssuerSerial
/// RFC 5035 Section 4
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct IssuerSerial {
    pub issuer: GeneralNames,
    pub serial_number: SerialNumber,
}

/// ESSCertIDv2
/// RFC 5035 Section 4
///
/// `hash_algorithm` is absent when it is the SHA-256 default.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct EssCertIdV2 {
    #[asn1(optional = "true")]
    pub hash_algorithm: Option<AlgorithmIdentifier>,
    pub cert_hash: OctetString,
    #[asn1(optional = "true")]
    pub issuer_serial: Option<IssuerSerial>,
}

impl EssCertIdV2 {
    /// Hash algorithm of `cert_hash`, applying the SHA-256 default
    pub fn hash_algorithm(&self) -> tsa_crypto::Result<HashAlgorithm> {
        match &self.hash_algorithm {
            Some(alg) => alg.to_hash_algorithm(),
            None => Ok(HashAlgorithm::Sha2256),
        }
    }
}

/// SigningCertificateV2
/// RFC 5035 Section 3
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct SigningCertificateV2 {
    pub certs: Vec<EssCertIdV2>,
    #[asn1(optional = "true")]
    pub policies: Option<Vec<der::Any>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn imprint() -> Asn1MessageImprint {
        Asn1MessageImprint::new(HashAlgorithm::Sha2256.into(), vec![0u8; 32]).unwrap()
    }

    #[test]
    fn test_timestamp_req_defaults_omitted() {
        let req = TimeStampReq {
            version: 1,
            message_imprint: imprint(),
            req_policy: None,
            nonce: None,
            cert_req: false,
            extensions: None,
        };
        let der = req.to_der().unwrap();
        let decoded = TimeStampReq::from_der_bytes(&der).unwrap();
        assert_eq!(decoded, req);
        // certReq FALSE is the DEFAULT and must not be encoded
        assert!(!der.windows(3).any(|w| w == [0x01, 0x01, 0x00]));
    }

    #[rstest]
    #[case(0u64)]
    #[case(127)]
    #[case(128)]
    #[case(u64::MAX)]
    fn test_uint_int_conversion(#[case] value: u64) {
        let value = BigUint::from(value);
        let int = uint_to_int(&value).unwrap();
        assert_eq!(int_to_uint(&int), Some(value));
    }

    #[test]
    fn test_negative_int_is_rejected() {
        let negative = Int::new(&[0xff]).unwrap();
        assert_eq!(int_to_uint(&negative), None);
    }

    #[test]
    fn test_accuracy_split() {
        let accuracy = Accuracy::from_duration(std::time::Duration::from_micros(1_250_500));
        assert_eq!(accuracy.seconds, Some(1));
        assert_eq!(accuracy.millis, Some(250));
        assert_eq!(accuracy.micros, Some(500));
        assert_eq!(
            accuracy.to_duration(),
            std::time::Duration::from_micros(1_250_500)
        );

        let whole = Accuracy::from_duration(std::time::Duration::from_secs(1));
        assert_eq!(whole.millis, None);
        assert_eq!(whole.micros, None);
    }

    #[test]
    fn test_accuracy_millis_are_implicitly_tagged() {
        let accuracy = Accuracy {
            seconds: None,
            millis: Some(5),
            micros: None,
        };
        // SEQUENCE { [0] IMPLICIT INTEGER 5 }
        assert_eq!(accuracy.to_der().unwrap(), vec![0x30, 0x03, 0x80, 0x01, 0x05]);
    }

    #[test]
    fn test_status_string_decoding() {
        let info = PkiStatusInfo {
            status: PkiStatus::Rejection as u8,
            status_string: Some(vec!["unsupported algorithm".to_string()]),
            fail_info: Some(BitString::from_bytes(&[0x80]).unwrap()),
        };
        let decoded = PkiStatusInfo::from_der(&info.to_der().unwrap()).unwrap();
        assert_eq!(decoded, info);
        assert!(!decoded.is_success());
        assert_eq!(decoded.status_enum(), Some(PkiStatus::Rejection));
        assert_eq!(decoded.fail_info_bits(), Some(1));
    }

    #[test]
    fn test_ess_cert_id_default_hash() {
        let id = EssCertIdV2 {
            hash_algorithm: None,
            cert_hash: OctetString::new(vec![1u8; 32]).unwrap(),
            issuer_serial: None,
        };
        assert_eq!(id.hash_algorithm().unwrap(), HashAlgorithm::Sha2256);
    }

    #[test]
    fn test_three_arc_policy_decodes() {
        let der = [0x06, 0x02, 0x2a, 0x03];
        let policy = PolicyOid::from_der(&der).unwrap();
        assert_eq!(policy.oid(), ObjectIdentifier::new_unwrap("1.2.3"));
        assert_eq!(policy.to_der().unwrap(), der.to_vec());
    }

    #[test]
    fn test_multi_byte_arcs_decode() {
        let oid = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.2");
        let der = PolicyOid(oid).to_der().unwrap();
        assert_eq!(PolicyOid::from_der(&der).unwrap().oid(), oid);
    }

    #[rstest]
    #[case::empty(&[0x06, 0x00][..])]
    #[case::truncated(&[0x06, 0x02, 0x2a, 0x83][..])]
    #[case::non_minimal(&[0x06, 0x03, 0x2a, 0x80, 0x03][..])]
    #[case::arc_overflow(&[0x06, 0x07, 0x2a, 0x90, 0x80, 0x80, 0x80, 0x80, 0x00][..])]
    fn test_malformed_policy_rejected(#[case] der: &[u8]) {
        assert!(PolicyOid::from_der(der).is_err());
    }

    #[test]
    fn test_request_with_three_arc_policy_round_trips() {
        let req = TimeStampReq {
            version: 1,
            message_imprint: imprint(),
            req_policy: Some(ObjectIdentifier::new_unwrap("1.2.3").into()),
            nonce: None,
            cert_req: true,
            extensions: None,
        };
        let decoded = TimeStampReq::from_der_bytes(&req.to_der().unwrap()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_pki_status() {
        assert!(PkiStatus::try_from(0).is_ok());
        assert!(PkiStatus::try_from(5).is_ok());
        assert!(PkiStatus::try_from(6).is_err());
    }
}
