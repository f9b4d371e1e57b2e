//! Timestamp request decoding and validation
//!
//! Requests arrive either as a DER `TimeStampReq` (`application/timestamp-query`)
//! or as a JSON document (`application/json`). Both forms decode into the same
//! [`TimestampRequest`], which is validated before the authority signs
//! anything.

use crate::asn1::{self, Asn1MessageImprint, TimeStampReq};
use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use const_oid::ObjectIdentifier;
use der::Decode;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use tsa_crypto::HashAlgorithm;
use x509_cert::ext::Extension;

/// Largest accepted nonce, in bytes
pub const MAX_NONCE_BYTES: usize = 32;

/// Media type of DER timestamp requests
pub const TIMESTAMP_QUERY: &str = "application/timestamp-query";

/// Media type of DER timestamp responses
pub const TIMESTAMP_REPLY: &str = "application/timestamp-reply";

/// Media type of JSON requests and responses
pub const JSON: &str = "application/json";

/// Wire format of a request, mirrored by its response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Json,
    Der,
}

impl ContentType {
    /// Parse a `Content-Type` value, ignoring parameters after `;`
    pub fn from_media_type(media_type: &str) -> Result<Self> {
        let essence = media_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            JSON => Ok(ContentType::Json),
            TIMESTAMP_QUERY => Ok(ContentType::Der),
            _ => Err(Error::MalformedRequest(format!(
                "unsupported content type: {}",
                media_type
            ))),
        }
    }

    /// Media type of the response to a request of this type
    pub fn response_media_type(&self) -> &'static str {
        match self {
            ContentType::Json => JSON,
            ContentType::Der => TIMESTAMP_REPLY,
        }
    }
}

/// A decoded, validated timestamp request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampRequest {
    pub hash_algorithm: HashAlgorithm,
    pub hashed_message: Vec<u8>,
    pub nonce: Option<BigUint>,
    pub policy: Option<ObjectIdentifier>,
    /// Whether the signing certificates should be embedded in the token
    pub cert_req: bool,
    pub extensions: Vec<Extension>,
}

impl TimestampRequest {
    /// Create a request for an already computed digest
    pub fn new(hash_algorithm: HashAlgorithm, hashed_message: Vec<u8>) -> Self {
        Self {
            hash_algorithm,
            hashed_message,
            nonce: None,
            policy: None,
            cert_req: false,
            extensions: Vec::new(),
        }
    }

    /// Create a request by hashing `artifact`
    pub fn for_artifact(hash_algorithm: HashAlgorithm, artifact: &[u8]) -> Self {
        Self::new(hash_algorithm, tsa_crypto::digest(hash_algorithm, artifact).digest)
    }

    pub fn with_nonce(mut self, nonce: BigUint) -> Self {
        self.nonce = Some(nonce);
        self
    }

    pub fn with_policy(mut self, policy: ObjectIdentifier) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_cert_req(mut self, cert_req: bool) -> Self {
        self.cert_req = cert_req;
        self
    }

    pub fn with_extensions(mut self, extensions: Vec<Extension>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Check structural constraints
    pub fn validate(&self) -> Result<()> {
        let expected = self.hash_algorithm.digest_size();
        if self.hashed_message.len() != expected {
            return Err(Error::MalformedRequest(format!(
                "hashed message is {} bytes, {} requires {}",
                self.hashed_message.len(),
                self.hash_algorithm,
                expected
            )));
        }
        if let Some(nonce) = &self.nonce {
            let len = nonce.to_bytes_be().len();
            if len > MAX_NONCE_BYTES {
                return Err(Error::MalformedRequest(format!(
                    "nonce is {} bytes, at most {} are allowed",
                    len, MAX_NONCE_BYTES
                )));
            }
        }
        Ok(())
    }

    /// Encode as a DER `TimeStampReq`
    pub fn to_der(&self) -> Result<Vec<u8>> {
        let der_err = |e: der::Error| Error::MalformedRequest(format!("failed to encode request: {}", e));
        let req = TimeStampReq {
            version: 1,
            message_imprint: Asn1MessageImprint::new(
                self.hash_algorithm.into(),
                self.hashed_message.clone(),
            )
            .map_err(der_err)?,
            req_policy: self.policy.map(asn1::PolicyOid),
            nonce: self
                .nonce
                .as_ref()
                .map(asn1::uint_to_int)
                .transpose()
                .map_err(der_err)?,
            cert_req: self.cert_req,
            extensions: Some(self.extensions.clone()).filter(|e| !e.is_empty()),
        };
        req.to_der().map_err(der_err)
    }

    /// Encode as a JSON request
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let json = JsonRequest {
            certificates: self.cert_req,
            hash_algorithm: Some(self.hash_algorithm.name().to_string()),
            artifact_hash: Some(STANDARD.encode(&self.hashed_message)),
            artifact: None,
            nonce: self.nonce.as_ref().map(|n| JsonNonce::Text(n.to_string())),
            tsa_policy_oid: self.policy.map(|oid| oid.to_string()),
        };
        serde_json::to_vec(&json)
            .map_err(|e| Error::MalformedRequest(format!("failed to encode request: {}", e)))
    }

    /// Encode in the given wire format
    pub fn encode(&self, content_type: ContentType) -> Result<Vec<u8>> {
        match content_type {
            ContentType::Json => self.to_json(),
            ContentType::Der => self.to_der(),
        }
    }
}

/// Decode and validate a request body
pub fn decode_request(bytes: &[u8], content_type: ContentType) -> Result<TimestampRequest> {
    let request = match content_type {
        ContentType::Der => decode_der_request(bytes)?,
        ContentType::Json => decode_json_request(bytes)?,
    };
    request.validate()?;

    tracing::debug!(
        hash_algorithm = %request.hash_algorithm,
        nonce = request.nonce.is_some(),
        cert_req = request.cert_req,
        "decoded timestamp request"
    );
    Ok(request)
}

fn hash_algorithm_error(e: tsa_crypto::Error) -> Error {
    match e {
        tsa_crypto::Error::WeakHashAlgorithm(name) => {
            tracing::warn!(algorithm = %name, "rejecting request with weak hash algorithm");
            Error::WeakHashAlgorithm(name)
        }
        other => Error::MalformedRequest(other.to_string()),
    }
}

fn decode_der_request(bytes: &[u8]) -> Result<TimestampRequest> {
    let req = TimeStampReq::from_der(bytes)
        .map_err(|e| Error::MalformedRequest(format!("failed to decode TimeStampReq: {}", e)))?;

    if req.version != 1 {
        return Err(Error::MalformedRequest(format!(
            "unsupported request version {}",
            req.version
        )));
    }

    let hash_algorithm = req
        .message_imprint
        .hash_algorithm
        .to_hash_algorithm()
        .map_err(hash_algorithm_error)?;

    let nonce = req
        .nonce
        .as_ref()
        .map(|n| {
            asn1::int_to_uint(n)
                .ok_or_else(|| Error::MalformedRequest("nonce must not be negative".to_string()))
        })
        .transpose()?;

    Ok(TimestampRequest {
        hash_algorithm,
        hashed_message: req.message_imprint.hashed_message.as_bytes().to_vec(),
        nonce,
        policy: req.req_policy.map(ObjectIdentifier::from),
        cert_req: req.cert_req,
        extensions: req.extensions.unwrap_or_default(),
    })
}

/// JSON nonces may be sent as a decimal string or as a number
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum JsonNonce {
    Number(u64),
    Text(String),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonRequest {
    #[serde(default)]
    certificates: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hash_algorithm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    artifact_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nonce: Option<JsonNonce>,
    #[serde(
        default,
        rename = "tsaPolicyOID",
        skip_serializing_if = "Option::is_none"
    )]
    tsa_policy_oid: Option<String>,
}

fn decode_json_request(bytes: &[u8]) -> Result<TimestampRequest> {
    let json: JsonRequest = serde_json::from_slice(bytes)
        .map_err(|e| Error::MalformedRequest(format!("failed to parse JSON request: {}", e)))?;

    let hash_algorithm = match json.hash_algorithm.as_deref() {
        Some(name) => HashAlgorithm::from_name(name).map_err(hash_algorithm_error)?,
        None => HashAlgorithm::Sha2256,
    };

    let hashed_message = match (json.artifact_hash, json.artifact) {
        (Some(hash), None) => STANDARD
            .decode(hash.trim())
            .map_err(|e| Error::MalformedRequest(format!("artifactHash is not base64: {}", e)))?,
        (None, Some(artifact)) => tsa_crypto::digest(hash_algorithm, artifact.as_bytes()).digest,
        (Some(_), Some(_)) => {
            return Err(Error::MalformedRequest(
                "only one of artifactHash and artifact may be given".to_string(),
            ))
        }
        (None, None) => {
            return Err(Error::MalformedRequest(
                "one of artifactHash and artifact is required".to_string(),
            ))
        }
    };

    let nonce = match json.nonce {
        Some(JsonNonce::Number(n)) => Some(BigUint::from(n)),
        Some(JsonNonce::Text(text)) => Some(text.trim().parse::<BigUint>().map_err(|e| {
            Error::MalformedRequest(format!("nonce is not a non-negative integer: {}", e))
        })?),
        None => None,
    };

    let policy = json
        .tsa_policy_oid
        .map(|oid| {
            ObjectIdentifier::new(oid.trim())
                .map_err(|e| Error::MalformedRequest(format!("invalid tsaPolicyOID {}: {}", oid, e)))
        })
        .transpose()?;

    Ok(TimestampRequest {
        hash_algorithm,
        hashed_message,
        nonce,
        policy,
        cert_req: json.certificates,
        extensions: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("application/json", ContentType::Json)]
    #[case("application/json; charset=utf-8", ContentType::Json)]
    #[case("application/timestamp-query", ContentType::Der)]
    #[case("Application/Timestamp-Query", ContentType::Der)]
    fn test_content_type(#[case] media_type: &str, #[case] expected: ContentType) {
        assert_eq!(ContentType::from_media_type(media_type).unwrap(), expected);
    }

    #[test]
    fn test_unknown_content_type() {
        assert!(matches!(
            ContentType::from_media_type("text/plain"),
            Err(Error::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_der_request_round_trip() {
        let request = TimestampRequest::for_artifact(HashAlgorithm::Sha2384, b"hello")
            .with_nonce(BigUint::from(1234567890u64))
            .with_policy(ObjectIdentifier::new_unwrap("1.2.3.4"))
            .with_cert_req(true);

        let der = request.to_der().unwrap();
        let decoded = decode_request(&der, ContentType::Der).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_der_request_with_three_arc_policy() {
        let request = TimestampRequest::new(HashAlgorithm::Sha2256, vec![3u8; 32])
            .with_policy(ObjectIdentifier::new_unwrap("1.2.3"));

        let der = request.to_der().unwrap();
        let decoded = decode_request(&der, ContentType::Der).unwrap();
        assert_eq!(decoded.policy, Some(ObjectIdentifier::new_unwrap("1.2.3")));
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_json_request_with_artifact() {
        let body = br#"{"artifact":"hello","hashAlgorithm":"sha256","nonce":"42","certificates":true,"tsaPolicyOID":"1.2.3"}"#;
        let request = decode_request(body, ContentType::Json).unwrap();
        assert_eq!(request.hash_algorithm, HashAlgorithm::Sha2256);
        assert_eq!(request.hashed_message, tsa_crypto::sha256(b"hello").to_vec());
        assert_eq!(request.nonce, Some(BigUint::from(42u32)));
        assert_eq!(request.policy, Some(ObjectIdentifier::new_unwrap("1.2.3")));
        assert!(request.cert_req);
    }

    #[test]
    fn test_json_numeric_nonce() {
        let hash = STANDARD.encode([7u8; 32]);
        let body = format!(r#"{{"artifactHash":"{}","nonce":17}}"#, hash);
        let request = decode_request(body.as_bytes(), ContentType::Json).unwrap();
        assert_eq!(request.nonce, Some(BigUint::from(17u32)));
        assert!(!request.cert_req);
    }

    #[test]
    fn test_json_round_trip() {
        let request = TimestampRequest::new(HashAlgorithm::Sha2512, vec![9u8; 64])
            .with_nonce(BigUint::from(u64::MAX) * BigUint::from(u64::MAX));
        let json = request.to_json().unwrap();
        assert_eq!(decode_request(&json, ContentType::Json).unwrap(), request);
    }

    #[rstest]
    #[case("sha1")]
    #[case("SHA-1")]
    #[case("md5")]
    fn test_weak_hash_rejected(#[case] name: &str) {
        let body = format!(r#"{{"artifact":"x","hashAlgorithm":"{}"}}"#, name);
        assert!(matches!(
            decode_request(body.as_bytes(), ContentType::Json),
            Err(Error::WeakHashAlgorithm(_))
        ));
    }

    #[test]
    fn test_weak_hash_rejected_der() {
        let req = TimeStampReq {
            version: 1,
            message_imprint: Asn1MessageImprint::new(
                asn1::AlgorithmIdentifier {
                    algorithm: tsa_crypto::hash::OID_SHA1,
                    parameters: None,
                },
                vec![0u8; 20],
            )
            .unwrap(),
            req_policy: None,
            nonce: None,
            cert_req: false,
            extensions: None,
        };
        let err = decode_request(&req.to_der().unwrap(), ContentType::Der).unwrap_err();
        assert!(matches!(err, Error::WeakHashAlgorithm(_)));
    }

    #[test]
    fn test_unknown_hash_is_malformed() {
        let body = br#"{"artifact":"x","hashAlgorithm":"whirlpool"}"#;
        assert!(matches!(
            decode_request(body, ContentType::Json),
            Err(Error::MalformedRequest(_))
        ));
    }

    #[rstest]
    #[case(HashAlgorithm::Sha2256, 31)]
    #[case(HashAlgorithm::Sha2256, 48)]
    #[case(HashAlgorithm::Sha2512, 32)]
    fn test_digest_length_must_match(#[case] algorithm: HashAlgorithm, #[case] len: usize) {
        let der = TimestampRequest::new(algorithm, vec![1u8; len]).to_der().unwrap();
        assert!(matches!(
            decode_request(&der, ContentType::Der),
            Err(Error::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_oversized_nonce() {
        let nonce = BigUint::from_bytes_be(&[0x7f; MAX_NONCE_BYTES + 1]);
        let der = TimestampRequest::new(HashAlgorithm::Sha2256, vec![0u8; 32])
            .with_nonce(nonce)
            .to_der()
            .unwrap();
        assert!(matches!(
            decode_request(&der, ContentType::Der),
            Err(Error::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_negative_nonce_rejected() {
        let req = TimeStampReq {
            version: 1,
            message_imprint: Asn1MessageImprint::new(HashAlgorithm::Sha2256.into(), vec![0u8; 32])
                .unwrap(),
            req_policy: None,
            nonce: Some(der::asn1::Int::new(&[0x80]).unwrap()),
            cert_req: false,
            extensions: None,
        };
        assert!(matches!(
            decode_request(&req.to_der().unwrap(), ContentType::Der),
            Err(Error::MalformedRequest(_))
        ));
    }

    #[rstest]
    #[case(br#"{"hashAlgorithm":"sha256"}"#.as_slice())]
    #[case(br#"{"artifact":"a","artifactHash":"AAAA"}"#.as_slice())]
    #[case(br#"{"artifact":"a","tsaPolicyOID":"not-an-oid"}"#.as_slice())]
    #[case(br#"{"artifact":"a","nonce":"-5"}"#.as_slice())]
    #[case(b"not json".as_slice())]
    fn test_malformed_json(#[case] body: &[u8]) {
        assert!(matches!(
            decode_request(body, ContentType::Json),
            Err(Error::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_garbage_der() {
        assert!(matches!(
            decode_request(&[0x30, 0x03, 0x02], ContentType::Der),
            Err(Error::MalformedRequest(_))
        ));
    }
}
