//! Timestamp issuance
//!
//! [`TimestampAuthority`] holds the signing identity, a [`SigningCapability`]
//! plus the leaf-first certificate chain, and turns validated requests into
//! signed RFC 3161 tokens: a TSTInfo wrapped in CMS SignedData with one
//! SignerInfo whose signed attributes bind the leaf certificate through
//! signingCertificateV2.

use crate::asn1::{
    self, Accuracy, Asn1MessageImprint, EssCertIdV2, IssuerSerial, PkiStatusInfo,
    SigningCertificateV2, TimeStampResp, TstInfo,
};
use crate::config::AuthorityConfig;
use crate::error::{Error, Result};
use crate::parse;
use crate::request::{decode_request, ContentType, TimestampRequest};
use cms::cert::{CertificateChoices, IssuerAndSerialNumber};
use cms::content_info::{CmsVersion, ContentInfo};
use cms::signed_data::{
    CertificateSet, EncapsulatedContentInfo, SignedData, SignerIdentifier, SignerInfo,
    SignerInfos,
};
use const_oid::ObjectIdentifier;
use der::asn1::{GeneralizedTime, OctetString, SetOfVec, UtcTime};
use der::{Any, Encode, Tag};
use num_bigint::BigUint;
use rand::Rng;
use spki::AlgorithmIdentifierOwned;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tsa_crypto::x509::{has_only_time_stamping_eku, is_ca};
use tsa_crypto::{encode_pem_chain, parse_pem_chain, CertificateDer, SigningCapability};
use x509_cert::attr::Attribute;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::time::Time;
use x509_cert::Certificate;

/// 2050-01-01T00:00:00Z; signingTime switches to GeneralizedTime from here
const UTC_TIME_END: u64 = 2_524_608_000;

/// Log the detail, hand the caller only [`Error::ResponseGenerationFailed`]
fn generation_failed<E: std::fmt::Display>(context: &'static str) -> impl FnOnce(E) -> Error {
    move |e| {
        tracing::error!(error = %e, "{}", context);
        Error::ResponseGenerationFailed
    }
}

/// A timestamping identity able to issue tokens
pub struct TimestampAuthority {
    signer: Arc<dyn SigningCapability>,
    /// Leaf first, root last
    chain: Vec<Certificate>,
    chain_pem: String,
    config: AuthorityConfig,
}

impl std::fmt::Debug for TimestampAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimestampAuthority")
            .field("leaf", &self.leaf().tbs_certificate.subject.to_string())
            .field("chain_len", &self.chain.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TimestampAuthority {
    /// Create an authority from a signer and its leaf-first chain
    ///
    /// The leaf must be an end-entity certificate whose extended key usage
    /// is exactly time stamping.
    pub fn new(
        signer: Arc<dyn SigningCapability>,
        chain: Vec<Certificate>,
        config: AuthorityConfig,
    ) -> Result<Self> {
        let leaf = chain
            .first()
            .ok_or_else(|| Error::Configuration("certificate chain is empty".to_string()))?;

        let eku_ok = has_only_time_stamping_eku(leaf)
            .map_err(|e| Error::Configuration(format!("unreadable leaf certificate: {}", e)))?;
        if !eku_ok {
            return Err(Error::Configuration(
                "leaf certificate must have exactly the time-stamping extended key usage"
                    .to_string(),
            ));
        }
        if is_ca(leaf).map_err(|e| Error::Configuration(e.to_string()))? {
            return Err(Error::Configuration(
                "leaf certificate must not be a CA".to_string(),
            ));
        }

        let ders = chain
            .iter()
            .map(CertificateDer::try_from)
            .collect::<tsa_crypto::Result<Vec<_>>>()
            .map_err(|e| Error::Configuration(format!("failed to encode chain: {}", e)))?;
        let chain_pem = encode_pem_chain(&ders);

        Ok(Self {
            signer,
            chain,
            chain_pem,
            config,
        })
    }

    /// Create an authority from a PEM chain, leaf first
    pub fn from_pem_chain(
        signer: Arc<dyn SigningCapability>,
        pem: &str,
        config: AuthorityConfig,
    ) -> Result<Self> {
        let chain: Vec<Certificate> = parse_pem_chain(pem)
            .and_then(|ders| ders.iter().map(CertificateDer::to_certificate).collect())
            .map_err(|e| Error::Configuration(format!("invalid certificate chain: {}", e)))?;
        Self::new(signer, chain, config)
    }

    /// Check that the signer's key is the one certified by the leaf
    pub async fn check_signer(&self) -> Result<()> {
        let key = self
            .signer
            .public_key()
            .await
            .map_err(|e| Error::Configuration(format!("failed to fetch signer key: {}", e)))?;
        let spki = key
            .to_spki()
            .map_err(|e| Error::Configuration(format!("invalid signer key: {}", e)))?;
        if spki != self.leaf().tbs_certificate.subject_public_key_info {
            return Err(Error::Configuration(
                "signer key does not match the leaf certificate".to_string(),
            ));
        }
        Ok(())
    }

    /// The signing certificate
    pub fn leaf(&self) -> &Certificate {
        &self.chain[0]
    }

    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    /// PEM chain, leaf then intermediates then root
    pub fn cert_chain_pem(&self) -> &str {
        &self.chain_pem
    }

    /// Decode, validate and answer a request body in one step
    ///
    /// Returns the response bytes and their media type.
    pub async fn timestamp(&self, body: &[u8], media_type: &str) -> Result<(Vec<u8>, &'static str)> {
        let content_type = ContentType::from_media_type(media_type)?;
        let request = decode_request(body, content_type)?;
        let response = self.build_response(&request, content_type).await?;
        Ok((response, content_type.response_media_type()))
    }

    /// Issue a response, bounded by the configured signing timeout
    pub async fn build_response(
        &self,
        request: &TimestampRequest,
        content_type: ContentType,
    ) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.config.signing_timeout;
        self.build_response_until(request, content_type, deadline)
            .await
    }

    /// Issue a response, giving up on signing at `deadline`
    pub async fn build_response_until(
        &self,
        request: &TimestampRequest,
        content_type: ContentType,
        deadline: Instant,
    ) -> Result<Vec<u8>> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(generation_failed("system clock is before the Unix epoch"))?;

        let tst_info = self
            .tst_info(request, now)
            .map_err(generation_failed("failed to build TSTInfo"))?;
        let tst_der = tst_info
            .to_der()
            .map_err(generation_failed("failed to encode TSTInfo"))?;

        let token = self.sign_token(tst_der, request.cert_req, now, deadline).await?;

        let response = match content_type {
            ContentType::Der => {
                let resp = TimeStampResp {
                    status: PkiStatusInfo::granted(),
                    time_stamp_token: Some(
                        Any::encode_from(&token)
                            .map_err(generation_failed("failed to wrap token"))?,
                    ),
                };
                resp.to_der()
                    .map_err(generation_failed("failed to encode TimeStampResp"))?
            }
            ContentType::Json => {
                let raw = token
                    .to_der()
                    .map_err(generation_failed("failed to encode token"))?;
                parse::decode_token(&raw)
                    .and_then(|decoded| decoded.to_json())
                    .map_err(generation_failed("failed to render JSON response"))?
            }
        };

        tracing::debug!(
            serial = %asn1::int_to_uint(&tst_info.serial_number).unwrap_or_default(),
            policy = %tst_info.policy,
            cert_req = request.cert_req,
            "issued timestamp"
        );
        Ok(response)
    }

    fn tst_info(&self, request: &TimestampRequest, now: Duration) -> der::Result<TstInfo> {
        let mut extensions = request.extensions.clone();
        extensions.retain(|ext| {
            let qc = ext.extn_id == asn1::OID_QC_STATEMENTS;
            if qc {
                tracing::warn!("dropping qcStatements extension from request");
            }
            !qc
        });

        Ok(TstInfo {
            version: 1,
            policy: request.policy.unwrap_or(self.config.policy_oid).into(),
            message_imprint: Asn1MessageImprint::new(
                request.hash_algorithm.into(),
                request.hashed_message.clone(),
            )?,
            serial_number: asn1::uint_to_int(&random_serial())?,
            gen_time: TstInfo::gen_time_from_unix(now.as_secs())?,
            accuracy: Some(Accuracy::from_duration(self.config.accuracy)),
            ordering: false,
            nonce: request.nonce.as_ref().map(asn1::uint_to_int).transpose()?,
            tsa: self
                .config
                .include_tsa_name
                .then(|| GeneralName::DirectoryName(self.leaf().tbs_certificate.subject.clone())),
            extensions: Some(extensions).filter(|e| !e.is_empty()),
        })
    }

    async fn sign_token(
        &self,
        tst_der: Vec<u8>,
        cert_req: bool,
        now: Duration,
        deadline: Instant,
    ) -> Result<ContentInfo> {
        let scheme = self.signer.signing_scheme();
        let hash = scheme.hash_algorithm();
        let digest_alg = AlgorithmIdentifierOwned {
            oid: hash.oid(),
            parameters: None,
        };

        let signed_attrs = self
            .signed_attributes(tsa_crypto::digest(hash, &tst_der).digest, now)
            .map_err(generation_failed("failed to build signed attributes"))?;
        let attrs_der = signed_attrs
            .to_der()
            .map_err(generation_failed("failed to encode signed attributes"))?;
        let attrs_digest = tsa_crypto::digest(hash, &attrs_der);

        let signature =
            match tokio::time::timeout_at(deadline, self.signer.sign_digest(&attrs_digest.digest, hash))
                .await
            {
                Ok(Ok(signature)) => signature,
                Ok(Err(e)) => return Err(generation_failed("signing failed")(e)),
                Err(_) => return Err(generation_failed("signing deadline exceeded")("timeout")),
            };

        let leaf = self.leaf();
        let signer_info = SignerInfo {
            version: CmsVersion::V1,
            sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
                issuer: leaf.tbs_certificate.issuer.clone(),
                serial_number: leaf.tbs_certificate.serial_number.clone(),
            }),
            digest_alg: digest_alg.clone(),
            signed_attrs: Some(signed_attrs),
            signature_algorithm: scheme.signature_algorithm(),
            signature: OctetString::new(signature.into_bytes())
                .map_err(generation_failed("failed to wrap signature"))?,
            unsigned_attrs: None,
        };

        self.assemble(tst_der, digest_alg, signer_info, cert_req)
            .map_err(generation_failed("failed to assemble SignedData"))
    }

    fn signed_attributes(
        &self,
        content_digest: Vec<u8>,
        now: Duration,
    ) -> der::Result<SetOfVec<Attribute>> {
        let leaf = self.leaf();
        let signing_time = if now.as_secs() < UTC_TIME_END {
            Time::UtcTime(UtcTime::from_unix_duration(Duration::from_secs(now.as_secs()))?)
        } else {
            Time::GeneralTime(GeneralizedTime::from_unix_duration(Duration::from_secs(
                now.as_secs(),
            ))?)
        };

        // ESSCertIDv2 with the SHA-256 default, so hashAlgorithm is omitted
        let cert_id = EssCertIdV2 {
            hash_algorithm: None,
            cert_hash: OctetString::new(tsa_crypto::sha256(&leaf.to_der()?).to_vec())?,
            issuer_serial: Some(IssuerSerial {
                issuer: vec![GeneralName::DirectoryName(
                    leaf.tbs_certificate.issuer.clone(),
                )],
                serial_number: leaf.tbs_certificate.serial_number.clone(),
            }),
        };
        let signing_certificate = SigningCertificateV2 {
            certs: vec![cert_id],
            policies: None,
        };

        SetOfVec::try_from(vec![
            attribute(asn1::OID_CONTENT_TYPE, Any::encode_from(&asn1::OID_TST_INFO)?)?,
            attribute(asn1::OID_SIGNING_TIME, Any::encode_from(&signing_time)?)?,
            attribute(
                asn1::OID_MESSAGE_DIGEST,
                Any::encode_from(&OctetString::new(content_digest)?)?,
            )?,
            attribute(
                asn1::OID_SIGNING_CERTIFICATE_V2,
                Any::encode_from(&signing_certificate)?,
            )?,
        ])
    }

    fn assemble(
        &self,
        tst_der: Vec<u8>,
        digest_alg: AlgorithmIdentifierOwned,
        signer_info: SignerInfo,
        cert_req: bool,
    ) -> der::Result<ContentInfo> {
        // The root is the verifier's trust anchor and is never embedded
        let certificates = if cert_req {
            let end = if self.chain.len() > 1 {
                self.chain.len() - 1
            } else {
                1
            };
            let choices = self.chain[..end]
                .iter()
                .cloned()
                .map(CertificateChoices::Certificate)
                .collect::<Vec<_>>();
            Some(CertificateSet(SetOfVec::try_from(choices)?))
        } else {
            None
        };

        let signed_data = SignedData {
            version: CmsVersion::V3,
            digest_algorithms: SetOfVec::try_from(vec![digest_alg])?,
            encap_content_info: EncapsulatedContentInfo {
                econtent_type: asn1::OID_TST_INFO,
                econtent: Some(Any::new(Tag::OctetString, tst_der)?),
            },
            certificates,
            crls: None,
            signer_infos: SignerInfos(SetOfVec::try_from(vec![signer_info])?),
        };

        Ok(ContentInfo {
            content_type: asn1::OID_SIGNED_DATA,
            content: Any::encode_from(&signed_data)?,
        })
    }
}

fn attribute(oid: ObjectIdentifier, value: Any) -> der::Result<Attribute> {
    Ok(Attribute {
        oid,
        values: SetOfVec::try_from(vec![value])?,
    })
}

/// 128 random bits, positive with the second-highest bit set
fn random_serial() -> BigUint {
    let mut bytes: [u8; 16] = rand::rng().random();
    bytes[0] = (bytes[0] & 0x7f) | 0x40;
    BigUint::from_bytes_be(&bytes)
}
