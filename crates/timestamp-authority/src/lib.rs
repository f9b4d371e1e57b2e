//! RFC 3161 Time-Stamp Protocol authority
//!
//! This crate issues and verifies RFC 3161 timestamps: request decoding and
//! validation (DER or JSON), token construction signed through a
//! [`tsa_crypto::SigningCapability`], response decoding, and verification
//! against a set of trust anchors.
//!
//! ```no_run
//! # async fn example(authority: timestamp_authority::TimestampAuthority) -> timestamp_authority::Result<()> {
//! use timestamp_authority::{verify_timestamp_response, TimestampRequest, ContentType, VerifyOpts};
//! use tsa_crypto::HashAlgorithm;
//!
//! let request = TimestampRequest::for_artifact(HashAlgorithm::Sha2256, b"hello").with_cert_req(true);
//! let response = authority.build_response(&request, ContentType::Der).await?;
//!
//! let opts = VerifyOpts::new().with_certificate_chain_pem(authority.cert_chain_pem())?;
//! verify_timestamp_response(&response, &b"hello"[..], &opts)?;
//! # Ok(())
//! # }
//! ```

pub mod asn1;
pub mod config;
pub mod error;
pub mod parse;
pub mod request;
pub mod response;
pub mod verify;

pub use asn1::{
    AlgorithmIdentifier, Asn1MessageImprint, PkiStatus, TimeStampReq, TimeStampResp, TstInfo,
};
pub use config::{AuthorityConfig, DEFAULT_POLICY_OID};
pub use error::{Error, Fault, LeafCheck, Result, VerificationError};
pub use parse::{
    decode_json_response, decode_response, decode_token, parse_generalized_time, parse_timestamp,
    TimestampResponse,
};
pub use request::{decode_request, ContentType, TimestampRequest};
pub use response::TimestampAuthority;
pub use verify::{verify_response, verify_timestamp_response, VerifyOpts};
