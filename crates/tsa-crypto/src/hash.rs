//! Hash algorithms and (streaming) hashing using aws-lc-rs

use crate::error::{Error, Result};
use aws_lc_rs::digest::{self, Context, SHA256, SHA384, SHA512};
use const_oid::ObjectIdentifier;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// OID for SHA-1: 1.3.14.3.2.26
pub const OID_SHA1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.14.3.2.26");

/// OID for MD5: 1.2.840.113549.2.5
pub const OID_MD5: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.2.5");

/// Buffer size used when streaming an artifact through a [`Hasher`]
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Hash algorithms accepted for message imprints
///
/// Only the SHA-2 family is representable. Broken algorithms (SHA-1, MD5)
/// are recognised by [`HashAlgorithm::from_oid`] and [`HashAlgorithm::from_name`]
/// so they can be rejected with [`Error::WeakHashAlgorithm`] instead of a
/// generic "unsupported" error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    /// SHA2-256
    #[serde(rename = "sha256")]
    Sha2256,
    /// SHA2-384
    #[serde(rename = "sha384")]
    Sha2384,
    /// SHA2-512
    #[serde(rename = "sha512")]
    Sha2512,
}

impl HashAlgorithm {
    /// Get the digest size in bytes for this algorithm
    pub fn digest_size(&self) -> usize {
        match self {
            HashAlgorithm::Sha2256 => 32,
            HashAlgorithm::Sha2384 => 48,
            HashAlgorithm::Sha2512 => 64,
        }
    }

    /// Get the OID for this algorithm
    pub fn oid(&self) -> ObjectIdentifier {
        match self {
            HashAlgorithm::Sha2256 => const_oid::db::rfc5912::ID_SHA_256,
            HashAlgorithm::Sha2384 => const_oid::db::rfc5912::ID_SHA_384,
            HashAlgorithm::Sha2512 => const_oid::db::rfc5912::ID_SHA_512,
        }
    }

    /// Lowercase name used on the JSON wire format
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha2256 => "sha256",
            HashAlgorithm::Sha2384 => "sha384",
            HashAlgorithm::Sha2512 => "sha512",
        }
    }

    /// Look up an algorithm by its OID
    pub fn from_oid(oid: &ObjectIdentifier) -> Result<Self> {
        match *oid {
            const_oid::db::rfc5912::ID_SHA_256 => Ok(HashAlgorithm::Sha2256),
            const_oid::db::rfc5912::ID_SHA_384 => Ok(HashAlgorithm::Sha2384),
            const_oid::db::rfc5912::ID_SHA_512 => Ok(HashAlgorithm::Sha2512),
            OID_SHA1 => Err(Error::WeakHashAlgorithm("SHA-1".to_string())),
            OID_MD5 => Err(Error::WeakHashAlgorithm("MD5".to_string())),
            _ => Err(Error::UnsupportedAlgorithm(format!("hash algorithm {}", oid))),
        }
    }

    /// Look up an algorithm by name
    ///
    /// Case-insensitive, and ignores `-`/`_` separators, so `SHA-256`,
    /// `sha256` and `SHA2_256` all resolve to [`HashAlgorithm::Sha2256`].
    pub fn from_name(name: &str) -> Result<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();

        match normalized.as_str() {
            "sha256" | "sha2256" => Ok(HashAlgorithm::Sha2256),
            "sha384" | "sha2384" => Ok(HashAlgorithm::Sha2384),
            "sha512" | "sha2512" => Ok(HashAlgorithm::Sha2512),
            "sha1" => Err(Error::WeakHashAlgorithm("SHA-1".to_string())),
            "md5" => Err(Error::WeakHashAlgorithm("MD5".to_string())),
            _ => Err(Error::UnsupportedAlgorithm(format!("hash algorithm {}", name))),
        }
    }

    fn aws_lc_algorithm(&self) -> &'static digest::Algorithm {
        match self {
            HashAlgorithm::Sha2256 => &SHA256,
            HashAlgorithm::Sha2384 => &SHA384,
            HashAlgorithm::Sha2512 => &SHA512,
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s)
    }
}

/// A hash output with its algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashOutput {
    /// The algorithm used to produce this hash
    pub algorithm: HashAlgorithm,
    /// The hash digest bytes
    pub digest: Vec<u8>,
}

impl HashOutput {
    /// Create a new hash output
    pub fn new(algorithm: HashAlgorithm, digest: Vec<u8>) -> Self {
        Self { algorithm, digest }
    }

    /// Get the digest as a hex string
    pub fn to_hex(&self) -> String {
        hex::encode(&self.digest)
    }
}

/// Hash data in one shot
pub fn digest(algorithm: HashAlgorithm, data: &[u8]) -> HashOutput {
    let out = digest::digest(algorithm.aws_lc_algorithm(), data);
    HashOutput::new(algorithm, out.as_ref().to_vec())
}

/// Hash data using SHA-256
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = digest::digest(&SHA256, data);
    let mut result = [0u8; 32];
    result.copy_from_slice(digest.as_ref());
    result
}

/// Hash everything readable from `reader` without buffering it in full
pub fn digest_reader<R: Read>(algorithm: HashAlgorithm, mut reader: R) -> std::io::Result<HashOutput> {
    let mut hasher = Hasher::new(algorithm);
    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Incremental hasher for any [`HashAlgorithm`]
pub struct Hasher {
    algorithm: HashAlgorithm,
    context: Context,
}

impl Hasher {
    /// Create a new hasher
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            algorithm,
            context: Context::new(algorithm.aws_lc_algorithm()),
        }
    }

    /// Update the hasher with data
    pub fn update(&mut self, data: &[u8]) {
        self.context.update(data);
    }

    /// Finalize and get the digest
    pub fn finalize(self) -> HashOutput {
        let digest = self.context.finish();
        HashOutput::new(self.algorithm, digest.as_ref().to_vec())
    }
}
