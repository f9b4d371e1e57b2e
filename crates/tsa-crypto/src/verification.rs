//! Signature verification using aws-lc-rs

use crate::encoding::PublicKeySpki;
use crate::error::{Error, Result};
use crate::signing::SigningScheme;
use aws_lc_rs::signature::{UnparsedPublicKey, ECDSA_P256_SHA256_ASN1, ECDSA_P384_SHA384_ASN1};
use const_oid::ObjectIdentifier;

/// Map a (curve, digest) pair to a signing scheme
///
/// Used when only the certificate's key parameters and a CMS digest algorithm
/// are known.
pub fn scheme_for(curve: &ObjectIdentifier, digest: &ObjectIdentifier) -> Result<SigningScheme> {
    use const_oid::db::rfc5912::{ID_SHA_256, ID_SHA_384, SECP_256_R_1, SECP_384_R_1};

    match (*curve, *digest) {
        (SECP_256_R_1, ID_SHA_256) => Ok(SigningScheme::EcdsaP256Sha256),
        (SECP_384_R_1, ID_SHA_384) => Ok(SigningScheme::EcdsaP384Sha384),
        _ => Err(Error::UnsupportedAlgorithm(format!(
            "unsupported curve/digest combination: {} / {}",
            curve, digest
        ))),
    }
}

/// Verify a DER ECDSA signature over `message` (not prehashed)
pub fn verify_signature(
    public_key: &PublicKeySpki,
    message: &[u8],
    signature: &[u8],
    scheme: SigningScheme,
) -> Result<()> {
    let raw = public_key.raw_key_bytes()?;
    verify_raw(&raw, message, signature, scheme)
}

/// Verify against a public key given as raw SEC1 point bytes
pub fn verify_raw(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
    scheme: SigningScheme,
) -> Result<()> {
    match scheme {
        SigningScheme::EcdsaP256Sha256 => {
            UnparsedPublicKey::new(&ECDSA_P256_SHA256_ASN1, public_key)
                .verify(message, signature)
                .map_err(|_| Error::Verification("ECDSA P-256 signature invalid".to_string()))
        }
        SigningScheme::EcdsaP384Sha384 => {
            UnparsedPublicKey::new(&ECDSA_P384_SHA384_ASN1, public_key)
                .verify(message, signature)
                .map_err(|_| Error::Verification("ECDSA P-384 signature invalid".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{digest, HashAlgorithm};
    use crate::signing::{EphemeralSigner, SigningCapability};

    #[tokio::test]
    async fn test_verify_wrong_data() {
        let signer = EphemeralSigner::generate();
        let hashed = digest(HashAlgorithm::Sha2256, b"test data");
        let sig = signer
            .sign_digest(&hashed.digest, HashAlgorithm::Sha2256)
            .await
            .unwrap();
        let spki = signer.public_key().await.unwrap();

        let scheme = SigningScheme::EcdsaP256Sha256;
        assert!(verify_signature(&spki, b"test data", sig.as_bytes(), scheme).is_ok());
        assert!(verify_signature(&spki, b"wrong data", sig.as_bytes(), scheme).is_err());
    }

    #[tokio::test]
    async fn test_verify_bad_signature() {
        let spki = EphemeralSigner::generate().public_key().await.unwrap();
        let bad_sig = vec![0u8; 70];
        let result = verify_signature(&spki, b"data", &bad_sig, SigningScheme::EcdsaP256Sha256);
        assert!(result.is_err());
    }

    #[test]
    fn test_scheme_for() {
        use const_oid::db::rfc5912::{ID_SHA_256, ID_SHA_512, SECP_256_R_1};
        assert_eq!(
            scheme_for(&SECP_256_R_1, &ID_SHA_256).unwrap(),
            SigningScheme::EcdsaP256Sha256
        );
        assert!(scheme_for(&SECP_256_R_1, &ID_SHA_512).is_err());
    }
}
