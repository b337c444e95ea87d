use crate::model::SerializedSignature;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    Ed25519,
    Secp256k1,
}

impl SignatureScheme {
    pub fn parse(name: &str) -> Result<Self, SignatureError> {
        match name {
            "ED25519" => Ok(Self::Ed25519),
            "Secp256k1" => Ok(Self::Secp256k1),
            other => Err(SignatureError::UnknownScheme(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ed25519 => "ED25519",
            Self::Secp256k1 => "Secp256k1",
        }
    }
}

impl fmt::Display for SignatureScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    Ed25519(ed25519_dalek::VerifyingKey),
    Secp256k1(k256::ecdsa::VerifyingKey),
}

impl PublicKey {
    /// Rebuilds a key from its raw serialized bytes under `scheme`.
    pub fn from_serialized(scheme: SignatureScheme, bytes: &[u8]) -> Result<Self, SignatureError> {
        match scheme {
            SignatureScheme::Ed25519 => {
                let raw: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| SignatureError::KeyLength {
                        scheme,
                        expected: 32,
                        actual: bytes.len(),
                    })?;
                let key = ed25519_dalek::VerifyingKey::from_bytes(&raw)
                    .map_err(|_| SignatureError::InvalidPublicKey(scheme))?;
                Ok(Self::Ed25519(key))
            }
            SignatureScheme::Secp256k1 => {
                if bytes.len() != 33 {
                    return Err(SignatureError::KeyLength {
                        scheme,
                        expected: 33,
                        actual: bytes.len(),
                    });
                }
                let key = k256::ecdsa::VerifyingKey::from_sec1_bytes(bytes)
                    .map_err(|_| SignatureError::InvalidPublicKey(scheme))?;
                Ok(Self::Secp256k1(key))
            }
        }
    }

    pub fn scheme(&self) -> SignatureScheme {
        match self {
            Self::Ed25519(_) => SignatureScheme::Ed25519,
            Self::Secp256k1(_) => SignatureScheme::Secp256k1,
        }
    }

    /// Raw bytes: 32 for Ed25519, 33 (compressed SEC1) for secp256k1.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Ed25519(key) => key.to_bytes().to_vec(),
            Self::Secp256k1(key) => key.to_encoded_point(true).as_bytes().to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedData {
    pub signature_scheme: SignatureScheme,
    pub signature: Vec<u8>,
    pub pub_key: PublicKey,
}

impl SignedData {
    pub fn from_serialized(raw: &SerializedSignature) -> Result<Self, SignatureError> {
        let signature_scheme = SignatureScheme::parse(&raw.signature_scheme)?;
        let signature = BASE64
            .decode(raw.signature.as_bytes())
            .map_err(|err| SignatureError::Base64("signature", err))?;
        let key_bytes = BASE64
            .decode(raw.pub_key.as_bytes())
            .map_err(|err| SignatureError::Base64("pubKey", err))?;
        let pub_key = PublicKey::from_serialized(signature_scheme, &key_bytes)?;
        Ok(Self {
            signature_scheme,
            signature,
            pub_key,
        })
    }
}

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("unknown signature scheme `{0}`")]
    UnknownScheme(String),
    #[error("invalid base64 in {0}: {1}")]
    Base64(&'static str, #[source] base64::DecodeError),
    #[error("{scheme} public key must be {expected} bytes, got {actual}")]
    KeyLength {
        scheme: SignatureScheme,
        expected: usize,
        actual: usize,
    },
    #[error("invalid {0} public key")]
    InvalidPublicKey(SignatureScheme),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ed25519_pubkey() -> Vec<u8> {
        ed25519_dalek::SigningKey::from_bytes(&[7u8; 32])
            .verifying_key()
            .to_bytes()
            .to_vec()
    }

    fn secp256k1_pubkey() -> Vec<u8> {
        k256::ecdsa::SigningKey::from_slice(&[9u8; 32])
            .unwrap()
            .verifying_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec()
    }

    #[test]
    fn decodes_ed25519_result() {
        let key = ed25519_pubkey();
        let raw = SerializedSignature {
            signature_scheme: "ED25519".to_string(),
            signature: BASE64.encode([1u8, 2, 3, 4]),
            pub_key: BASE64.encode(&key),
        };
        let signed = SignedData::from_serialized(&raw).unwrap();
        assert_eq!(signed.signature_scheme, SignatureScheme::Ed25519);
        assert_eq!(signed.signature, vec![1, 2, 3, 4]);
        assert_eq!(signed.pub_key.scheme(), SignatureScheme::Ed25519);
        assert_eq!(signed.pub_key.to_bytes(), key);
    }

    #[test]
    fn decodes_secp256k1_result() {
        let key = secp256k1_pubkey();
        let raw = SerializedSignature {
            signature_scheme: "Secp256k1".to_string(),
            signature: BASE64.encode([0xaau8; 64]),
            pub_key: BASE64.encode(&key),
        };
        let signed = SignedData::from_serialized(&raw).unwrap();
        assert_eq!(signed.pub_key.scheme(), SignatureScheme::Secp256k1);
        assert_eq!(signed.pub_key.to_bytes(), key);
        assert_eq!(signed.signature.len(), 64);
    }

    #[test]
    fn rejects_unknown_scheme_and_bad_key_material() {
        let raw = SerializedSignature {
            signature_scheme: "BLS12381".to_string(),
            signature: String::new(),
            pub_key: String::new(),
        };
        assert!(matches!(
            SignedData::from_serialized(&raw),
            Err(SignatureError::UnknownScheme(_))
        ));

        let raw = SerializedSignature {
            signature_scheme: "ED25519".to_string(),
            signature: BASE64.encode([1u8]),
            pub_key: BASE64.encode([0u8; 31]),
        };
        assert!(matches!(
            SignedData::from_serialized(&raw),
            Err(SignatureError::KeyLength { expected: 32, actual: 31, .. })
        ));

        let raw = SerializedSignature {
            signature_scheme: "ED25519".to_string(),
            signature: "not base64!".to_string(),
            pub_key: BASE64.encode(ed25519_pubkey()),
        };
        assert!(matches!(
            SignedData::from_serialized(&raw),
            Err(SignatureError::Base64("signature", _))
        ));
    }
}
