use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use std::fmt;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),
}

/// Hashes any number of serializable values, independent of the order they are passed in.
///
/// Each value is rendered as canonical JSON, the renderings are sorted and joined
/// with a single space, and the result is digested with SHA-256.
#[macro_export]
macro_rules! crypto_hash {
    ($($input:expr),+ $(,)?) => {
        $crate::blockchain::crypto::crypto_hash(&[$($crate::blockchain::crypto::hash_input(&$input)),+])
    };
}

/// Sorts the canonical renderings of `inputs` and returns the hex SHA-256 of their concatenation
pub fn crypto_hash(inputs: &[Value]) -> String {
    let mut rendered: Vec<String> = inputs.iter().map(Value::to_string).collect();
    rendered.sort();

    let mut hasher = Sha256::new();
    hasher.update(rendered.join(" ").as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Converts a value into the JSON form fed to `crypto_hash`.
///
/// Ledger types only contain string-keyed maps, so serialization cannot fail for them;
/// a value that does fail hashes as `null`.
pub fn hash_input<T: Serialize + ?Sized>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Counts the leading zero bits of a hex-encoded hash. Malformed hex counts as zero.
pub fn count_leading_zero_bits(hash_hex: &str) -> u32 {
    let bytes = match hex::decode(hash_hex) {
        Ok(bytes) => bytes,
        Err(_) => return 0,
    };

    let mut total = 0u32;
    for b in &bytes {
        if *b == 0 {
            total += 8;
        } else {
            total += b.leading_zeros();
            break;
        }
    }
    total
}

/// Represents a digital signature (base58 encoded)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitalSignature(pub String);

impl DigitalSignature {
    /// Creates a new digital signature from a signature
    pub fn from_signature(signature: &Signature) -> Self {
        let bytes = signature.to_bytes();
        DigitalSignature(bs58::encode(bytes).into_string())
    }

    /// Converts the digital signature to a signature
    pub fn to_signature(&self) -> Result<Signature, CryptoError> {
        let bytes = bs58::decode(&self.0)
            .into_vec()
            .map_err(|e| CryptoError::DecodingError(e.to_string()))?;

        let signature_bytes: [u8; 64] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidSignature("Invalid signature length".to_string())
        })?;

        Ok(Signature::from_bytes(&signature_bytes))
    }
}

impl fmt::Display for DigitalSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generates a fresh keypair from the operating system's randomness source
pub fn generate_keypair() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Hex encoding of the public point
pub fn public_key_hex(verifying_key: &VerifyingKey) -> String {
    hex::encode(verifying_key.as_bytes())
}

/// Reconstructs a verifying key from its hex encoding
pub fn public_key_from_hex(public_key: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes = hex::decode(public_key).map_err(|e| CryptoError::DecodingError(e.to_string()))?;

    let key_bytes: [u8; 32] = bytes.try_into().map_err(|_| {
        CryptoError::InvalidPublicKey("Invalid public key length".to_string())
    })?;

    VerifyingKey::from_bytes(&key_bytes).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

/// Signs the `crypto_hash` digest of `data`
pub fn sign<T: Serialize + ?Sized>(signing_key: &SigningKey, data: &T) -> DigitalSignature {
    let digest = crypto_hash!(data);
    DigitalSignature::from_signature(&signing_key.sign(digest.as_bytes()))
}

/// Verifies `signature` over the `crypto_hash` digest of `data`.
///
/// Malformed keys and signatures verify as false.
pub fn verify_signature<T: Serialize + ?Sized>(
    public_key: &str,
    data: &T,
    signature: &DigitalSignature,
) -> bool {
    let verifying_key = match public_key_from_hex(public_key) {
        Ok(key) => key,
        Err(_) => return false,
    };
    let signature = match signature.to_signature() {
        Ok(signature) => signature,
        Err(_) => return false,
    };

    let digest = crypto_hash!(data);
    verifying_key.verify(digest.as_bytes(), &signature).is_ok()
}
