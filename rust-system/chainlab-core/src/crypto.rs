//! Cryptographic Operations
//!
//! SHA-256 digests over string data and secp256k1 ECDSA signatures over
//! those digests. Keys and signatures travel as lowercase hex.

use crate::{BlockchainError, Result};
use secp256k1::{ecdsa::Signature, Message, PublicKey, SecretKey, SECP256K1};
use sha2::{Digest, Sha256};

/// Length of a hex-encoded secret scalar
const SECRET_KEY_HEX_LEN: usize = 64;

/// Hash a string with SHA256, returning lowercase hex
pub fn sha256_hex(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

/// Generate a random key pair as `(secret_hex, public_hex)`.
///
/// The public key is the uncompressed SEC1 point.
pub fn generate_keypair() -> (String, String) {
    let mut rng = rand::thread_rng();
    let (secret_key, public_key) = SECP256K1.generate_keypair(&mut rng);
    (
        hex::encode(secret_key.secret_bytes()),
        hex::encode(public_key.serialize_uncompressed()),
    )
}

/// Derive the uncompressed public key from a hex secret
pub fn derive_public_key(secret_hex: &str) -> Result<String> {
    let secret_key = parse_secret_key(secret_hex)?;
    let public_key = PublicKey::from_secret_key_global(&secret_key);
    Ok(hex::encode(public_key.serialize_uncompressed()))
}

/// Sign a hex digest, returning the DER-encoded signature as hex
pub fn sign(secret_hex: &str, message_hash: &str) -> Result<String> {
    let secret_key = parse_secret_key(secret_hex)?;
    let message = parse_message(message_hash)
        .ok_or_else(|| BlockchainError::Crypto(format!("Invalid message hash: {}", message_hash)))?;

    let signature = SECP256K1.sign_ecdsa(&message, &secret_key);
    Ok(hex::encode(signature.serialize_der().to_vec()))
}

/// Verify a DER hex signature over a hex digest.
///
/// Malformed keys, signatures or digests yield `false`.
pub fn verify(public_hex: &str, signature_hex: &str, message_hash: &str) -> bool {
    let Some(message) = parse_message(message_hash) else {
        return false;
    };
    let Ok(key_bytes) = hex::decode(public_hex) else {
        return false;
    };
    let Ok(public_key) = PublicKey::from_slice(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut signature) = Signature::from_der_lax(&sig_bytes) else {
        return false;
    };

    // Signers that do not enforce low-S still produce valid signatures
    signature.normalize_s();
    SECP256K1.verify_ecdsa(&message, &signature, &public_key).is_ok()
}

fn parse_secret_key(secret_hex: &str) -> Result<SecretKey> {
    let trimmed = secret_hex.trim();
    if trimmed.is_empty() || trimmed.len() > SECRET_KEY_HEX_LEN {
        return Err(BlockchainError::InvalidPrivateKey(format!(
            "expected up to {} hex characters, got {}",
            SECRET_KEY_HEX_LEN,
            trimmed.len()
        )));
    }

    // Big-number encoders drop leading zero nibbles
    let padded = format!("{:0>width$}", trimmed, width = SECRET_KEY_HEX_LEN);
    let bytes = hex::decode(&padded)
        .map_err(|e| BlockchainError::InvalidPrivateKey(e.to_string()))?;
    SecretKey::from_slice(&bytes).map_err(|e| BlockchainError::InvalidPrivateKey(e.to_string()))
}

fn parse_message(message_hash: &str) -> Option<Message> {
    let bytes = hex::decode(message_hash).ok()?;
    Message::from_digest_slice(&bytes).ok()
}
