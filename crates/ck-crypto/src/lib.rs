use alloy_primitives::{Address, B256, eip191_hash_message, keccak256};
use anyhow::{Result, anyhow};
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::Zeroize;

pub const SIGNATURE_LEN: usize = 65;

const SALT_LEN: usize = 16;
const SECRET_LEN: usize = 32;
const TAG_LEN: usize = 32;

/// secp256k1 key held in process memory. Used by guest wallets and by the
/// custodial backend.
pub struct LocalSigner {
    signing_key: SigningKey,
}

impl fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSigner")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

impl LocalSigner {
    pub fn new_random() -> Self {
        let mut rng = OsRng;
        Self {
            signing_key: SigningKey::random(&mut rng),
        }
    }

    pub fn from_secret_key_bytes(mut secret_key: [u8; SECRET_LEN]) -> Result<Self> {
        let signing_key = SigningKey::from_slice(&secret_key).map_err(|err| anyhow!("invalid secret key: {err}"));
        secret_key.zeroize();
        Ok(Self {
            signing_key: signing_key?,
        })
    }

    pub fn secret_key_bytes(&self) -> [u8; SECRET_LEN] {
        let mut output = [0_u8; SECRET_LEN];
        output.copy_from_slice(&self.signing_key.to_bytes());
        output
    }

    pub fn address(&self) -> Address {
        address_of(self.signing_key.verifying_key())
    }

    pub fn sign_hash(&self, hash: &B256) -> Result<[u8; SIGNATURE_LEN]> {
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(hash.as_slice())
            .map_err(|err| anyhow!("signing failed: {err}"))?;

        let mut output = [0_u8; SIGNATURE_LEN];
        output[..64].copy_from_slice(&signature.to_bytes());
        output[64] = recovery_id.to_byte() + 27;
        Ok(output)
    }

    /// EIP-191 `personal_sign`.
    pub fn sign_message(&self, message: &[u8]) -> Result<[u8; SIGNATURE_LEN]> {
        self.sign_hash(&eip191_hash_message(message))
    }
}

fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

/// Recovers the signer of an EIP-191 message signature (`r || s || v`).
pub fn recover_address(message: &[u8], signature: &[u8]) -> Result<Address> {
    if signature.len() != SIGNATURE_LEN {
        return Err(anyhow!("invalid signature length: {}", signature.len()));
    }

    let v = signature[64];
    let recovery_byte = if v >= 27 { v - 27 } else { v };
    let recovery_id = RecoveryId::from_byte(recovery_byte).ok_or_else(|| anyhow!("invalid recovery id: {v}"))?;
    let parsed = Signature::from_slice(&signature[..64]).map_err(|err| anyhow!("invalid signature: {err}"))?;

    let hash = eip191_hash_message(message);
    let key = VerifyingKey::recover_from_prehash(hash.as_slice(), &parsed, recovery_id)
        .map_err(|err| anyhow!("signature recovery failed: {err}"))?;
    Ok(address_of(&key))
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyMaterialError {
    #[error("password cannot be empty")]
    EmptyPassword,
    #[error("malformed key material")]
    Malformed,
    #[error("invalid password")]
    InvalidPassword,
}

/// Encrypts a secret key under a user password.
///
/// Layout: `salt(16) || ciphertext(32) || tag(32)`.
pub fn encrypt_key_material(secret_key: &[u8; SECRET_LEN], password: &str) -> Result<Vec<u8>, KeyMaterialError> {
    if password.trim().is_empty() {
        return Err(KeyMaterialError::EmptyPassword);
    }

    let mut salt = [0_u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let mut key_stream = derive_key_stream(password, &salt, SECRET_LEN);
    let mut encrypted = Vec::with_capacity(SALT_LEN + SECRET_LEN + TAG_LEN);
    encrypted.extend_from_slice(&salt);
    for (index, byte) in secret_key.iter().enumerate() {
        encrypted.push(byte ^ key_stream[index]);
    }
    key_stream.zeroize();

    let tag = integrity_tag(password, &salt, &encrypted[SALT_LEN..]);
    encrypted.extend_from_slice(&tag);
    Ok(encrypted)
}

pub fn decrypt_key_material(encrypted: &[u8], password: &str) -> Result<[u8; SECRET_LEN], KeyMaterialError> {
    if password.trim().is_empty() {
        return Err(KeyMaterialError::EmptyPassword);
    }

    if encrypted.len() != SALT_LEN + SECRET_LEN + TAG_LEN {
        return Err(KeyMaterialError::Malformed);
    }

    let (salt, rest) = encrypted.split_at(SALT_LEN);
    let (ciphertext, tag) = rest.split_at(SECRET_LEN);
    if integrity_tag(password, salt, ciphertext).as_slice() != tag {
        return Err(KeyMaterialError::InvalidPassword);
    }

    let mut key_stream = derive_key_stream(password, salt, SECRET_LEN);
    let mut decrypted = [0_u8; SECRET_LEN];
    for (index, byte) in ciphertext.iter().enumerate() {
        decrypted[index] = byte ^ key_stream[index];
    }
    key_stream.zeroize();

    Ok(decrypted)
}

fn integrity_tag(password: &str, salt: &[u8], ciphertext: &[u8]) -> [u8; TAG_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(b"connectkit:v1:tag:");
    hasher.update(password.as_bytes());
    hasher.update(salt);
    hasher.update(ciphertext);
    hasher.finalize().into()
}

fn derive_key_stream(seed: &str, salt: &[u8], len: usize) -> Vec<u8> {
    let mut stream = Vec::with_capacity(len);
    let mut counter: u64 = 0;
    while stream.len() < len {
        let mut hasher = Sha256::new();
        hasher.update(seed.as_bytes());
        hasher.update(salt);
        hasher.update(counter.to_le_bytes());
        let block = hasher.finalize();
        for byte in block {
            if stream.len() == len {
                break;
            }
            stream.push(byte);
        }
        counter += 1;
    }
    stream
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_recovers_to_signer_address() -> Result<()> {
        let signer = LocalSigner::new_random();
        let signature = signer.sign_message(b"hello connectkit")?;

        assert!(signature[64] == 27 || signature[64] == 28);
        assert_eq!(recover_address(b"hello connectkit", &signature)?, signer.address());
        assert_ne!(recover_address(b"tampered", &signature)?, signer.address());
        Ok(())
    }

    #[test]
    fn known_key_derives_known_address() -> Result<()> {
        let mut secret = [0_u8; 32];
        secret[31] = 1;
        let signer = LocalSigner::from_secret_key_bytes(secret)?;
        assert_eq!(
            signer.address().to_checksum(None),
            "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf"
        );
        Ok(())
    }

    #[test]
    fn key_material_roundtrip_and_wrong_password() -> Result<()> {
        let signer = LocalSigner::new_random();
        let secret = signer.secret_key_bytes();

        let encrypted = encrypt_key_material(&secret, "correct horse")?;
        assert_eq!(encrypted.len(), 80);
        assert_eq!(decrypt_key_material(&encrypted, "correct horse")?, secret);
        assert_eq!(
            decrypt_key_material(&encrypted, "battery staple"),
            Err(KeyMaterialError::InvalidPassword)
        );
        assert_eq!(encrypt_key_material(&secret, "  "), Err(KeyMaterialError::EmptyPassword));
        Ok(())
    }
}
