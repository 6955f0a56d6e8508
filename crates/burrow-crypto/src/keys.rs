//! HKDF key hierarchy: root key → cipher key, signing key, nonces.

use burrow_core::{VaultError, VaultResult};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::kdf::RootKey;
use crate::{KEY_SIZE, NONCE_SIZE, VECTOR_SIZE};

const CIPHER_INFO: &[u8] = b"burrow-cipher";
const SIGNING_INFO: &[u8] = b"burrow-signing";

/// Fixed constant signed to prove possession of the root key. A valid
/// signature distinguishes "wrong passphrase" from "stale or
/// interrupted rotation".
const ROOT_SIGN_CONSTANT: &[u8] = b"burrow-root-signature-v1";

type HmacSha256 = Hmac<Sha256>;

/// AES-256-GCM key derived from a root key.
///
/// Decrypt-only unless freshly rotated; `seal` refuses a key that was
/// not derived with `allow_encrypt`.
#[derive(Clone)]
pub struct CipherKey {
    bytes: [u8; KEY_SIZE],
    allow_encrypt: bool,
}

impl CipherKey {
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    pub fn allows_encrypt(&self) -> bool {
        self.allow_encrypt
    }
}

impl Drop for CipherKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherKey")
            .field("bytes", &"[REDACTED]")
            .field("allow_encrypt", &self.allow_encrypt)
            .finish()
    }
}

/// HMAC-SHA256 key scoped to signing or verification.
pub struct SigningKey {
    bytes: [u8; KEY_SIZE],
    for_signing: bool,
}

impl Drop for SigningKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("bytes", &"[REDACTED]")
            .field("for_signing", &self.for_signing)
            .finish()
    }
}

/// Derive the AES-GCM cipher key for this vault.
pub fn derive_cipher_key(root: &RootKey, salt: &[u8], allow_encrypt: bool) -> CipherKey {
    CipherKey {
        bytes: hkdf_derive(root.as_bytes(), salt, CIPHER_INFO),
        allow_encrypt,
    }
}

/// Derive the HMAC signing key for this vault.
pub fn derive_signing_key(root: &RootKey, salt: &[u8], for_signing: bool) -> SigningKey {
    SigningKey {
        bytes: hkdf_derive(root.as_bytes(), salt, SIGNING_INFO),
        for_signing,
    }
}

/// Sign the fixed root-check constant under this root key.
pub fn root_signature(root: &RootKey, salt: &[u8]) -> Vec<u8> {
    let key = derive_signing_key(root, salt, true);
    let mut mac = HmacSha256::new_from_slice(&key.bytes).expect("HMAC accepts any key length");
    mac.update(ROOT_SIGN_CONSTANT);
    mac.finalize().into_bytes().to_vec()
}

/// Constant-time check of a stored root signature.
pub fn verify_root(root: &RootKey, salt: &[u8], signature: &[u8]) -> bool {
    let key = derive_signing_key(root, salt, false);
    let mut mac = HmacSha256::new_from_slice(&key.bytes).expect("HMAC accepts any key length");
    mac.update(ROOT_SIGN_CONSTANT);
    mac.verify_slice(signature).is_ok()
}

/// Deterministically derive a 96-bit AES-GCM nonce.
///
/// The vector is not a key-material boundary here; it acts as a domain
/// separator so two vaults (or two root generations) never share nonce
/// space. Same `(vector, salt)` always yields the same bytes.
pub fn derive_cipher_nonce(vector: &[u8; VECTOR_SIZE], salt: &[u8]) -> [u8; NONCE_SIZE] {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), vector);
    let mut nonce = [0u8; NONCE_SIZE];
    hkdf.expand(&[], &mut nonce)
        .expect("12 bytes is a valid HKDF-SHA256 output length");
    nonce
}

fn hkdf_derive(ikm: &[u8; KEY_SIZE], salt: &[u8], info: &[u8]) -> [u8; KEY_SIZE] {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

/// Guard used by the codec: encrypting with a decrypt-only key is an
/// internal bug, not a user error.
pub(crate) fn require_encrypt(key: &CipherKey) -> VaultResult<()> {
    if !key.allow_encrypt {
        return Err(VaultError::Bug(
            "attempted to encrypt with a decrypt-only cipher key".into(),
        ));
    }
    Ok(())
}
