//! Compact base-92 codes and random storage keys.
//!
//! The alphabet contains every printable ASCII character except `"`
//! and `\` (so codes embed in JSON strings unescaped) and `:` (the
//! ident separator). That leaves exactly 92 characters, space
//! included.

use burrow_core::{VaultError, VaultResult};
use rand::Rng;

/// 92 JSON-string-safe characters; index order is load-bearing and
/// must never change once vaults exist.
pub const ALPHABET: &[u8; 92] =
    b" !#$%&'()*+,-./0123456789;<=>?@ABCDEFGHIJKLMNOPQRSTUVWXYZ[]^_`abcdefghijklmnopqrstuvwxyz{|}~";

/// Subset of the alphabet safe in storage-key names across media:
/// no space, no path separator, no key-class markers.
const KEY_ALPHABET: &[u8] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

const RANDOM_KEY_LEN: usize = 16;

/// Encode a sequence index as a base-92 code.
pub fn encode_code(mut value: u64) -> String {
    let base = ALPHABET.len() as u64;
    let mut out = Vec::new();
    loop {
        out.push(ALPHABET[(value % base) as usize]);
        value /= base;
        if value == 0 {
            break;
        }
    }
    out.reverse();
    String::from_utf8(out).expect("alphabet is ASCII")
}

/// Decode a base-92 code back to its sequence index.
pub fn decode_code(code: &str) -> VaultResult<u64> {
    if code.is_empty() {
        return Err(VaultError::Corrupted("empty base-92 code".into()));
    }
    let base = ALPHABET.len() as u64;
    let mut value: u64 = 0;
    for byte in code.bytes() {
        let digit = ALPHABET
            .iter()
            .position(|&c| c == byte)
            .ok_or_else(|| VaultError::Corrupted(format!("invalid base-92 code '{code}'")))?;
        value = value
            .checked_mul(base)
            .and_then(|v| v.checked_add(digit as u64))
            .ok_or_else(|| VaultError::Corrupted(format!("base-92 code '{code}' overflows")))?;
    }
    Ok(value)
}

/// Fresh random storage key for a bucket (`_`-prefixed, plain class).
pub fn random_bucket_key() -> String {
    let mut rng = rand::thread_rng();
    let mut key = String::with_capacity(1 + RANDOM_KEY_LEN);
    key.push('_');
    for _ in 0..RANDOM_KEY_LEN {
        key.push(KEY_ALPHABET[rng.gen_range(0..KEY_ALPHABET.len())] as char);
    }
    key
}

/// Ident filter for index queries: match the full ident exactly or by
/// regular expression.
pub enum IdentPattern {
    Exact(String),
    Regex(regex_lite::Regex),
}

impl IdentPattern {
    pub fn regex(pattern: &str) -> VaultResult<Self> {
        regex_lite::Regex::new(pattern)
            .map(IdentPattern::Regex)
            .map_err(|e| VaultError::Bug(format!("invalid ident pattern '{pattern}': {e}")))
    }

    pub fn matches(&self, ident: &str) -> bool {
        match self {
            IdentPattern::Exact(s) => s == ident,
            IdentPattern::Regex(re) => re.is_match(ident),
        }
    }
}
