//! Sealing and validation of stored session locks.
//!
//! A stored lock value has the form `<hex secret>|<hex HMAC-SHA256>`, where
//! the HMAC is keyed with the secret and computed over the fingerprint of
//! the request that created the lock. Validation recomputes the HMAC for
//! the current request and compares in constant time. Any malformed value
//! is a mismatch.

use crate::error::{QuizlockError, QuizlockResult};
use crate::fingerprint::Fingerprint;
use crate::store::AttemptLock;
use hmac::{Hmac, Mac};
use log::warn;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Length in bytes of the per-lock secret.
pub const SECRET_LEN: usize = 16;

/// Separator between the secret and the MAC in a stored lock value.
pub const SEPARATOR: char = '|';

/// Source of lock secrets.
pub trait SecretSource {
    /// Fill `buf` with unpredictable bytes or fail the request.
    fn fill(&self, buf: &mut [u8]) -> QuizlockResult<()>;
}

/// Operating-system CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSecretSource;

impl SecretSource for OsSecretSource {
    fn fill(&self, buf: &mut [u8]) -> QuizlockResult<()> {
        OsRng
            .try_fill_bytes(buf)
            .map_err(|err| QuizlockError::Entropy(err.to_string()))
    }
}

/// Draw a fresh lock secret from `source`.
pub fn generate_secret(source: &dyn SecretSource) -> QuizlockResult<Zeroizing<Vec<u8>>> {
    let mut secret = Zeroizing::new(vec![0u8; SECRET_LEN]);
    source.fill(secret.as_mut_slice())?;
    Ok(secret)
}

/// Lowercase hex HMAC-SHA256 of `fingerprint` keyed with `secret`.
pub fn fingerprint_mac(secret: &[u8], fingerprint: &Fingerprint) -> QuizlockResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|err| QuizlockError::InvalidConfig(format!("hmac key rejected: {err}")))?;
    mac.update(fingerprint.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Build the stored lock value binding `secret` to `fingerprint`.
pub fn seal(secret: &[u8], fingerprint: &Fingerprint) -> QuizlockResult<String> {
    let mac = fingerprint_mac(secret, fingerprint)?;
    Ok(format!("{}{SEPARATOR}{mac}", hex::encode(secret)))
}

/// Reasons a stored lock value cannot be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedLock {
    Empty,
    MissingSeparator,
    EmptySecret,
    EmptyMac,
    SecretNotHex,
}

impl fmt::Display for MalformedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            MalformedLock::Empty => "value is empty",
            MalformedLock::MissingSeparator => "separator missing",
            MalformedLock::EmptySecret => "secret segment empty",
            MalformedLock::EmptyMac => "mac segment empty",
            MalformedLock::SecretNotHex => "secret is not valid hex",
        };
        f.write_str(reason)
    }
}

/// Split a stored value into its decoded secret and the hex MAC text.
pub fn parse_session_hash(value: &str) -> Result<(Zeroizing<Vec<u8>>, &str), MalformedLock> {
    if value.is_empty() {
        return Err(MalformedLock::Empty);
    }
    let (secret_hex, mac) = value
        .split_once(SEPARATOR)
        .ok_or(MalformedLock::MissingSeparator)?;
    if secret_hex.is_empty() {
        return Err(MalformedLock::EmptySecret);
    }
    if mac.is_empty() {
        return Err(MalformedLock::EmptyMac);
    }
    let secret = hex::decode(secret_hex).map_err(|_| MalformedLock::SecretNotHex)?;
    Ok((Zeroizing::new(secret), mac))
}

/// Check `fingerprint` against the stored value, failing closed.
pub fn matches(session_hash: &str, fingerprint: &Fingerprint) -> Result<bool, MalformedLock> {
    let (secret, stored_mac) = parse_session_hash(session_hash)?;
    let Ok(current_mac) = fingerprint_mac(&secret, fingerprint) else {
        return Ok(false);
    };
    Ok(bool::from(stored_mac.as_bytes().ct_eq(current_mac.as_bytes())))
}

/// True only when `lock` was sealed over exactly `fingerprint`.
pub fn validate(lock: &AttemptLock, fingerprint: &Fingerprint) -> bool {
    match matches(&lock.session_hash, fingerprint) {
        Ok(matched) => matched,
        Err(reason) => {
            warn!(
                "[QL2100] stored session lock for attempt {} is malformed ({reason}); treating as mismatch",
                lock.attempt_id
            );
            false
        }
    }
}
