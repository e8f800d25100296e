//! Session key material: the pre-shared key, the per-handshake randoms and the
//! file IV derived from them.

use crate::crypto::BLOCK_SIZE;
use std::fmt;

/// Size of the phone and watch random numbers
pub const RANDOM_SIZE: usize = 8;

/// Offset of the phone random inside the file IV
const IV_PHONE_OFFSET: usize = 2;
/// Number of phone random bytes copied into the file IV
const IV_PHONE_LEN: usize = 6;
/// Offset of the watch random inside the file IV
const IV_WATCH_OFFSET: usize = 9;
/// Number of watch random bytes copied into the file IV
const IV_WATCH_LEN: usize = 7;

/// 16-byte pre-shared secret of a paired watch
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SessionKey([u8; 16]);

impl SessionKey {
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Parse a key from 32 hex characters (an optional `0x` prefix is accepted)
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let s = s.trim();
        let s = s.strip_prefix("0x").unwrap_or(s);
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

// Keep the secret out of logs.
impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({:02x}..)", self.0[0])
    }
}

/// The random pair established by one successful handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRandoms {
    pub phone_random: [u8; RANDOM_SIZE],
    pub watch_random: [u8; RANDOM_SIZE],
}

impl SessionRandoms {
    pub fn new(phone_random: [u8; RANDOM_SIZE], watch_random: [u8; RANDOM_SIZE]) -> Self {
        Self {
            phone_random,
            watch_random,
        }
    }

    /// Derive the initial CTR counter block for file decryption
    pub fn file_iv(&self) -> FileIv {
        derive_file_iv(self)
    }
}

/// Initial AES-CTR counter block for one encrypted file operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIv(pub [u8; BLOCK_SIZE]);

impl FileIv {
    pub fn as_bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.0
    }
}

impl fmt::Display for FileIv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Build the file IV from the session randoms
///
/// Layout (16 bytes, zero-initialised):
/// - 0x02..0x08: phone random bytes 0..6
/// - 0x09..0x10: watch random bytes 0..7
///
/// Bytes 0, 1 and 8 stay zero; the last byte of each random is unused.
pub fn derive_file_iv(randoms: &SessionRandoms) -> FileIv {
    let mut iv = [0u8; BLOCK_SIZE];
    iv[IV_PHONE_OFFSET..IV_PHONE_OFFSET + IV_PHONE_LEN].copy_from_slice(&randoms.phone_random[..IV_PHONE_LEN]);
    iv[IV_WATCH_OFFSET..IV_WATCH_OFFSET + IV_WATCH_LEN].copy_from_slice(&randoms.watch_random[..IV_WATCH_LEN]);
    FileIv(iv)
}

/// Source of the secret key for the connected watch
pub trait KeyStore: Send + Sync {
    fn secret_key(&self) -> Option<SessionKey>;
}

/// A key store holding a single key in memory
#[derive(Debug, Clone, Default)]
pub struct StaticKeyStore {
    key: Option<SessionKey>,
}

impl StaticKeyStore {
    pub fn new(key: SessionKey) -> Self {
        Self { key: Some(key) }
    }

    pub fn empty() -> Self {
        Self { key: None }
    }
}

impl KeyStore for StaticKeyStore {
    fn secret_key(&self) -> Option<SessionKey> {
        self.key
    }
}
