//! Cipher and checksum primitives used by the handshake and the file reader.
//!
//! - Handshake blocks: AES-128-CBC with an all-zero IV and no padding. Every
//!   handshake payload is exactly one 16-byte block.
//! - File payloads: AES-128-CTR. The counter is the whole 128-bit block read
//!   big-endian, so "incrementing the IV by n" is plain 128-bit addition.
//! - Integrity: CRC32 (IEEE 802.3, reflected poly 0xEDB88320).

use aes::Aes128;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use ctr::Ctr128BE;

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

const ZERO_IV: [u8; BLOCK_SIZE] = [0u8; BLOCK_SIZE];

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// CRC32 over a byte sequence
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// AES-128-CBC encrypt one block with a zero IV
pub fn aes_cbc_encrypt_block(key: &[u8; 16], plaintext: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
    let mut block = aes::Block::from(*plaintext);
    Aes128CbcEnc::new(key.into(), &ZERO_IV.into()).encrypt_block_mut(&mut block);
    block.into()
}

/// AES-128-CBC decrypt one block with a zero IV
///
/// Returns `None` if the cipher rejects the block layout.
pub fn aes_cbc_decrypt_block(key: &[u8; 16], ciphertext: &[u8; BLOCK_SIZE]) -> Option<[u8; BLOCK_SIZE]> {
    let mut output = *ciphertext;
    let len = Aes128CbcDec::new(key.into(), &ZERO_IV.into())
        .decrypt_padded_mut::<NoPadding>(&mut output)
        .ok()?
        .len();
    (len == BLOCK_SIZE).then_some(output)
}

/// Add `amount` to the IV treated as one 128-bit big-endian counter (wrapping)
pub fn increment_iv(iv: &[u8; BLOCK_SIZE], amount: u64) -> [u8; BLOCK_SIZE] {
    u128::from_be_bytes(*iv).wrapping_add(amount as u128).to_be_bytes()
}

/// Apply the AES-128-CTR keystream starting at counter block `iv`
///
/// Encryption and decryption are the same operation.
pub fn aes_ctr_apply(key: &[u8; 16], iv: &[u8; BLOCK_SIZE], data: &mut [u8]) {
    let mut cipher = Ctr128BE::<Aes128>::new(key.into(), &(*iv).into());
    cipher.apply_keystream(data);
}
