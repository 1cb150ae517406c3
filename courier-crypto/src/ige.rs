//! AES-256 in Infinite Garble Extension mode.
//!
//! MTProto chains blocks with both the previous plaintext and the previous
//! ciphertext. The 32-byte IV holds the two 16-byte chaining seeds.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;

/// Encrypt `data` in place. `data.len()` must be a multiple of 16.
pub fn encrypt(data: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    debug_assert_eq!(data.len() % 16, 0);
    let cipher = Aes256::new(GenericArray::from_slice(key));

    let mut cipher_prev = [0u8; 16];
    cipher_prev.copy_from_slice(&iv[..16]);
    let mut plain_prev = [0u8; 16];
    plain_prev.copy_from_slice(&iv[16..]);

    for chunk in data.chunks_exact_mut(16) {
        let mut plain = [0u8; 16];
        plain.copy_from_slice(chunk);

        let mut block = [0u8; 16];
        for (b, (p, c)) in block.iter_mut().zip(plain.iter().zip(cipher_prev.iter())) {
            *b = p ^ c;
        }
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
        for (b, p) in block.iter_mut().zip(plain_prev.iter()) {
            *b ^= p;
        }

        chunk.copy_from_slice(&block);
        cipher_prev = block;
        plain_prev = plain;
    }
}

/// Decrypt `data` in place. `data.len()` must be a multiple of 16.
pub fn decrypt(data: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    debug_assert_eq!(data.len() % 16, 0);
    let cipher = Aes256::new(GenericArray::from_slice(key));

    let mut cipher_prev = [0u8; 16];
    cipher_prev.copy_from_slice(&iv[..16]);
    let mut plain_prev = [0u8; 16];
    plain_prev.copy_from_slice(&iv[16..]);

    for chunk in data.chunks_exact_mut(16) {
        let mut encrypted = [0u8; 16];
        encrypted.copy_from_slice(chunk);

        let mut block = [0u8; 16];
        for (b, (e, p)) in block.iter_mut().zip(encrypted.iter().zip(plain_prev.iter())) {
            *b = e ^ p;
        }
        cipher.decrypt_block(GenericArray::from_mut_slice(&mut block));
        for (b, c) in block.iter_mut().zip(cipher_prev.iter()) {
            *b ^= c;
        }

        chunk.copy_from_slice(&block);
        plain_prev = block;
        cipher_prev = encrypted;
    }
}
