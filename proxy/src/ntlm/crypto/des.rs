//! DES primitives used by the legacy LM/NT challenge-response algorithms.
//! Grounded on `util/crypto/des.rs` in the teacher, which implements the same
//! "split a 16-byte hash into three 7-byte DES keys" construction from
//! MS-NLMP 3.3.1.

use des::cipher::BlockEncrypt;
use des::Des;
use digest::KeyInit;
use proxy_core::{ProxyError, ProxyResult};

/// Encrypts an 8-byte plaintext (the server challenge) under a 16-byte hash,
/// expanded into three 7-byte DES keys, producing a 24-byte response.
pub fn des_long_encrypt(key: &[u8], plaintext: &[u8]) -> ProxyResult<Vec<u8>> {
    if key.len() != 16 || plaintext.len() != 8 {
        return Err(ProxyError::ntlm_bad_challenge("invalid key or plaintext length for DES long encrypt"));
    }
    let mut padded = [0u8; 21];
    padded[..16].copy_from_slice(key);

    let k1 = &padded[0..7];
    let k2 = &padded[7..14];
    let k3 = &padded[14..21];

    let r1 = des_encrypt(&extend_des_key(k1), plaintext)?;
    let r2 = des_encrypt(&extend_des_key(k2), plaintext)?;
    let r3 = des_encrypt(&extend_des_key(k3), plaintext)?;

    Ok([r1, r2, r3].concat())
}

/// Spreads 7 bytes of key material across 8 bytes, inserting an odd-parity
/// bit in the low position of each byte (the bit itself is never checked by
/// this DES implementation but the expansion must still produce 8 bytes).
fn extend_des_key(key: &[u8]) -> [u8; 8] {
    let mut result = [0u8; 8];

    result[0] = key[0] >> 1;
    result[1] = ((key[0] & 0x01) << 6) | (key[1] >> 2);
    result[2] = ((key[1] & 0x03) << 5) | (key[2] >> 3);
    result[3] = ((key[2] & 0x07) << 4) | (key[3] >> 4);
    result[4] = ((key[3] & 0x0F) << 3) | (key[4] >> 5);
    result[5] = ((key[4] & 0x1F) << 2) | (key[5] >> 6);
    result[6] = ((key[5] & 0x3F) << 1) | (key[6] >> 7);
    result[7] = key[6] & 0x7F;

    for b in result.iter_mut() {
        *b <<= 1;
    }

    result
}

/// Encrypts `plaintext` under a single 7-byte DES key (expanded to 8 bytes).
/// Used by the LM hash, which runs this twice over the fixed `"KGS!@#$%"`
/// plaintext with the two 7-byte halves of the uppercased OEM password.
pub fn des_encrypt_with_7byte_key(key7: &[u8], plaintext: &[u8; 8]) -> ProxyResult<[u8; 8]> {
    if key7.len() != 7 {
        return Err(ProxyError::ntlm_bad_challenge("invalid 7-byte DES key length"));
    }
    let out = des_encrypt(&extend_des_key(key7), plaintext)?;
    let mut fixed = [0u8; 8];
    fixed.copy_from_slice(&out);
    Ok(fixed)
}

fn des_encrypt(key: &[u8], plaintext: &[u8]) -> ProxyResult<Vec<u8>> {
    let cipher = Des::new_from_slice(key).map_err(|_| ProxyError::ntlm_bad_challenge("invalid DES key length"))?;
    let mut result = vec![0u8; plaintext.len()];
    cipher.encrypt_block_b2b(plaintext.into(), (&mut *result).into());
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn des_long_encrypt_rejects_wrong_lengths() {
        assert!(des_long_encrypt(&[0u8; 15], &[0u8; 8]).is_err());
        assert!(des_long_encrypt(&[0u8; 16], &[0u8; 7]).is_err());
    }

    #[test]
    fn des_long_encrypt_produces_24_bytes() {
        let out = des_long_encrypt(&[0u8; 16], &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(out.len(), 24);
    }
}
