//! Password-derived hashes and the legacy (NTLMv1 / NTLM2 Session Security)
//! challenge-response algorithms, grounded on `util/crypto/ntlm_v1_extended.rs`
//! and `util/crypto/des.rs` in the teacher. The teacher verifies a response
//! received from a client; we are the client, so every function here
//! *produces* the response a real Windows client would send.

use digest::Digest;
use md4::Md4;
use md5::Md5;

use proxy_core::byte_helper::u16_to_bytes;

use super::des::des_encrypt_with_7byte_key;

const LM_MAGIC: &[u8; 8] = b"KGS!@#$%";

/// MS-NLMP 3.3.1 LMOWF: uppercase password, OEM-encode, pad/truncate to 14
/// bytes, DES-encrypt the fixed magic string with each 7-byte half.
pub fn lm_hash(password: &str) -> [u8; 16] {
    let mut oem = [0u8; 14];
    for (i, c) in password.to_uppercase().chars().take(14).enumerate() {
        // Best-effort OEM encoding: cntlm assumes the password is ASCII-range;
        // non-ASCII characters are truncated to their low byte.
        oem[i] = c as u32 as u8;
    }

    let half1 = des_encrypt_with_7byte_key(&oem[0..7], LM_MAGIC).expect("7-byte key is always valid");
    let half2 = des_encrypt_with_7byte_key(&oem[7..14], LM_MAGIC).expect("7-byte key is always valid");

    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&half1);
    out[8..].copy_from_slice(&half2);
    out
}

/// MS-NLMP 3.3.1 NTOWF (v1): MD4 of the UTF-16LE password.
pub fn nt_hash(password: &str) -> [u8; 16] {
    let utf16le: Vec<u8> = password.encode_utf16().flat_map(u16_to_bytes).collect();
    let digest = Md4::digest(&utf16le);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest);
    out
}

/// NTOWFv2 / LMOWFv2 (MS-NLMP 3.3.2): HMAC-MD5 of the NT hash keyed text
/// `UPPER(username) + domain`, encoded UTF-16LE. In NTLMv2 this same 16-byte
/// value doubles as both the "LM" and "NT" owf.
pub fn ntlmv2_key(password: &str, username: &str, domain: &str) -> [u8; 16] {
    use hmac::{Hmac, Mac};

    let nt = nt_hash(password);
    let text = username.to_uppercase() + domain;
    let bytes: Vec<u8> = text.encode_utf16().flat_map(u16_to_bytes).collect();

    let mut mac = <Hmac<Md5>>::new_from_slice(&nt).expect("HMAC accepts any key length");
    mac.update(&bytes);
    let out = mac.finalize().into_bytes();
    let mut fixed = [0u8; 16];
    fixed.copy_from_slice(&out);
    fixed
}

/// Legacy LM response (MS-NLMP 3.3.1 `DESL`): pad the LM hash to 21 bytes and
/// DES-long-encrypt the server challenge.
pub fn lm_response(lm_hash: &[u8; 16], server_challenge: &[u8; 8]) -> Vec<u8> {
    super::des::des_long_encrypt(lm_hash, server_challenge).expect("lengths are fixed and valid")
}

/// Legacy NT response, same construction keyed on the NT hash.
pub fn nt_response(nt_hash: &[u8; 16], server_challenge: &[u8; 8]) -> Vec<u8> {
    super::des::des_long_encrypt(nt_hash, server_challenge).expect("lengths are fixed and valid")
}

/// NTLM2 Session Security response (spec.md §4.2): the client picks an 8-byte
/// challenge, folds it with the server challenge through MD5 and truncates to
/// 8 bytes, then runs the ordinary `DESL` construction against that session
/// hash instead of the raw server challenge. The LM response field carries
/// the client challenge padded with zeros rather than a real LM response.
pub fn ntlm2_session_response(nt_hash: &[u8; 16], server_challenge: &[u8; 8], client_challenge: &[u8; 8]) -> (Vec<u8>, Vec<u8>) {
    let mut session_nonce = [0u8; 16];
    session_nonce[..8].copy_from_slice(server_challenge);
    session_nonce[8..].copy_from_slice(client_challenge);
    let digest = Md5::digest(session_nonce);
    let mut session_hash = [0u8; 8];
    session_hash.copy_from_slice(&digest[..8]);

    let nt_resp = super::des::des_long_encrypt(nt_hash, &session_hash).expect("lengths are fixed and valid");

    let mut lm_resp = vec![0u8; 24];
    lm_resp[..8].copy_from_slice(client_challenge);

    (lm_resp, nt_resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nt_hash_matches_known_vector() {
        // MS-NLMP 4.2.2.1.2 test vector: password "Password", user "User", domain "Domain".
        let nt = nt_hash("Password");
        assert_eq!(hex::encode_upper(nt), "A4F49C406510BDCAB6824EE7C30FD852");
    }

    #[test]
    fn ntlmv2_key_is_deterministic_and_domain_sensitive() {
        let key = ntlmv2_key("Password", "User", "Domain");
        assert_eq!(key, ntlmv2_key("Password", "User", "Domain"));
        assert_ne!(key, ntlmv2_key("Password", "User", "OtherDomain"));
    }

    #[test]
    fn lm_hash_is_16_bytes_and_deterministic() {
        let a = lm_hash("password");
        let b = lm_hash("password");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn legacy_responses_are_24_bytes() {
        let lm = lm_hash("password");
        let challenge = [1u8; 8];
        assert_eq!(lm_response(&lm, &challenge).len(), 24);
        assert_eq!(nt_response(&nt_hash("password"), &challenge).len(), 24);
    }

    #[test]
    fn ntlm2_session_response_lm_field_carries_padded_client_challenge() {
        let nt = nt_hash("password");
        let server = [2u8; 8];
        let client = [3u8; 8];
        let (lm_resp, nt_resp) = ntlm2_session_response(&nt, &server, &client);
        assert_eq!(&lm_resp[..8], &client[..]);
        assert_eq!(&lm_resp[8..], &[0u8; 16][..]);
        assert_eq!(nt_resp.len(), 24);
    }
}
