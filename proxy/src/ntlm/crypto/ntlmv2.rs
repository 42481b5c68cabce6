//! Full NTLMv2 challenge-response (MS-NLMP 3.3.2), grounded on
//! `util/crypto/ntlm_v2.rs` in the teacher. The teacher's `compute_ntlm_v2_response`
//! verifies an inbound response; this module builds the outbound one a client
//! sends, using the same `temp` blob layout.

use hmac::{Hmac, Mac};
use md5::Md5;

use proxy_core::byte_helper::u64_to_bytes;

/// The `temp` blob appended after the 16-byte HMAC proof in the NTLMv2 NT
/// response: a fixed `0x01010000` signature, the FILETIME timestamp, the
/// client challenge, a 4-byte zero reserved field, the target-info AV-pair
/// blob taken verbatim from the Type-2 message, and a trailing 4-byte zero.
fn build_blob(timestamp: u64, client_challenge: &[u8; 8], target_info: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(28 + target_info.len());
    blob.extend_from_slice(&[0x01, 0x01, 0x00, 0x00]);
    blob.extend_from_slice(&[0u8; 4]);
    blob.extend_from_slice(&u64_to_bytes(timestamp));
    blob.extend_from_slice(client_challenge);
    blob.extend_from_slice(&[0u8; 4]);
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&[0u8; 4]);
    blob
}

/// Computes `(nt_response, lm_response)` given the NTOWFv2 key, the 8-byte
/// server challenge, an 8-byte client challenge, a Windows FILETIME timestamp
/// and the Type-2 message's target-info bytes.
pub fn ntlmv2_response(
    ntlmv2_key: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
    timestamp: u64,
    target_info: &[u8],
) -> (Vec<u8>, Vec<u8>) {
    let blob = build_blob(timestamp, client_challenge, target_info);

    let mut nt_mac = new_hmac(ntlmv2_key);
    nt_mac.update(server_challenge);
    nt_mac.update(&blob);
    let nt_proof = nt_mac.finalize().into_bytes();

    let mut nt_response = Vec::with_capacity(16 + blob.len());
    nt_response.extend_from_slice(&nt_proof);
    nt_response.extend_from_slice(&blob);

    let mut lm_mac = new_hmac(ntlmv2_key);
    lm_mac.update(server_challenge);
    lm_mac.update(client_challenge);
    let lm_proof = lm_mac.finalize().into_bytes();

    let mut lm_response = Vec::with_capacity(24);
    lm_response.extend_from_slice(&lm_proof);
    lm_response.extend_from_slice(client_challenge);

    (nt_response, lm_response)
}

fn new_hmac(key: &[u8; 16]) -> Hmac<Md5> {
    <Hmac<Md5>>::new_from_slice(key).expect("16-byte key is always valid for HMAC-MD5")
}

/// Windows FILETIME: 100ns intervals since 1601-01-01, matching MS-NLMP's
/// timestamp field. `unix_seconds` is the wall-clock time to encode.
pub fn filetime_from_unix_seconds(unix_seconds: u64) -> u64 {
    const EPOCH_DIFF_SECONDS: u64 = 11_644_473_600;
    (unix_seconds + EPOCH_DIFF_SECONDS) * 10_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nt_response_embeds_the_blob_after_the_16_byte_proof() {
        let key = [0x11u8; 16];
        let server_challenge = [0x22u8; 8];
        let client_challenge = [0x33u8; 8];
        let target_info = vec![0xAA, 0xBB, 0xCC];
        let (nt, lm) = ntlmv2_response(&key, &server_challenge, &client_challenge, 0, &target_info);

        assert!(nt.len() > 16);
        assert_eq!(&nt[16..20], &[0x01, 0x01, 0x00, 0x00]);
        assert_eq!(lm.len(), 24);
        assert_eq!(&lm[16..], &client_challenge[..]);
    }

    #[test]
    fn filetime_conversion_is_monotonic() {
        let t1 = filetime_from_unix_seconds(1_000);
        let t2 = filetime_from_unix_seconds(2_000);
        assert!(t2 > t1);
    }
}
