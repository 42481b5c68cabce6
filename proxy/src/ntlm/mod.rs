//! NTLM client handshake: builds the Type-1 Negotiate message the proxy sends
//! on the client's behalf, and the Type-3 Authenticate message answering an
//! upstream's Type-2 Challenge, per spec.md §4.2's algorithm-selection rule.

pub mod crypto;
pub mod message;

pub use message::{AuthenticateMessage, ChallengeMessage, NTLMNegotiateFlags, NegotiateMessage};

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use rand::RngCore;

use crate::credential::Credential;
use crypto::{hash, ntlmv2};
use proxy_core::{ProxyError, ProxyResult};

/// Wraps a Type-1/Type-3 message as the `NTLM <b64>` token carried in
/// `Proxy-Authorization` (spec.md §6: "must be byte-exact").
pub fn encode_authorization_header(message_bytes: &[u8]) -> String {
    format!("NTLM {}", base64::engine::general_purpose::STANDARD.encode(message_bytes))
}

/// Unwraps a `Proxy-Authenticate: NTLM <b64>` header value into the raw
/// Type-2 message bytes. Fails with `ntlm-bad-challenge` if the scheme isn't
/// `NTLM` or the payload isn't valid base64 (spec.md §4.5's 407 handling).
pub fn decode_challenge_header(header_value: &str) -> ProxyResult<Vec<u8>> {
    let trimmed = header_value.trim();
    let b64 = trimmed
        .get(..4)
        .filter(|scheme| scheme.eq_ignore_ascii_case("NTLM"))
        .map(|_| trimmed[4..].trim())
        .ok_or_else(|| ProxyError::ntlm_bad_challenge("Proxy-Authenticate scheme is not NTLM"))?;
    base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|e| ProxyError::ntlm_bad_challenge(format!("invalid base64 in Proxy-Authenticate: {e}")))
}

/// Builds the Type-1 message for a fresh handshake. The negotiate flags are
/// the credential's manual override if set, otherwise the crate default.
pub fn negotiate(credential: &Credential) -> NegotiateMessage {
    let flags = credential
        .manual_flags()
        .map(NTLMNegotiateFlags::from_bits_truncate)
        .unwrap_or_default();

    NegotiateMessage::new(flags, credential.domain(), credential.workstation())
}

/// Builds the Type-3 message answering `challenge`, picking the strongest
/// algorithm the credential has material for: NTLMv2 first, then NTLM2
/// Session Security (if the upstream negotiated extended session security
/// and an NT hash is available), then the legacy LM/NT pair.
pub fn authenticate(credential: &Credential, challenge: &ChallengeMessage) -> ProxyResult<AuthenticateMessage> {
    let mut client_challenge = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut client_challenge);

    let (lm_response, nt_response) = if credential.policy().hashntlm2 {
        let key = credential
            .ntlmv2_hash()
            .ok_or_else(|| ProxyError::ntlm_bad_challenge("NTLMv2 policy enabled but no NTLMv2 key available"))?;
        let timestamp = ntlmv2::filetime_from_unix_seconds(unix_now_seconds());
        ntlmv2::ntlmv2_response(key, &challenge.server_challenge, &client_challenge, timestamp, &challenge.target_info)
    } else if challenge.flags.contains(NTLMNegotiateFlags::EXTENDED_SESSION_SECURITY) && credential.has_hash(crate::credential::HashKind::Nt)
    {
        let nt = credential.nt_hash().expect("has_hash checked above");
        hash::ntlm2_session_response(nt, &challenge.server_challenge, &client_challenge)
    } else {
        let lm = match credential.lm_hash() {
            Some(lm) => hash::lm_response(lm, &challenge.server_challenge),
            None => Vec::new(),
        };
        let nt = match credential.nt_hash() {
            Some(nt) => hash::nt_response(nt, &challenge.server_challenge),
            None => Vec::new(),
        };
        (lm, nt)
    };

    if lm_response.is_empty() && nt_response.is_empty() {
        return Err(ProxyError::ntlm_bad_challenge("no usable hash produced a challenge response"));
    }

    Ok(AuthenticateMessage {
        flags: challenge.flags,
        domain: credential.domain().to_string(),
        user: credential.username().to_string(),
        workstation: credential.workstation().to_string(),
        lm_response,
        nt_response,
        session_key: Vec::new(),
    })
}

fn unix_now_seconds() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{AuthPolicy, Credential};

    #[test]
    fn negotiate_uses_manual_flags_when_present() {
        let cred = Credential::from_hashes("alice", "CORP", "WS01", AuthPolicy::ntlm(), None, None, None, Some(0x01));
        let msg = negotiate(&cred);
        assert_eq!(msg.flags.bits(), 0x01);
    }

    #[test]
    fn authenticate_prefers_ntlmv2_when_available() {
        let cred = Credential::from_password("alice", "CORP", "WS01", AuthPolicy::ntlmv2(), "hunter2".into(), None);
        let challenge = ChallengeMessage {
            target_name: b"CORP".to_vec(),
            flags: NTLMNegotiateFlags::TARGET_INFO | NTLMNegotiateFlags::EXTENDED_SESSION_SECURITY,
            server_challenge: [1u8; 8],
            target_info: vec![0, 0, 0, 0],
        };
        let auth = authenticate(&cred, &challenge).unwrap();
        assert!(auth.nt_response.len() > 16);
    }

    #[test]
    fn authorization_header_round_trips_through_decode() {
        let encoded = encode_authorization_header(b"NTLMSSP\0test");
        assert!(encoded.starts_with("NTLM "));
        let decoded = decode_challenge_header(&encoded).unwrap();
        assert_eq!(decoded, b"NTLMSSP\0test");
    }

    #[test]
    fn decode_challenge_header_rejects_non_ntlm_scheme() {
        assert!(decode_challenge_header("Negotiate abcd").is_err());
    }

    #[test]
    fn decode_challenge_header_accepts_any_scheme_case() {
        let encoded = encode_authorization_header(b"NTLMSSP\0test");
        let b64_payload = encoded.strip_prefix("NTLM ").unwrap();
        let lowered_scheme = format!("ntlm {b64_payload}");
        assert_eq!(decode_challenge_header(&lowered_scheme).unwrap(), b"NTLMSSP\0test");
    }

    #[test]
    fn authenticate_fails_when_no_hash_matches_any_algorithm() {
        let cred = Credential::from_hashes("alice", "CORP", "WS01", AuthPolicy::default(), None, None, None, None);
        let challenge = ChallengeMessage {
            target_name: Vec::new(),
            flags: NTLMNegotiateFlags::empty(),
            server_challenge: [0u8; 8],
            target_info: Vec::new(),
        };
        assert!(authenticate(&cred, &challenge).is_err());
    }
}
