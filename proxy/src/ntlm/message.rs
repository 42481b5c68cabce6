//! NTLM message wire format (MS-NLMP 2.2.1), grounded on
//! `util/auth/ntlm/ntlm_message.rs`, `ntlm_challenge_message.rs` and
//! `ntlm_authenticate_message.rs` in the teacher. The teacher plays the
//! server (it builds Type-2 and parses Type-3); this proxy plays the client,
//! so the roles of "build" and "parse" below are swapped relative to it.

use bitflags::bitflags;
use nom::bytes::complete::take;
use nom::combinator::map;
use nom::number::complete::{le_u16, le_u32};
use nom::sequence::tuple;
use nom::IResult;
use proxy_core::byte_helper::{u16_to_bytes, u32_to_bytes};
use proxy_core::{ProxyError, ProxyResult};

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NTLMNegotiateFlags: u32 {
        const UNICODE_ENCODING = 0x0000_0001;
        const OEM_ENCODING = 0x0000_0002;
        const TARGET_NAME_SUPPLIED = 0x0000_0004;
        const SIGN = 0x0000_0010;
        const SEAL = 0x0000_0020;
        const DATAGRAM = 0x0000_0040;
        const LAN_MANAGER_SESSION_KEY = 0x0000_0080;
        const NTLM_SESSION_SECURITY = 0x0000_0200;
        const ANONYMOUS = 0x0000_0800;
        const DOMAIN_NAME_SUPPLIED = 0x0000_1000;
        const WORKSTATION_NAME_SUPPLIED = 0x0000_2000;
        const ALWAYS_SIGN = 0x0000_8000;
        const TARGET_TYPE_DOMAIN = 0x0001_0000;
        const TARGET_TYPE_SERVER = 0x0002_0000;
        const EXTENDED_SESSION_SECURITY = 0x0008_0000;
        const IDENTIFY = 0x0010_0000;
        const REQUEST_LM_SESSION_KEY = 0x0040_0000;
        const TARGET_INFO = 0x0080_0000;
        const VERSION = 0x0200_0000;
        const USE_128_BIT_ENCRYPTION = 0x2000_0000;
        const KEY_EXCHANGE = 0x4000_0000;
        const USE_56_BIT_ENCRYPTION = 0x8000_0000;
    }
}

impl Default for NTLMNegotiateFlags {
    /// The flag set cntlm advertises by default, overridable via
    /// [`crate::credential::Credential::manual_flags`] (spec.md §4.2).
    fn default() -> Self {
        Self::UNICODE_ENCODING
            | Self::OEM_ENCODING
            | Self::REQUEST_LM_SESSION_KEY
            | Self::NTLM_SESSION_SECURITY
            | Self::ALWAYS_SIGN
    }
}

pub(crate) fn parse_security_buffer(bytes: &[u8]) -> IResult<&[u8], (u16, u32)> {
    let (remaining, length) = le_u16(bytes)?;
    let (remaining, _maxlen) = le_u16(remaining)?;
    let (remaining, offset) = le_u32(remaining)?;
    Ok((remaining, (length, offset)))
}

fn security_buffer_bytes(length: u16, offset: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0..2].copy_from_slice(&u16_to_bytes(length));
    out[2..4].copy_from_slice(&u16_to_bytes(length));
    out[4..8].copy_from_slice(&u32_to_bytes(offset));
    out
}

fn slice_buffer<'a>(length: u16, offset: u32, bytes: &'a [u8]) -> ProxyResult<&'a [u8]> {
    let start = offset as usize;
    let end = start
        .checked_add(length as usize)
        .ok_or_else(|| ProxyError::ntlm_bad_challenge("security buffer overflows message"))?;
    bytes
        .get(start..end)
        .ok_or_else(|| ProxyError::ntlm_bad_challenge("security buffer out of range"))
}

/// Type-1 Negotiate message: built by the client and sent on the first leg
/// of the handshake. `domain`/`workstation` are only populated when their
/// corresponding `*_SUPPLIED` flags are set.
#[derive(Debug, Clone)]
pub struct NegotiateMessage {
    pub flags: NTLMNegotiateFlags,
    pub domain: String,
    pub workstation: String,
}

impl NegotiateMessage {
    pub fn new(flags: NTLMNegotiateFlags, domain: impl Into<String>, workstation: impl Into<String>) -> Self {
        Self { flags, domain: domain.into(), workstation: workstation.into() }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        const HEADER_LEN: u32 = 32;
        let domain_bytes = self.domain.as_bytes();
        let workstation_bytes = self.workstation.as_bytes();

        let domain_field = security_buffer_bytes(domain_bytes.len() as u16, HEADER_LEN);
        let workstation_field =
            security_buffer_bytes(workstation_bytes.len() as u16, HEADER_LEN + domain_bytes.len() as u32);

        [
            &SIGNATURE[..],
            &u32_to_bytes(0x01),
            &u32_to_bytes(self.flags.bits()),
            &domain_field,
            &workstation_field,
            domain_bytes,
            workstation_bytes,
        ]
        .concat()
    }
}

/// Type-2 Challenge message, received from the upstream in a `407` response.
#[derive(Debug, Clone)]
pub struct ChallengeMessage {
    pub target_name: Vec<u8>,
    pub flags: NTLMNegotiateFlags,
    pub server_challenge: [u8; 8],
    /// Raw AV-pair blob, required verbatim for the NTLMv2 response blob.
    pub target_info: Vec<u8>,
}

impl ChallengeMessage {
    pub fn parse(bytes: &[u8]) -> ProxyResult<Self> {
        let (remaining, (signature, msg_type, target_name_info, flags, server_challenge)) = tuple((
            take(8usize),
            le_u32,
            parse_security_buffer,
            map(le_u32, NTLMNegotiateFlags::from_bits_truncate),
            take(8usize),
        ))(bytes)
        .map_err(|_| ProxyError::ntlm_bad_challenge("truncated Type-2 message header"))?;

        if signature != &SIGNATURE[..] {
            return Err(ProxyError::ntlm_bad_challenge("bad NTLMSSP signature in Type-2 message"));
        }
        if msg_type != 0x02 {
            return Err(ProxyError::ntlm_bad_challenge(format!("expected Type-2 message, got type {msg_type}")));
        }

        let mut server_challenge_fixed = [0u8; 8];
        server_challenge_fixed.copy_from_slice(server_challenge);

        let target_name = slice_buffer(target_name_info.0, target_name_info.1, bytes)?.to_vec();

        // The target-info security buffer only exists when TARGET_INFO is
        // negotiated; beyond it lie optional reserved + version fields we
        // don't need.
        let target_info = if flags.contains(NTLMNegotiateFlags::TARGET_INFO) && remaining.len() >= 8 {
            let (_, target_info_fields) = parse_security_buffer(&remaining[8..])
                .map_err(|_| ProxyError::ntlm_bad_challenge("truncated target-info fields"))?;
            slice_buffer(target_info_fields.0, target_info_fields.1, bytes)?.to_vec()
        } else {
            Vec::new()
        };

        Ok(Self { target_name, flags, server_challenge: server_challenge_fixed, target_info })
    }
}

/// Type-3 Authenticate message, the client's final handshake leg.
#[derive(Debug, Clone)]
pub struct AuthenticateMessage {
    pub flags: NTLMNegotiateFlags,
    pub domain: String,
    pub user: String,
    pub workstation: String,
    pub lm_response: Vec<u8>,
    pub nt_response: Vec<u8>,
    pub session_key: Vec<u8>,
}

fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16_to_bytes).collect()
}

impl AuthenticateMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        const HEADER_LEN: u32 = 64;

        let domain = utf16le(&self.domain);
        let user = utf16le(&self.user);
        let workstation = utf16le(&self.workstation);
        let (domain, user, workstation) = (domain.as_slice(), user.as_slice(), workstation.as_slice());

        let mut offset = HEADER_LEN;
        let lm_field = security_buffer_bytes(self.lm_response.len() as u16, offset);
        offset += self.lm_response.len() as u32;
        let nt_field = security_buffer_bytes(self.nt_response.len() as u16, offset);
        offset += self.nt_response.len() as u32;
        let domain_field = security_buffer_bytes(domain.len() as u16, offset);
        offset += domain.len() as u32;
        let user_field = security_buffer_bytes(user.len() as u16, offset);
        offset += user.len() as u32;
        let workstation_field = security_buffer_bytes(workstation.len() as u16, offset);
        offset += workstation.len() as u32;
        let session_key_field = security_buffer_bytes(self.session_key.len() as u16, offset);

        [
            &SIGNATURE[..],
            &u32_to_bytes(0x03),
            &lm_field,
            &nt_field,
            &domain_field,
            &user_field,
            &workstation_field,
            &session_key_field,
            &u32_to_bytes(self.flags.bits()),
            &self.lm_response,
            &self.nt_response,
            domain,
            user,
            workstation,
            &self.session_key,
        ]
        .concat()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_message_round_trips_field_offsets() {
        let msg = NegotiateMessage::new(NTLMNegotiateFlags::default(), "CORP", "WS01");
        let bytes = msg.to_bytes();
        assert_eq!(&bytes[0..8], &SIGNATURE[..]);
        assert_eq!(bytes.len(), 32 + 4 + 4);
    }

    #[test]
    fn challenge_message_parses_signature_and_challenge() {
        let target_name = b"CORP".to_vec();
        let flags = NTLMNegotiateFlags::UNICODE_ENCODING;
        let header_len = 32u32;
        let bytes = [
            &SIGNATURE[..],
            &u32_to_bytes(0x02),
            &security_buffer_bytes(target_name.len() as u16, header_len),
            &u32_to_bytes(flags.bits()),
            &[0xAAu8; 8],
            &target_name[..],
        ]
        .concat();

        let parsed = ChallengeMessage::parse(&bytes).unwrap();
        assert_eq!(parsed.target_name, target_name);
        assert_eq!(parsed.server_challenge, [0xAAu8; 8]);
    }

    #[test]
    fn challenge_message_rejects_bad_signature() {
        let bytes = [0u8; 40];
        assert!(ChallengeMessage::parse(&bytes).is_err());
    }

    #[test]
    fn challenge_message_rejects_wrong_message_type() {
        let target_name = b"CORP".to_vec();
        let bytes = [
            &SIGNATURE[..],
            &u32_to_bytes(0x03), // a Type-3 header, not Type-2
            &security_buffer_bytes(target_name.len() as u16, 32),
            &u32_to_bytes(0),
            &[0xAAu8; 8],
            &target_name[..],
        ]
        .concat();
        assert!(ChallengeMessage::parse(&bytes).is_err());
    }

    #[test]
    fn authenticate_message_serializes_all_fields_after_header() {
        let msg = AuthenticateMessage {
            flags: NTLMNegotiateFlags::default(),
            domain: "CORP".into(),
            user: "alice".into(),
            workstation: "WS01".into(),
            lm_response: vec![1; 24],
            nt_response: vec![2; 24],
            session_key: Vec::new(),
        };
        let bytes = msg.to_bytes();
        assert_eq!(&bytes[0..8], &SIGNATURE[..]);
        assert_eq!(bytes.len(), 64 + 24 + 24 + 8 + 10 + 8);
    }
}
