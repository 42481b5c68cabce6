use base64::Engine;
use proxy_core::ProxyResult;

use crate::ntlm::crypto::hash::{lm_hash, nt_hash, ntlmv2_key};

/// Which password-derived hashes the daemon is willing to compute a response
/// with. Multiple may be set simultaneously (legacy dual LM+NT), spec.md §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthPolicy {
    pub hashlm: bool,
    pub hashnt: bool,
    pub hashntlm2: bool,
    /// `-B`/`NTLMToBasic` (spec.md §9 supplement): fall back to HTTP Basic
    /// auth against the upstream when no NTLM hash is usable.
    pub ntlm_to_basic: bool,
}

impl AuthPolicy {
    pub fn ntlm() -> Self {
        Self { hashlm: true, hashnt: true, hashntlm2: false, ntlm_to_basic: false }
    }

    pub fn ntlmv2() -> Self {
        Self { hashlm: false, hashnt: false, hashntlm2: true, ntlm_to_basic: false }
    }
}

/// The single process-lifetime identity (spec.md §3: "Exactly one credential
/// exists for the process lifetime; it is read-only after startup").
///
/// Hashes are computed once from a cleartext password during startup and the
/// cleartext is wiped immediately after (`from_password`); `passes_any`
/// guards the forwarder against starting a handshake it has no material to
/// complete.
#[derive(Debug, Clone)]
pub struct Credential {
    username: String,
    domain: String,
    workstation: String,
    policy: AuthPolicy,
    lm_hash: Option<[u8; 16]>,
    nt_hash: Option<[u8; 16]>,
    ntlmv2_hash: Option<[u8; 16]>,
    /// `-F`/`Flags`: manual override of the Type-1 negotiate flags, bypassing
    /// the built-in default set (spec.md §4.2).
    manual_flags: Option<u32>,
    /// Pre-encoded `base64(user:password)` for the `-B`/`NTLMToBasic`
    /// fallback (SPEC_FULL.md supplement). Only ever populated by
    /// [`Self::from_password`] — a credential built from precomputed hashes
    /// has no cleartext password to fall back to Basic with.
    basic_blob: Option<String>,
}

impl Credential {
    /// Build directly from precomputed hashes (the `PassLM`/`PassNT`/
    /// `PassNTLMv2` config options — spec.md §6).
    pub fn from_hashes(
        username: impl Into<String>,
        domain: impl Into<String>,
        workstation: impl Into<String>,
        policy: AuthPolicy,
        lm_hash: Option<[u8; 16]>,
        nt_hash: Option<[u8; 16]>,
        ntlmv2_hash: Option<[u8; 16]>,
        manual_flags: Option<u32>,
    ) -> Self {
        Self {
            username: username.into(),
            domain: domain.into(),
            workstation: workstation.into(),
            policy,
            lm_hash,
            nt_hash,
            ntlmv2_hash,
            manual_flags,
            basic_blob: None,
        }
    }

    /// Derive every hash this policy needs from a cleartext password, then
    /// wipe the password buffer. Mirrors `original_source/main.c`'s startup
    /// sequence: `ntlm_hash_lm_password`/`ntlm_hash_nt_password`/
    /// `ntlm2_hash_password` followed by `memset(cpassword, 0, ...)`.
    pub fn from_password(
        username: impl Into<String>,
        domain: impl Into<String>,
        workstation: impl Into<String>,
        policy: AuthPolicy,
        mut password: String,
        manual_flags: Option<u32>,
    ) -> Self {
        let username = username.into();
        let domain = domain.into();

        let lm = policy.hashlm.then(|| lm_hash(&password));
        let nt = policy.hashnt.then(|| nt_hash(&password));
        let ntlmv2 = policy.hashntlm2.then(|| ntlmv2_key(&password, &username, &domain));
        let basic_blob = policy
            .ntlm_to_basic
            .then(|| base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}")));

        zero_string(&mut password);

        Self {
            username,
            domain,
            workstation: workstation.into(),
            policy,
            lm_hash: lm,
            nt_hash: nt,
            ntlmv2_hash: ntlmv2,
            manual_flags,
            basic_blob,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn workstation(&self) -> &str {
        &self.workstation
    }

    pub fn policy(&self) -> AuthPolicy {
        self.policy
    }

    pub fn manual_flags(&self) -> Option<u32> {
        self.manual_flags
    }

    pub fn lm_hash(&self) -> Option<&[u8; 16]> {
        self.lm_hash.as_ref()
    }

    pub fn nt_hash(&self) -> Option<&[u8; 16]> {
        self.nt_hash.as_ref()
    }

    pub fn ntlmv2_hash(&self) -> Option<&[u8; 16]> {
        self.ntlmv2_hash.as_ref()
    }

    pub fn has_hash(&self, kind: HashKind) -> bool {
        match kind {
            HashKind::Lm => self.lm_hash.is_some(),
            HashKind::Nt => self.nt_hash.is_some(),
            HashKind::NtlmV2 => self.ntlmv2_hash.is_some(),
        }
    }

    /// True if any NTLM hash is available, independent of the Basic fallback
    /// (spec.md §4.3's `passes_any()`, narrowed to the NTLM family only —
    /// used to decide whether the Basic fallback should even be considered).
    pub fn has_any_ntlm_hash(&self) -> bool {
        self.lm_hash.is_some() || self.nt_hash.is_some() || self.ntlmv2_hash.is_some()
    }

    /// `base64(user:password)` for `Proxy-Authorization: Basic`, when the
    /// `-B`/`NTLMToBasic` fallback is configured and a cleartext password
    /// was available at startup.
    pub fn basic_blob(&self) -> Option<&str> {
        self.basic_blob.as_deref()
    }

    /// Aborts early (spec.md §4.3) when no usable secret exists at all,
    /// unless the basic-auth fallback is enabled.
    pub fn passes_any(&self) -> bool {
        self.lm_hash.is_some() || self.nt_hash.is_some() || self.ntlmv2_hash.is_some() || self.policy.ntlm_to_basic
    }

    pub fn require_usable(&self) -> ProxyResult<()> {
        if self.passes_any() {
            Ok(())
        } else {
            Err(proxy_core::ProxyError::fatal(
                "credential has no usable password hash and NTLM-to-basic is disabled",
            ))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Lm,
    Nt,
    NtlmV2,
}

fn zero_string(s: &mut String) {
    // SAFETY: we only overwrite bytes already owned by `s` with other valid
    // ASCII bytes, preserving `s`'s length and UTF-8 validity, before it is
    // dropped.
    unsafe {
        for b in s.as_bytes_mut() {
            *b = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_password_computes_only_the_policy_requested_hashes() {
        let cred = Credential::from_password(
            "alice",
            "CORP",
            "WS01",
            AuthPolicy::ntlmv2(),
            "hunter2".into(),
            None,
        );
        assert!(cred.has_hash(HashKind::NtlmV2));
        assert!(!cred.has_hash(HashKind::Lm));
        assert!(!cred.has_hash(HashKind::Nt));
        assert!(cred.passes_any());
    }

    #[test]
    fn ntlm_to_basic_policy_derives_a_basic_blob_from_the_cleartext_password() {
        let mut policy = AuthPolicy::ntlm();
        policy.ntlm_to_basic = true;
        let cred = Credential::from_password("alice", "CORP", "WS01", policy, "hunter2".into(), None);
        assert_eq!(cred.basic_blob(), Some("YWxpY2U6aHVudGVyMg=="));
    }

    #[test]
    fn credential_with_no_hashes_and_no_basic_fallback_fails_usability_check() {
        let cred = Credential::from_hashes("alice", "CORP", "WS01", AuthPolicy::default(), None, None, None, None);
        assert!(!cred.passes_any());
        assert!(cred.require_usable().is_err());
    }
}
