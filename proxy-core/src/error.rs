use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;

/// Top-level error type shared by every component (C1-C10). Each variant wraps
/// a small kind-specific struct so call sites can match on the error family
/// (`transport`, `http-malformed`, ...) from spec.md §7 without losing detail.
#[derive(Debug)]
pub enum ProxyError {
    Transport(TransportError),
    HttpMalformed(HttpMalformedError),
    NtlmBadChallenge(NtlmError),
    AuthDenied(AuthDeniedError),
    PolicyDenied(PolicyDeniedError),
    UpstreamExhausted(UpstreamExhaustedError),
    ProtocolViolation(ProtocolViolationError),
    Fatal(FatalError),
}

impl ProxyError {
    pub fn transport<T: Into<TransportError>>(error: T) -> Self {
        Self::Transport(error.into())
    }

    pub fn http_malformed<T: Into<String>>(message: T) -> Self {
        Self::HttpMalformed(HttpMalformedError { message: message.into() })
    }

    pub fn ntlm_bad_challenge<T: Into<String>>(message: T) -> Self {
        Self::NtlmBadChallenge(NtlmError { message: message.into() })
    }

    pub fn auth_denied<T: Into<String>>(message: T) -> Self {
        Self::AuthDenied(AuthDeniedError { message: message.into() })
    }

    pub fn policy_denied<T: Into<String>>(message: T) -> Self {
        Self::PolicyDenied(PolicyDeniedError { message: message.into() })
    }

    pub fn upstream_exhausted<T: Into<String>>(message: T) -> Self {
        Self::UpstreamExhausted(UpstreamExhaustedError { message: message.into() })
    }

    pub fn protocol_violation<T: Into<String>>(message: T) -> Self {
        Self::ProtocolViolation(ProtocolViolationError { message: message.into() })
    }

    pub fn fatal<T: Into<String>>(message: T) -> Self {
        Self::Fatal(FatalError { message: message.into() })
    }

    /// True for errors that occurred before any client byte was relayed, and
    /// so are safe to retry against the next upstream (spec.md §4.5 failover rule).
    pub fn is_pre_relay_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::UpstreamExhausted(_))
    }
}

impl From<io::Error> for ProxyError {
    fn from(value: io::Error) -> Self {
        Self::Transport(TransportError { error: value })
    }
}

#[derive(Debug)]
pub struct TransportError {
    error: io::Error,
}

impl From<io::Error> for TransportError {
    fn from(value: io::Error) -> Self {
        Self { error: value }
    }
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "transport error: {}", self.error)
    }
}

#[derive(Debug)]
pub struct HttpMalformedError {
    message: String,
}

impl Display for HttpMalformedError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed HTTP message: {}", self.message)
    }
}

#[derive(Debug)]
pub struct NtlmError {
    message: String,
}

impl Display for NtlmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "bad NTLM challenge: {}", self.message)
    }
}

#[derive(Debug)]
pub struct AuthDeniedError {
    message: String,
}

impl Display for AuthDeniedError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "upstream denied authentication: {}", self.message)
    }
}

#[derive(Debug)]
pub struct PolicyDeniedError {
    message: String,
}

impl Display for PolicyDeniedError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "policy denied: {}", self.message)
    }
}

#[derive(Debug)]
pub struct UpstreamExhaustedError {
    message: String,
}

impl Display for UpstreamExhaustedError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "all upstreams failed: {}", self.message)
    }
}

#[derive(Debug)]
pub struct ProtocolViolationError {
    message: String,
}

impl Display for ProtocolViolationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "protocol violation: {}", self.message)
    }
}

#[derive(Debug)]
pub struct FatalError {
    message: String,
}

impl Display for FatalError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "fatal: {}", self.message)
    }
}

impl Display for ProxyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(x) => write!(f, "{}", x),
            Self::HttpMalformed(x) => write!(f, "{}", x),
            Self::NtlmBadChallenge(x) => write!(f, "{}", x),
            Self::AuthDenied(x) => write!(f, "{}", x),
            Self::PolicyDenied(x) => write!(f, "{}", x),
            Self::UpstreamExhausted(x) => write!(f, "{}", x),
            Self::ProtocolViolation(x) => write!(f, "{}", x),
            Self::Fatal(x) => write!(f, "{}", x),
        }
    }
}

impl Error for ProxyError {}
