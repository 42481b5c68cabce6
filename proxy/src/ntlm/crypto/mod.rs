pub mod des;
pub mod hash;
pub mod ntlmv2;
