pub mod config;
pub mod credential;
pub mod forwarder;
pub mod http;
pub mod ntlm;
pub mod pac;
pub mod pool;
pub mod server;
pub mod socks5;
pub mod tunnel;
pub mod upstream;

pub use proxy_core::{ProxyError, ProxyResult};
