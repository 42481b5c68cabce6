pub mod byte_helper;
pub mod containers;
pub mod error;

pub use error::ProxyError;

pub type ProxyResult<T> = Result<T, ProxyError>;
