//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for MemRep.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MemRepError(pub String);

impl MemRepError {
    /// Creates an error from anything printable.
    pub fn msg(m: impl ToString) -> Self {
        MemRepError(m.to_string())
    }
}

impl fmt::Display for MemRepError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for MemRepError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `MemRepError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for MemRepError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                MemRepError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);
impl_from_error!(tokio::task::JoinError);

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for MemRepError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        MemRepError(e.to_string())
    }
}

impl<T> From<tokio::sync::watch::error::SendError<T>> for MemRepError {
    fn from(e: tokio::sync::watch::error::SendError<T>) -> Self {
        MemRepError(e.to_string())
    }
}
