use std::io;

/// Faults that abort startup or a single connection.
///
/// HTTP-level failures never travel through this type; they are carried as
/// status codes into the error-response pipeline instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("io operation failed")]
    Io(#[from] io::Error),
    #[error("no configured server matches address {0}:{1}")]
    NoServer(String, String),
}

pub type Result<T> = std::result::Result<T, Error>;
