// src/error.rs
//
// Typed error surface for the supervisor core. Each variant maps to one of
// the RPC error kinds from the control-RPC design: NOT_FOUND, ALREADY_EXISTS,
// INVALID, IO, UNAVAILABLE, INTERNAL. `code()` is the small numeric code sent
// back over the wire.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Small stable numeric code handed to RPC clients.
    pub fn code(&self) -> i32 {
        match self {
            Error::NotFound(_) => 1,
            Error::AlreadyExists(_) => 2,
            Error::Invalid(_) => 3,
            Error::Io(_) => 4,
            Error::Unavailable(_) => 5,
            Error::Internal(_) => 6,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Invalid(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::NotFound("x".into()).code(), 1);
        assert_eq!(Error::AlreadyExists("x".into()).code(), 2);
        assert_eq!(Error::Invalid("x".into()).code(), 3);
        assert_eq!(Error::Io("x".into()).code(), 4);
        assert_eq!(Error::Unavailable("x".into()).code(), 5);
        assert_eq!(Error::Internal("x".into()).code(), 6);
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
