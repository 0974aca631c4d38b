//! Error types for the `hub` crate.
//!
//! Follows the same shape as the other workspace error types: a root `Error` struct
//! holding an `error_kind` tree and an optional `source` for chaining.

use std::error::Error as StdError;
use std::fmt;

pub type Result<T> = core::result::Result<T, Error>;

/// Top-level error type for the hub.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

/// Major categories of errors in the hub.
#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    /// The client transport could not be upgraded to a duplex stream.
    Upgrade,
    Transport(TransportErrorKind),
    /// A connection id was registered twice.
    DuplicateId,
    Relay(RelayErrorKind),
    Hub(HubErrorKind),
}

/// Failures on an established client connection. Always fatal to that connection.
#[derive(Debug, PartialEq)]
pub enum TransportErrorKind {
    Read,
    Write,
    Deadline,
    Protocol,
    Closed,
}

/// Failures talking to the relay bus. Never fatal to local fan-out.
#[derive(Debug, PartialEq)]
pub enum RelayErrorKind {
    Connect,
    Publish,
    Decode,
    Subscribe,
    Closed,
}

/// Lifecycle errors of the hub itself.
#[derive(Debug, PartialEq)]
pub enum HubErrorKind {
    AlreadyStarted,
    NotRunning,
    ShutdownTimeout,
}

impl Error {
    pub fn new(error_kind: ErrorKind) -> Self {
        Self {
            source: None,
            error_kind,
        }
    }

    pub fn with_source<E>(error_kind: ErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Self {
            source: Some(source.into()),
            error_kind,
        }
    }

    pub fn transport(kind: TransportErrorKind) -> Self {
        Self::new(ErrorKind::Transport(kind))
    }

    pub fn relay(kind: RelayErrorKind) -> Self {
        Self::new(ErrorKind::Relay(kind))
    }

    pub fn hub(kind: HubErrorKind) -> Self {
        Self::new(ErrorKind::Hub(kind))
    }

    pub fn is_shutdown_timeout(&self) -> bool {
        self.error_kind == ErrorKind::Hub(HubErrorKind::ShutdownTimeout)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error_kind {
            ErrorKind::Upgrade => write!(f, "Upgrade error")?,
            ErrorKind::Transport(kind) => write!(f, "Transport error: {:?}", kind)?,
            ErrorKind::DuplicateId => write!(f, "Duplicate connection id")?,
            ErrorKind::Relay(kind) => write!(f, "Relay error: {:?}", kind)?,
            ErrorKind::Hub(kind) => write!(f, "Hub error: {:?}", kind)?,
        }
        if let Some(source) = &self.source {
            write!(f, " ({source})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::with_source(ErrorKind::Relay(RelayErrorKind::Decode), err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_source() {
        let err = Error::with_source(
            ErrorKind::Transport(TransportErrorKind::Write),
            "broken pipe",
        );
        assert_eq!(err.to_string(), "Transport error: Write (broken pipe)");
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn shutdown_timeout_is_recognized() {
        assert!(Error::hub(HubErrorKind::ShutdownTimeout).is_shutdown_timeout());
        assert!(!Error::hub(HubErrorKind::NotRunning).is_shutdown_timeout());
    }
}
