//! Error types for fleet dispatch and connection negotiation.
//!
//! Per-device failures are never raised across the dispatcher boundary; they
//! are classified into a [`FailureKind`] and carried as data inside the
//! device's session record. Only malformed input aborts a dispatch.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Errors that can occur while negotiating or driving a device session.
#[derive(Error, Debug)]
pub enum DialError {
    /// Dialect autodetection could not identify the device.
    ///
    /// Raised on an ambiguous or unsupported banner, or when probing ends
    /// before a known dialect signature is seen. Recovered by the fixed
    /// dialect fallback unless every fallback also fails.
    #[error("dialect detection failed: {0}")]
    DialectDetection(String),

    /// The device refused the transport connection.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// The transport connection was reset or closed mid-handshake.
    #[error("connection reset: {0}")]
    ConnectionReset(String),

    /// The transport connection attempt timed out.
    #[error("connection timed out: {0}")]
    ConnectionTimeout(String),

    /// The device rejected the supplied credentials.
    #[error("authentication rejected: {0}")]
    Authentication(String),

    /// Login succeeded but the device rejected the operational command.
    #[error("command rejected by device: {0}")]
    Authorization(String),

    /// Any other protocol-level failure during connect or negotiation.
    #[error("protocol failure: {0}")]
    Protocol(String),

    /// The shell channel was disconnected while waiting for output.
    #[error("channel disconnected while waiting for output")]
    ChannelDisconnect,

    /// Command execution timed out.
    ///
    /// Contains the partial output received before the timeout.
    #[error("command timed out: {0}")]
    ExecTimeout(String),

    /// Transport parameters were rejected before any connection attempt.
    #[error("invalid transport parameters: {0}")]
    InvalidParams(String),

    /// The session has already been closed or was never established.
    #[error("session is not open")]
    SessionClosed,
}

impl DialError {
    /// True for failures of the dialect-identification class.
    pub fn is_detection(&self) -> bool {
        matches!(self, DialError::DialectDetection(_))
    }

    /// True when the device rejected the supplied credentials.
    pub fn is_authentication(&self) -> bool {
        matches!(self, DialError::Authentication(_))
    }

    /// True for the failure class the fixed-dialect probe retries.
    ///
    /// Covers detection ambiguity and generic protocol failures; transport
    /// and credential failures escalate instead of retrying.
    pub fn is_dialect_retryable(&self) -> bool {
        matches!(
            self,
            DialError::DialectDetection(_) | DialError::Protocol(_)
        )
    }

    /// Terminal classification carried in the device session record.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            DialError::DialectDetection(_) => FailureKind::DialectDetection,
            DialError::ConnectionRefused(_) => FailureKind::ConnectionRefused,
            DialError::ConnectionReset(_) | DialError::ChannelDisconnect => {
                FailureKind::ConnectionReset
            }
            DialError::ConnectionTimeout(_) | DialError::ExecTimeout(_) => FailureKind::Timeout,
            DialError::Authentication(_) => FailureKind::Authentication,
            DialError::Authorization(_) => FailureKind::Authorization,
            DialError::Protocol(_)
            | DialError::InvalidParams(_)
            | DialError::SessionClosed => FailureKind::Protocol,
        }
    }
}

/// Classifies an I/O error from a transport connect or read/write.
pub(crate) fn classify_io(err: &io::Error, context: &str) -> DialError {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => {
            DialError::ConnectionRefused(format!("{context}: {err}"))
        }
        io::ErrorKind::TimedOut => DialError::ConnectionTimeout(format!("{context}: {err}")),
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => DialError::ConnectionReset(format!("{context}: {err}")),
        _ => DialError::Protocol(format!("{context}: {err}")),
    }
}

/// Classifies an SSH client error into the negotiation taxonomy.
pub(crate) fn classify_ssh(err: async_ssh2_tokio::Error, context: &str) -> DialError {
    use async_ssh2_tokio::Error as SshError;
    match err {
        SshError::PasswordWrong => {
            DialError::Authentication(format!("{context}: password rejected"))
        }
        SshError::KeyAuthFailed => {
            DialError::Authentication(format!("{context}: key authentication failed"))
        }
        SshError::AddressInvalid(ioe) => classify_io(&ioe, context),
        SshError::SshError(russh::Error::IO(ioe)) => classify_io(&ioe, context),
        other => DialError::Protocol(format!("{context}: {other}")),
    }
}

impl From<russh::Error> for DialError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::IO(ioe) => classify_io(&ioe, "ssh channel"),
            other => DialError::Protocol(format!("ssh channel: {other}")),
        }
    }
}

impl From<async_ssh2_tokio::Error> for DialError {
    fn from(err: async_ssh2_tokio::Error) -> Self {
        classify_ssh(err, "ssh channel")
    }
}

/// Errors raised by the dispatcher before any worker starts.
///
/// These are the only errors that abort a whole dispatch; everything that
/// happens after work begins is captured per device instead.
#[derive(Error, Debug)]
pub enum FleetError {
    /// The target list was empty or absent.
    #[error("no target addresses provided")]
    EmptyTargetList,

    /// A required credential field was missing or blank.
    #[error("missing required credential: {0}")]
    MissingCredential(&'static str),
}

/// Terminal failure classification for one device, carried as data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No terminal failure recorded.
    #[default]
    None,
    /// All dialect fallbacks failed to identify the device.
    DialectDetection,
    /// Transport connection refused on every fallback.
    ConnectionRefused,
    /// Transport connection reset or channel lost on every fallback.
    ConnectionReset,
    /// Connect or command round-trip timed out on every fallback.
    Timeout,
    /// Credentials rejected on the final fallback.
    Authentication,
    /// Login accepted but command execution rejected.
    Authorization,
    /// Unclassified protocol failure on the final fallback.
    Protocol,
    /// The caller-supplied operation returned an error.
    Operation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_classify_by_kind() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            classify_io(&refused, "t"),
            DialError::ConnectionRefused(_)
        ));

        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert!(matches!(
            classify_io(&timed_out, "t"),
            DialError::ConnectionTimeout(_)
        ));

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(
            classify_io(&reset, "t"),
            DialError::ConnectionReset(_)
        ));

        let other = io::Error::other("weird");
        assert!(matches!(classify_io(&other, "t"), DialError::Protocol(_)));
    }

    #[test]
    fn failure_kind_maps_every_variant() {
        assert_eq!(
            DialError::Authentication("x".into()).failure_kind(),
            FailureKind::Authentication
        );
        assert_eq!(
            DialError::Authorization("x".into()).failure_kind(),
            FailureKind::Authorization
        );
        assert_eq!(
            DialError::ChannelDisconnect.failure_kind(),
            FailureKind::ConnectionReset
        );
        assert_eq!(
            DialError::ExecTimeout("partial".into()).failure_kind(),
            FailureKind::Timeout
        );
        assert_eq!(
            DialError::DialectDetection("banner".into()).failure_kind(),
            FailureKind::DialectDetection
        );
    }

    #[test]
    fn dialect_retry_covers_detection_and_protocol_class_only() {
        assert!(DialError::DialectDetection("x".into()).is_dialect_retryable());
        assert!(DialError::Protocol("x".into()).is_dialect_retryable());
        assert!(!DialError::Authentication("x".into()).is_dialect_retryable());
        assert!(!DialError::ConnectionTimeout("x".into()).is_dialect_retryable());
    }
}
