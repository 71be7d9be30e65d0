//! Errors which may cross the channel boundary.
use std::fmt;

use thiserror::Error;

use super::binding::{ProtectionKind, Protections};
use crate::primitives::Time;

/// Broad classification of a `ProtocolError`.
///
/// Hosts usually only need to distinguish these, for example to log security failures or to
/// retry a transport failure with their own backoff policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The message or its fields were malformed, incomplete or of an unsupported kind.
    Protocol,

    /// The signature did not verify, or required parts were not signed.
    InvalidSignature,

    /// The message was older than the maximum message age, or claimed to be from the future.
    Expired,

    /// The nonce of the message had been seen before.
    Replayed,

    /// The remote party could not be reached.
    Transport,

    /// The local configuration can not provide the required protections.
    Configuration,
}

/// Failure to reach the other party of a direct message.
#[derive(Clone, Debug, Error)]
pub enum TransportError {
    /// The request did not complete in time.
    #[error("the request timed out")]
    Timeout,

    /// The remote host refused the connection.
    #[error("the connection was refused")]
    ConnectionRefused,

    /// The TLS handshake or certificate validation failed.
    #[error("TLS failure: {0}")]
    Tls(String),

    /// The response had a status code that does not carry a protocol message.
    #[error("unexpected HTTP status {0}")]
    Status(u16),

    /// Any other failure of the fetcher.
    #[error("transport failure: {0}")]
    Other(String),
}

/// A message could not be sent or received.
#[derive(Clone, Debug, Error)]
pub enum ProtocolError {
    /// A required field had no value.
    #[error("the {message} message is missing the required field {field}")]
    MissingRequiredField {
        /// Name of the message type.
        message: &'static str,
        /// Wire name of the missing field.
        field: String,
    },

    /// A field value could not be decoded.
    #[error("invalid value of {field}: {reason}")]
    InvalidFieldValue {
        /// Wire name of the field.
        field: String,
        /// Human readable explanation.
        reason: String,
    },

    /// The protocol version or serialization version is not supported.
    #[error("unsupported version {0}")]
    UnsupportedVersion(String),

    /// The association algorithm is not supported.
    #[error("unsupported association type {0}")]
    UnsupportedAlgorithm(String),

    /// The association session type is not supported or does not fit the association type.
    #[error("unsupported session type {0}")]
    UnsupportedSessionType(String),

    /// The secret does not have the length required by the algorithm.
    #[error("secret of {actual} bytes where {expected} were expected")]
    SecretLengthMismatch {
        /// Length required by the algorithm.
        expected: usize,
        /// Length of the provided secret.
        actual: usize,
    },

    /// The payload could not be parsed.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A parameter appeared more than once.
    #[error("duplicate parameter {0}")]
    DuplicateParameter(String),

    /// The signature did not verify.
    #[error("invalid signature")]
    InvalidSignature,

    /// Fields that must be signed were not part of the signature.
    #[error("the fields {0:?} must be signed but are not")]
    UnsignedMandatoryParts(Vec<String>),

    /// The message is older than the maximum message age.
    #[error("the message expired at {expired}, now is {now}")]
    ExpiredMessage {
        /// When the message expired.
        expired: Time,
        /// When the expiration was checked.
        now: Time,
    },

    /// The message claims to have been created in the future.
    #[error("the message claims to be created in the future at {created}")]
    FutureTimestamp {
        /// The claimed creation time.
        created: Time,
    },

    /// The nonce of the message has been used before.
    #[error("the message with nonce {nonce} has already been processed")]
    ReplayedMessage {
        /// The replayed nonce.
        nonce: String,
    },

    /// The nonce was missing or malformed.
    #[error("missing or malformed nonce")]
    InvalidNonce,

    /// The message did not receive all protections it requires.
    #[error("the message requires {required} but only {applied} were applied")]
    Unprotected {
        /// Protections required by the message type.
        required: Protections,
        /// Protections the binding elements applied.
        applied: Protections,
    },

    /// Two binding elements applied the same protection while sending.
    #[error("the {0} protection was applied more than once")]
    DuplicateProtection(ProtectionKind),

    /// The channel is not configured to protect the messages it handles.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A storage primitive failed.
    #[error("a storage primitive failed")]
    Primitive,

    /// The remote party could not be reached.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The remote party answered with a protocol error.
    #[error("the remote party reported an error: {0}")]
    ErrorResponse(String),
}

impl ProtocolError {
    /// The broad classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::InvalidSignature | ProtocolError::UnsignedMandatoryParts(_) => {
                ErrorKind::InvalidSignature
            }
            ProtocolError::ExpiredMessage { .. } | ProtocolError::FutureTimestamp { .. } => {
                ErrorKind::Expired
            }
            ProtocolError::ReplayedMessage { .. } => ErrorKind::Replayed,
            ProtocolError::Transport(_) => ErrorKind::Transport,
            ProtocolError::Unprotected { .. }
            | ProtocolError::DuplicateProtection(_)
            | ProtocolError::Configuration(_) => ErrorKind::Configuration,
            _ => ErrorKind::Protocol,
        }
    }

    /// Signature, expiration and replay failures.
    ///
    /// These are always fatal to the exchange and should be logged by the host.
    pub fn is_security_failure(&self) -> bool {
        match self.kind() {
            ErrorKind::InvalidSignature | ErrorKind::Expired | ErrorKind::Replayed => true,
            _ => false,
        }
    }

    /// Whether repeating the same exchange later may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

impl From<()> for ProtocolError {
    fn from(_: ()) -> Self {
        ProtocolError::Primitive
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ErrorKind::Protocol => "protocol violation",
            ErrorKind::InvalidSignature => "invalid signature",
            ErrorKind::Expired => "expired message",
            ErrorKind::Replayed => "replayed message",
            ErrorKind::Transport => "transport failure",
            ErrorKind::Configuration => "configuration error",
        };
        f.write_str(name)
    }
}
