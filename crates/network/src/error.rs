//! Network error taxonomy.
//!
//! Failures fall into classes with different blast radii: transient
//! socket conditions stay inside the event loop, malformed frames are
//! local to one connection, protocol violations close the connection
//! outright, and converter registration problems are configuration
//! errors surfaced at startup.

use std::net::SocketAddr;

use crate::messages::MessageCommand;

/// Network-related errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    /// The peer closed the connection in an orderly fashion.
    #[error("peer closed the connection")]
    PeerClosed,

    /// A frame failed validation before any parse was attempted. The
    /// frame boundary is known, so exactly its bytes can be dropped.
    #[error("frame validation failed: {reason}")]
    ValidationFailed {
        /// Description of the failed check.
        reason: String,
    },

    /// A frame parsed structurally but was semantically invalid. Kept
    /// distinct from [`NetworkError::ValidationFailed`]; the two are
    /// never collapsed.
    #[error("message rejected after parse: {reason}")]
    ParseRejected {
        /// Description of the rejection.
        reason: String,
    },

    /// A malformed frame whose boundary cannot be determined. The
    /// connection must close without draining further bytes.
    #[error("unrecoverable frame: {reason}")]
    UnrecoverableFrame {
        /// Description of the corruption.
        reason: String,
    },

    /// Protocol violation by a peer. Closes the connection immediately
    /// and does not count against the bad-message threshold.
    #[error("protocol violation from {peer}: {violation}")]
    ProtocolViolation {
        /// The peer that violated the protocol.
        peer: SocketAddr,
        /// Description of the violation.
        violation: String,
    },

    /// The peer negotiated a protocol version this node cannot speak.
    #[error("unsupported protocol version {version}")]
    UnsupportedVersion {
        /// The offered version.
        version: u32,
    },

    /// A second connection was added for an already-registered peer
    /// address. Programming error on the caller's side.
    #[error("duplicate connection for {ip}:{port}")]
    DuplicateConnection {
        /// Peer IP address.
        ip: std::net::IpAddr,
        /// Peer port.
        port: u16,
    },

    /// A converter or handler table was mis-registered. Raised eagerly
    /// at construction, never at traffic time.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Conversion requested for a (version, command) pair outside the
    /// registered table.
    #[error("no converter for version {version} command {command}")]
    NoConverter {
        /// Requested older version.
        version: u32,
        /// Message command.
        command: MessageCommand,
    },

    /// Socket-level connection failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// An operation timed out.
    #[error("network timeout")]
    Timeout,

    /// Underlying serialization failure.
    #[error(transparent)]
    Io(#[from] bdn_io::IoError),
}

impl NetworkError {
    /// Whether this error counts against the consecutive-bad-message
    /// counter (frame boundary known, connection continues until the
    /// threshold is reached).
    pub fn is_recoverable_bad_message(&self) -> bool {
        matches!(
            self,
            NetworkError::ValidationFailed { .. }
                | NetworkError::ParseRejected { .. }
                | NetworkError::Io(_)
        )
    }

    /// Whether this error forces an immediate close.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            NetworkError::UnrecoverableFrame { .. }
                | NetworkError::ProtocolViolation { .. }
                | NetworkError::UnsupportedVersion { .. }
                | NetworkError::PeerClosed
        )
    }
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_classes_stay_distinct() {
        let validation = NetworkError::ValidationFailed {
            reason: "bad control flag".into(),
        };
        let semantic = NetworkError::ParseRejected {
            reason: "network number mismatch".into(),
        };
        assert_ne!(validation, semantic);
        assert!(validation.is_recoverable_bad_message());
        assert!(semantic.is_recoverable_bad_message());
        assert!(!validation.closes_connection());
    }

    #[test]
    fn test_unrecoverable_closes() {
        let err = NetworkError::UnrecoverableFrame {
            reason: "bad magic".into(),
        };
        assert!(err.closes_connection());
        assert!(!err.is_recoverable_bad_message());
    }
}
