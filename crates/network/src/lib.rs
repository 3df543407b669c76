//! BDN network core.
//!
//! The connection and protocol substrate of a BDN relay node: framed
//! binary wire protocol, per-peer handshake state machine, versioned
//! message conversion, the connection registry, the timer/retry
//! scheduler, and the socket event loop that drives them.
//!
//! The implementation is split into modules along those seams:
//! - messages: wire header, commands, payload codecs, message factory
//! - version: protocol negotiation and cross-version converters
//! - p2p: connection state machine, peer-kind protocols, event loop
//! - pool: multi-index connection registry
//! - alarm: timer heap with dedup scheduling
//! - validator: frame validation capability
//! - services: collaborator interfaces consumed by the core

pub mod alarm;
pub mod error;
pub mod messages;
pub mod p2p;
pub mod pool;
pub mod services;
pub mod validator;
pub mod version;

pub use alarm::{AlarmId, AlarmQueue};
pub use error::{NetworkError, NetworkResult};
pub use messages::{
    BroadcastPayload, HeaderPreview, HelloPayload, Message, MessageCommand, MessageFactory,
};
pub use p2p::{
    Connection, ConnectionStatus, ConnectionType, NetworkConfig, NodeHandle, P2pNode,
};
pub use pool::{ConnectionHandle, ConnectionPool};
pub use validator::{DefaultMessageValidator, MessageValidator};
pub use version::VersionManager;
