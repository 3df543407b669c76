//! Peer-to-peer connection layer.
//!
//! [`Connection`] holds the per-peer state machine and buffers,
//! [`ConnectionProtocol`] selects the message handler table for the
//! node's role, and [`P2pNode`] runs the socket tasks and the central
//! event loop that owns all connection state.

pub mod config;
pub mod connection;
pub mod events;
pub mod node;
pub mod protocol;

pub use config::NetworkConfig;
pub use connection::{Connection, ConnectionStatus, ConnectionType, ProcessOutcome};
pub use events::{NetEvent, NodeCommand};
pub use node::{NodeHandle, P2pNode};
pub use protocol::{protocol_for_model, ConnectionProtocol, MessageHandlers};
