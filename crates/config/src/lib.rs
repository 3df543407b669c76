//! BDN Configuration Module
//!
//! Protocol constants and shared configuration types for the BDN relay core.
//! Everything on the wire is little-endian.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Magic bytes opening every frame.
pub const STARTING_SEQUENCE: [u8; 4] = [0xFF, 0xFE, 0xFD, 0xFC];

/// Width of the command tag in the frame header (zero-padded ASCII).
pub const COMMAND_LEN: usize = 12;

/// Fixed header size: starting sequence + command + payload length.
pub const HEADER_LEN: usize = 4 + COMMAND_LEN + 4;

/// Trailing control-flag byte expected on every complete frame.
pub const CONTROL_FLAG_VALID: u8 = 0x01;

/// Size of a broadcast content hash in bytes.
pub const CONTENT_HASH_LEN: usize = 32;

/// Size of a node / source identifier in bytes (UUID).
pub const NODE_ID_LEN: usize = 16;

/// Width of the broadcast sub-type tag in bytes.
pub const BROADCAST_TYPE_LEN: usize = 4;

/// Payload ceiling for transaction messages.
pub const MAX_TX_PAYLOAD: usize = 1_048_576; // 1MB

/// Payload ceiling for block-sized broadcast messages.
pub const MAX_BROADCAST_PAYLOAD: usize = 33_554_432; // 32MB

/// Payload ceiling for every other message class.
pub const MAX_DEFAULT_PAYLOAD: usize = 1_048_576; // 1MB

/// Current protocol version spoken by this node.
pub const PROTOCOL_VERSION: u32 = 3;

/// Oldest protocol version still accepted from peers.
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Version assumed for a peer whose hello predates the version field.
pub const LEGACY_PROTOCOL_VERSION: u32 = 1;

/// Byte offset of the protocol version inside a hello payload.
pub const HELLO_VERSION_OFFSET: usize = 0;

/// Consecutive bad messages tolerated before a connection is closed.
pub const MAX_BAD_MESSAGES: u32 = 3;

/// Interval between keepalive pings on connections that ping.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long a queued outbound batch may be held before it is flushed.
pub const OUTPUT_FLUSH_HOLD: Duration = Duration::from_millis(50);

/// Batch size above which queued outbound bytes are flushed immediately.
pub const OUTPUT_FLUSH_THRESHOLD: usize = 8_192;

/// Maximum reconnect attempts per remote address.
pub const MAX_CONNECT_RETRIES: u32 = 10;

/// Base delay for the reconnect backoff schedule.
pub const CONNECT_RETRY_BASE: Duration = Duration::from_secs(1);

/// Backoff ceiling for reconnect attempts.
pub const CONNECT_RETRY_CAP: Duration = Duration::from_secs(60);

/// Network on which a node participates. Frames from a different network
/// number are a protocol violation.
pub type NetworkNum = u32;

/// Node deployment flavor, selecting default connection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum NodeModel {
    /// Relay servers inside the distribution network.
    #[default]
    Relay,
    /// Gateways bridging blockchain nodes into the network.
    Gateway,
}
