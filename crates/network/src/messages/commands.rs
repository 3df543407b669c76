//! Message command definitions.

use std::fmt;

use serde::{Deserialize, Serialize};

use bdn_config::{COMMAND_LEN, MAX_BROADCAST_PAYLOAD, MAX_DEFAULT_PAYLOAD, MAX_TX_PAYLOAD};

/// Network message command (12 bytes, zero-padded ASCII).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageCommand([u8; COMMAND_LEN]);

impl MessageCommand {
    /// Handshake opener carrying version, network number and node id.
    pub const HELLO: MessageCommand = MessageCommand(*b"hello\0\0\0\0\0\0\0");
    /// Handshake acknowledgment.
    pub const ACK: MessageCommand = MessageCommand(*b"ack\0\0\0\0\0\0\0\0\0");
    /// Keepalive probe.
    pub const PING: MessageCommand = MessageCommand(*b"ping\0\0\0\0\0\0\0\0");
    /// Keepalive reply.
    pub const PONG: MessageCommand = MessageCommand(*b"pong\0\0\0\0\0\0\0\0");
    /// Block-sized content broadcast with a routing header.
    pub const BROADCAST: MessageCommand = MessageCommand(*b"broadcast\0\0\0");
    /// Single-transaction relay.
    pub const TX: MessageCommand = MessageCommand(*b"tx\0\0\0\0\0\0\0\0\0\0");
    /// Orderly disconnect notice.
    pub const DISCONNECT: MessageCommand = MessageCommand(*b"disconnect\0\0");

    /// Every command in the protocol's set, in wire-introduction order.
    pub const KNOWN: [MessageCommand; 7] = [
        Self::HELLO,
        Self::ACK,
        Self::PING,
        Self::PONG,
        Self::BROADCAST,
        Self::TX,
        Self::DISCONNECT,
    ];

    /// Builds a command from raw header bytes. Unknown tags are carried
    /// as-is and rejected at construction time, not here.
    pub fn from_bytes(bytes: [u8; COMMAND_LEN]) -> Self {
        Self(bytes)
    }

    /// Gets the raw bytes of the command.
    pub fn as_bytes(&self) -> &[u8; COMMAND_LEN] {
        &self.0
    }

    /// Whether this tag belongs to the protocol's command set.
    pub fn is_known(&self) -> bool {
        Self::KNOWN.contains(self)
    }

    /// Whether this command is part of the handshake exchange.
    pub fn is_handshake(&self) -> bool {
        matches!(*self, Self::HELLO | Self::ACK)
    }

    /// Payload ceiling for this command's message class. Transaction
    /// and block-sized broadcast messages have their own ceilings.
    pub fn max_payload(&self) -> usize {
        match *self {
            Self::BROADCAST => MAX_BROADCAST_PAYLOAD,
            Self::TX => MAX_TX_PAYLOAD,
            _ => MAX_DEFAULT_PAYLOAD,
        }
    }

    /// The tag as a string, trimmed of padding.
    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(COMMAND_LEN);
        std::str::from_utf8(&self.0[..end]).unwrap_or("<non-ascii>")
    }
}

impl fmt::Display for MessageCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for MessageCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageCommand({})", self.as_str())
    }
}
