//! Message payload structures.
//!
//! Payload codecs serialize the current protocol version's layout;
//! frames from older peers are transcoded by the version converters
//! before they reach these codecs.

use uuid::Uuid;

use bdn_config::{NetworkNum, PROTOCOL_VERSION};
use bdn_io::{BinaryWriter, IoResult, MemoryReader, Serializable};

use crate::messages::MessageCommand;

/// Handshake opener: protocol version, network number and node id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloPayload {
    /// Protocol version the sender speaks.
    pub protocol_version: u32,
    /// Network the sender participates in.
    pub network_num: NetworkNum,
    /// Sender's node identifier.
    pub node_id: Uuid,
    /// The sender's real listening port, for inbound-connection port
    /// correction.
    pub listen_port: u16,
}

impl HelloPayload {
    /// Builds a hello for the current protocol version.
    pub fn new(network_num: NetworkNum, node_id: Uuid, listen_port: u16) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            network_num,
            node_id,
            listen_port,
        }
    }
}

impl Serializable for HelloPayload {
    fn size(&self) -> usize {
        4 + 4 + 16 + 2
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_u32(self.protocol_version);
        writer.write_u32(self.network_num);
        writer.write_bytes(self.node_id.as_bytes());
        writer.write_u16(self.listen_port);
        Ok(())
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            protocol_version: reader.read_u32()?,
            network_num: reader.read_u32()?,
            node_id: Uuid::from_bytes(reader.read_array::<16>()?),
            listen_port: reader.read_u16()?,
        })
    }
}

/// Handshake acknowledgment. Carries no fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckPayload;

impl Serializable for AckPayload {
    fn size(&self) -> usize {
        0
    }

    fn serialize(&self, _writer: &mut BinaryWriter) -> IoResult<()> {
        Ok(())
    }

    fn deserialize(_reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self)
    }
}

/// Keepalive probe with a nonce echoed back by the pong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingPayload {
    /// Random nonce matching the probe to its reply.
    pub nonce: u64,
}

impl Serializable for PingPayload {
    fn size(&self) -> usize {
        8
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_u64(self.nonce);
        Ok(())
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            nonce: reader.read_u64()?,
        })
    }
}

/// Keepalive reply echoing the probe's nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PongPayload {
    /// Nonce of the ping being answered.
    pub nonce: u64,
}

impl Serializable for PongPayload {
    fn size(&self) -> usize {
        8
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_u64(self.nonce);
        Ok(())
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            nonce: reader.read_u64()?,
        })
    }
}

/// Block-sized content broadcast with the routing header up front so
/// relays can route before the content has fully arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastPayload {
    /// Hash of the broadcast content.
    pub content_hash: [u8; 32],
    /// Network the content belongs to.
    pub network_num: NetworkNum,
    /// Identifier of the node that injected the content.
    pub source_id: Uuid,
    /// Broadcast sub-type tag.
    pub broadcast_type: [u8; 4],
    /// Opaque content bytes.
    pub content: Vec<u8>,
}

impl Serializable for BroadcastPayload {
    fn size(&self) -> usize {
        32 + 4 + 16 + 4 + self.content.len()
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_bytes(&self.content_hash);
        writer.write_u32(self.network_num);
        writer.write_bytes(self.source_id.as_bytes());
        writer.write_bytes(&self.broadcast_type);
        writer.write_bytes(&self.content);
        Ok(())
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            content_hash: reader.read_array::<32>()?,
            network_num: reader.read_u32()?,
            source_id: Uuid::from_bytes(reader.read_array::<16>()?),
            broadcast_type: reader.read_array::<4>()?,
            content: reader.read_to_end(),
        })
    }
}

/// Single-transaction relay message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxPayload {
    /// Transaction hash.
    pub tx_hash: [u8; 32],
    /// Network the transaction belongs to.
    pub network_num: NetworkNum,
    /// Identifier of the node that injected the transaction.
    pub source_id: Uuid,
    /// Opaque transaction bytes.
    pub content: Vec<u8>,
}

impl Serializable for TxPayload {
    fn size(&self) -> usize {
        32 + 4 + 16 + self.content.len()
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_bytes(&self.tx_hash);
        writer.write_u32(self.network_num);
        writer.write_bytes(self.source_id.as_bytes());
        writer.write_bytes(&self.content);
        Ok(())
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            tx_hash: reader.read_array::<32>()?,
            network_num: reader.read_u32()?,
            source_id: Uuid::from_bytes(reader.read_array::<16>()?),
            content: reader.read_to_end(),
        })
    }
}

/// Orderly disconnect notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectPayload {
    /// Whether the receiver should skip its reconnection policy.
    pub do_not_retry: bool,
}

impl Serializable for DisconnectPayload {
    fn size(&self) -> usize {
        1
    }

    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        writer.write_u8(self.do_not_retry as u8);
        Ok(())
    }

    fn deserialize(reader: &mut MemoryReader) -> IoResult<Self> {
        Ok(Self {
            do_not_retry: reader.read_u8()? != 0,
        })
    }
}

/// A parsed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake opener.
    Hello(HelloPayload),
    /// Handshake acknowledgment.
    Ack(AckPayload),
    /// Keepalive probe.
    Ping(PingPayload),
    /// Keepalive reply.
    Pong(PongPayload),
    /// Content broadcast.
    Broadcast(BroadcastPayload),
    /// Transaction relay.
    Tx(TxPayload),
    /// Orderly disconnect.
    Disconnect(DisconnectPayload),
}

impl Message {
    /// The wire command for this message.
    pub fn command(&self) -> MessageCommand {
        match self {
            Message::Hello(_) => MessageCommand::HELLO,
            Message::Ack(_) => MessageCommand::ACK,
            Message::Ping(_) => MessageCommand::PING,
            Message::Pong(_) => MessageCommand::PONG,
            Message::Broadcast(_) => MessageCommand::BROADCAST,
            Message::Tx(_) => MessageCommand::TX,
            Message::Disconnect(_) => MessageCommand::DISCONNECT,
        }
    }

    /// Serialized payload size, excluding the control flag.
    pub fn payload_size(&self) -> usize {
        match self {
            Message::Hello(payload) => payload.size(),
            Message::Ack(payload) => payload.size(),
            Message::Ping(payload) => payload.size(),
            Message::Pong(payload) => payload.size(),
            Message::Broadcast(payload) => payload.size(),
            Message::Tx(payload) => payload.size(),
            Message::Disconnect(payload) => payload.size(),
        }
    }

    /// Serializes the payload, excluding the control flag.
    pub fn serialize_payload(&self, writer: &mut BinaryWriter) -> IoResult<()> {
        match self {
            Message::Hello(payload) => payload.serialize(writer),
            Message::Ack(payload) => payload.serialize(writer),
            Message::Ping(payload) => payload.serialize(writer),
            Message::Pong(payload) => payload.serialize(writer),
            Message::Broadcast(payload) => payload.serialize(writer),
            Message::Tx(payload) => payload.serialize(writer),
            Message::Disconnect(payload) => payload.serialize(writer),
        }
    }
}
