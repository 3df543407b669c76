//! Message factory.
//!
//! Builds typed messages from completed frames and serializes messages
//! back into frames. Dispatch is a closed table over the command set;
//! unknown commands are a parse failure, never a panic. The factory is
//! an explicit dependency handed to each connection, not a global.

use bytes::Bytes;

use bdn_config::{CONTROL_FLAG_VALID, HEADER_LEN};
use bdn_io::{BinaryWriter, MemoryReader, Serializable};

use crate::error::{NetworkError, NetworkResult};
use crate::messages::header::encode_header;
use crate::messages::payloads::{
    AckPayload, BroadcastPayload, DisconnectPayload, HelloPayload, Message, PingPayload,
    PongPayload, TxPayload,
};
use crate::messages::MessageCommand;

/// Constructs and serializes protocol messages.
#[derive(Debug, Default, Clone)]
pub struct MessageFactory;

impl MessageFactory {
    /// Creates a message factory.
    pub fn new() -> Self {
        Self
    }

    /// Builds a message from a command tag and its payload bytes (the
    /// control flag already stripped).
    pub fn build(&self, command: MessageCommand, payload: &[u8]) -> NetworkResult<Message> {
        let mut reader = MemoryReader::new(payload);
        let message = match command {
            MessageCommand::HELLO => Message::Hello(HelloPayload::deserialize(&mut reader)?),
            MessageCommand::ACK => Message::Ack(AckPayload::deserialize(&mut reader)?),
            MessageCommand::PING => Message::Ping(PingPayload::deserialize(&mut reader)?),
            MessageCommand::PONG => Message::Pong(PongPayload::deserialize(&mut reader)?),
            MessageCommand::BROADCAST => {
                Message::Broadcast(BroadcastPayload::deserialize(&mut reader)?)
            }
            MessageCommand::TX => Message::Tx(TxPayload::deserialize(&mut reader)?),
            MessageCommand::DISCONNECT => {
                Message::Disconnect(DisconnectPayload::deserialize(&mut reader)?)
            }
            unknown => {
                return Err(NetworkError::ParseRejected {
                    reason: format!("unknown command {:?}", unknown.as_bytes()),
                })
            }
        };
        Ok(message)
    }

    /// Builds a message from a complete frame (header + payload +
    /// control flag), as popped from an input buffer.
    pub fn decode_frame(&self, frame: &[u8]) -> NetworkResult<Message> {
        if frame.len() < HEADER_LEN + 1 {
            return Err(NetworkError::ValidationFailed {
                reason: format!("frame too short: {} bytes", frame.len()),
            });
        }
        let mut command_bytes = [0u8; bdn_config::COMMAND_LEN];
        command_bytes.copy_from_slice(&frame[4..4 + bdn_config::COMMAND_LEN]);
        let command = MessageCommand::from_bytes(command_bytes);

        // Everything between the header and the trailing control flag.
        let payload = &frame[HEADER_LEN..frame.len() - 1];
        self.build(command, payload)
    }

    /// Serializes a message into a complete wire frame.
    pub fn encode(&self, message: &Message) -> NetworkResult<Bytes> {
        let payload_size = message.payload_size();
        let mut writer = BinaryWriter::with_capacity(HEADER_LEN + payload_size + 1);
        writer.write_bytes(&encode_header(
            message.command(),
            (payload_size + 1) as u32,
        ));
        message.serialize_payload(&mut writer)?;
        writer.write_u8(CONTROL_FLAG_VALID);
        Ok(Bytes::from(writer.into_bytes()))
    }
}
