//! Broadcast routing-header preview.
//!
//! Broadcast frames carry their routing fields ahead of the content so
//! a relay can make cut-through routing decisions before the payload
//! has fully arrived, without allocating the message object.

use uuid::Uuid;

use bdn_config::{NetworkNum, HEADER_LEN};
use bdn_io::InputBuffer;

use crate::error::NetworkResult;
use crate::messages::header::HeaderPreview;
use crate::messages::MessageCommand;

/// Broadcast payload layout: content hash, network number, source id.
const ROUTING_PREFIX_LEN: usize = 32 + 4 + 16;

/// Protocol version that introduced the broadcast sub-type tag.
const BROADCAST_TYPE_SINCE: u32 = 3;

/// Routing-relevant fields of a broadcast frame, extracted without
/// building the full message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastPreview {
    /// Hash of the broadcast content.
    pub content_hash: [u8; 32],
    /// Network the content belongs to.
    pub network_num: NetworkNum,
    /// Identifier of the injecting node.
    pub source_id: Uuid,
    /// Sub-type tag; absent on frames from peers older than v3.
    pub broadcast_type: Option<[u8; 4]>,
}

impl BroadcastPreview {
    /// Extracts routing fields from the front of `buffer`, laid out per
    /// the peer's negotiated `protocol_version`. Returns `Ok(None)` if
    /// the frame is not a broadcast or too few bytes have arrived.
    /// Consumes nothing.
    pub fn peek(
        buffer: &mut InputBuffer,
        protocol_version: u32,
    ) -> NetworkResult<Option<BroadcastPreview>> {
        let preview = HeaderPreview::peek(buffer)?;
        if preview.command != Some(MessageCommand::BROADCAST) {
            return Ok(None);
        }

        let has_type = protocol_version >= BROADCAST_TYPE_SINCE;
        let needed = HEADER_LEN + ROUTING_PREFIX_LEN + if has_type { 4 } else { 0 };
        if buffer.len() < needed {
            return Ok(None);
        }

        let bytes = buffer.peek(needed)?;
        let mut at = HEADER_LEN;

        let mut content_hash = [0u8; 32];
        content_hash.copy_from_slice(&bytes[at..at + 32]);
        at += 32;

        let network_num =
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        at += 4;

        let mut source = [0u8; 16];
        source.copy_from_slice(&bytes[at..at + 16]);
        at += 16;

        let broadcast_type = if has_type {
            let mut tag = [0u8; 4];
            tag.copy_from_slice(&bytes[at..at + 4]);
            Some(tag)
        } else {
            None
        };

        Ok(Some(BroadcastPreview {
            content_hash,
            network_num,
            source_id: Uuid::from_bytes(source),
            broadcast_type,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::payloads::{BroadcastPayload, Message};
    use crate::messages::MessageFactory;
    use bytes::Bytes;

    fn broadcast_frame() -> Bytes {
        let factory = MessageFactory::new();
        factory
            .encode(&Message::Broadcast(BroadcastPayload {
                content_hash: [9u8; 32],
                network_num: 7,
                source_id: Uuid::from_u128(3),
                broadcast_type: *b"blck",
                content: vec![0u8; 256],
            }))
            .expect("encode should be ok")
    }

    #[test]
    fn test_preview_before_content_arrives() {
        let frame = broadcast_frame();
        let mut buffer = InputBuffer::new();
        // Only the header and routing prefix, none of the content.
        buffer.add_bytes(frame.slice(..HEADER_LEN + ROUTING_PREFIX_LEN + 4));

        let preview = BroadcastPreview::peek(&mut buffer, 3)
            .expect("peek should be ok")
            .expect("preview should be available");
        assert_eq!(preview.content_hash, [9u8; 32]);
        assert_eq!(preview.network_num, 7);
        assert_eq!(preview.source_id, Uuid::from_u128(3));
        assert_eq!(preview.broadcast_type, Some(*b"blck"));
    }

    #[test]
    fn test_preview_needs_routing_prefix() {
        let frame = broadcast_frame();
        let mut buffer = InputBuffer::new();
        buffer.add_bytes(frame.slice(..HEADER_LEN + 10));
        assert_eq!(
            BroadcastPreview::peek(&mut buffer, 3).expect("peek should be ok"),
            None
        );
    }

    #[test]
    fn test_non_broadcast_yields_none() {
        let factory = MessageFactory::new();
        let frame = factory
            .encode(&Message::Ping(crate::messages::payloads::PingPayload {
                nonce: 4,
            }))
            .expect("encode should be ok");
        let mut buffer = InputBuffer::new();
        buffer.add_bytes(frame);
        assert_eq!(
            BroadcastPreview::peek(&mut buffer, 3).expect("peek should be ok"),
            None
        );
    }
}
