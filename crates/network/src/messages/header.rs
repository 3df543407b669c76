//! Wire header encoding and preview.
//!
//! The preview path inspects only the fixed-size header portion of an
//! input buffer and never consumes bytes, so it works on any prefix of
//! a frame.

use bdn_config::{
    COMMAND_LEN, HEADER_LEN, HELLO_VERSION_OFFSET, LEGACY_PROTOCOL_VERSION, STARTING_SEQUENCE,
};
use bdn_io::InputBuffer;

use crate::error::NetworkResult;
use crate::messages::MessageCommand;

/// Result of inspecting the header prefix of an input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderPreview {
    /// Whether the buffer holds the complete frame.
    pub is_full_message: bool,
    /// Command tag, once the header is available.
    pub command: Option<MessageCommand>,
    /// Payload length (includes the trailing control flag byte), once
    /// the header is available.
    pub payload_length: Option<u32>,
}

impl HeaderPreview {
    /// A preview of a buffer that does not yet hold a full header.
    pub const INCOMPLETE: HeaderPreview = HeaderPreview {
        is_full_message: false,
        command: None,
        payload_length: None,
    };

    /// Inspects the front of `buffer` without consuming anything. A
    /// buffer shorter than the header yields
    /// [`HeaderPreview::INCOMPLETE`] rather than an error; validity
    /// checks (magic, ceilings, control flag) are the validator's job.
    pub fn peek(buffer: &mut InputBuffer) -> NetworkResult<HeaderPreview> {
        if buffer.len() < HEADER_LEN {
            return Ok(Self::INCOMPLETE);
        }

        let header = buffer.peek(HEADER_LEN)?;
        let mut command_bytes = [0u8; COMMAND_LEN];
        command_bytes.copy_from_slice(&header[4..4 + COMMAND_LEN]);
        let command = MessageCommand::from_bytes(command_bytes);

        let offset = 4 + COMMAND_LEN;
        let payload_length = u32::from_le_bytes([
            header[offset],
            header[offset + 1],
            header[offset + 2],
            header[offset + 3],
        ]);

        Ok(HeaderPreview {
            is_full_message: buffer.len() >= HEADER_LEN + payload_length as usize,
            command: Some(command),
            payload_length: Some(payload_length),
        })
    }

    /// Total frame size, once the header is available.
    pub fn frame_len(&self) -> Option<usize> {
        self.payload_length.map(|len| HEADER_LEN + len as usize)
    }
}

/// Encodes a frame header for `command` with the given payload length.
pub fn encode_header(command: MessageCommand, payload_length: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&STARTING_SEQUENCE);
    header[4..4 + COMMAND_LEN].copy_from_slice(command.as_bytes());
    header[4 + COMMAND_LEN..].copy_from_slice(&payload_length.to_le_bytes());
    header
}

/// Reads the protocol version from the fixed offset of a buffered hello
/// frame without consuming it.
///
/// Returns `Ok(None)` when too few bytes have arrived to decide, and
/// the legacy default version when the hello payload is too short to
/// carry a version field at all.
pub fn peek_hello_version(buffer: &mut InputBuffer) -> NetworkResult<Option<u32>> {
    let preview = HeaderPreview::peek(buffer)?;
    let (Some(command), Some(payload_length)) = (preview.command, preview.payload_length) else {
        return Ok(None);
    };
    if command != MessageCommand::HELLO {
        return Ok(None);
    }

    // Control flag byte is part of payload_length; a payload too short
    // to reach past the version field means a legacy peer.
    let version_end = HELLO_VERSION_OFFSET + 4;
    if (payload_length as usize) < version_end + 1 {
        return Ok(Some(LEGACY_PROTOCOL_VERSION));
    }

    let needed = HEADER_LEN + version_end;
    if buffer.len() < needed {
        return Ok(None);
    }

    let bytes = buffer.peek(needed)?;
    let at = HEADER_LEN + HELLO_VERSION_OFFSET;
    Ok(Some(u32::from_le_bytes([
        bytes[at],
        bytes[at + 1],
        bytes[at + 2],
        bytes[at + 3],
    ])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn buffer_from(data: &[u8]) -> InputBuffer {
        let mut buffer = InputBuffer::new();
        buffer.add_bytes(Bytes::copy_from_slice(data));
        buffer
    }

    fn frame(command: MessageCommand, payload: &[u8]) -> Vec<u8> {
        let mut bytes = encode_header(command, (payload.len() + 1) as u32).to_vec();
        bytes.extend_from_slice(payload);
        bytes.push(bdn_config::CONTROL_FLAG_VALID);
        bytes
    }

    #[test]
    fn test_short_prefix_is_incomplete_and_untouched() {
        let mut buffer = buffer_from(&[0xFF, 0xFE]);
        let preview = HeaderPreview::peek(&mut buffer).expect("peek should be ok");
        assert_eq!(preview, HeaderPreview::INCOMPLETE);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_header_only_reports_not_full() {
        let header = encode_header(MessageCommand::PING, 9);
        let mut buffer = buffer_from(&header);
        let preview = HeaderPreview::peek(&mut buffer).expect("peek should be ok");
        assert!(!preview.is_full_message);
        assert_eq!(preview.command, Some(MessageCommand::PING));
        assert_eq!(preview.payload_length, Some(9));
    }

    #[test]
    fn test_full_frame_with_extra_bytes() {
        let mut bytes = frame(MessageCommand::PING, &42u64.to_le_bytes());
        bytes.extend_from_slice(b"extra");
        let total = bytes.len();
        let mut buffer = buffer_from(&bytes);

        let preview = HeaderPreview::peek(&mut buffer).expect("peek should be ok");
        assert!(preview.is_full_message);
        assert_eq!(preview.payload_length, Some(9));

        // The preview consumed nothing, extra bytes included.
        assert_eq!(buffer.len(), total);
    }

    #[test]
    fn test_hello_version_at_fixed_offset() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&2u32.to_le_bytes());
        payload.extend_from_slice(&5u32.to_le_bytes());
        let mut buffer = buffer_from(&frame(MessageCommand::HELLO, &payload));
        assert_eq!(
            peek_hello_version(&mut buffer).expect("peek should be ok"),
            Some(2)
        );
    }

    #[test]
    fn test_under_length_hello_is_legacy() {
        // Payload holds only the control flag; no room for a version.
        let mut buffer = buffer_from(&frame(MessageCommand::HELLO, &[]));
        assert_eq!(
            peek_hello_version(&mut buffer).expect("peek should be ok"),
            Some(LEGACY_PROTOCOL_VERSION)
        );
    }

    #[test]
    fn test_hello_version_not_yet_known() {
        let bytes = frame(MessageCommand::HELLO, &3u32.to_le_bytes());
        // Header arrived, version bytes did not.
        let mut buffer = buffer_from(&bytes[..HEADER_LEN + 2]);
        assert_eq!(
            peek_hello_version(&mut buffer).expect("peek should be ok"),
            None
        );
    }
}
