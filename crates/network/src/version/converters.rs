//! Per-type frame converters.
//!
//! Each converter is a pure, stateless transform between one protocol
//! version and the next for a single message type. Both format changes
//! this protocol has seen are field insertions, so one generic
//! converter covers them; unchanged types use the identity converter.

use bytes::{Bytes, BytesMut};

use bdn_config::{COMMAND_LEN, HEADER_LEN};

use crate::error::{NetworkError, NetworkResult};

/// A stateless transform between adjacent protocol versions for one
/// message type. "Upgrade" goes older → newer, "downgrade" newer →
/// older. The first/last-bytes variants transcode only a frame's
/// leading/trailing bytes for cut-through forwarding.
pub trait FrameConverter: Send + Sync {
    /// Newer payload length minus older payload length.
    fn size_delta(&self) -> i64;

    /// Transcodes a complete older-version frame to the newer layout.
    fn upgrade(&self, frame: &[u8]) -> NetworkResult<Bytes>;

    /// Transcodes a complete newer-version frame to the older layout.
    fn downgrade(&self, frame: &[u8]) -> NetworkResult<Bytes>;

    /// Transcodes the leading bytes of an older-version frame. The
    /// prefix must cover the header and the region the layouts differ
    /// in.
    fn upgrade_first_bytes(&self, first: &[u8]) -> NetworkResult<Bytes>;

    /// Transcodes the leading bytes of a newer-version frame.
    fn downgrade_first_bytes(&self, first: &[u8]) -> NetworkResult<Bytes>;

    /// Transcodes the trailing bytes of an older-version frame.
    fn upgrade_last_bytes(&self, last: &[u8]) -> NetworkResult<Bytes>;

    /// Transcodes the trailing bytes of a newer-version frame.
    fn downgrade_last_bytes(&self, last: &[u8]) -> NetworkResult<Bytes>;
}

/// Converter for message types whose layout did not change between two
/// adjacent versions.
pub struct IdentityConverter;

impl FrameConverter for IdentityConverter {
    fn size_delta(&self) -> i64 {
        0
    }

    fn upgrade(&self, frame: &[u8]) -> NetworkResult<Bytes> {
        Ok(Bytes::copy_from_slice(frame))
    }

    fn downgrade(&self, frame: &[u8]) -> NetworkResult<Bytes> {
        Ok(Bytes::copy_from_slice(frame))
    }

    fn upgrade_first_bytes(&self, first: &[u8]) -> NetworkResult<Bytes> {
        Ok(Bytes::copy_from_slice(first))
    }

    fn downgrade_first_bytes(&self, first: &[u8]) -> NetworkResult<Bytes> {
        Ok(Bytes::copy_from_slice(first))
    }

    fn upgrade_last_bytes(&self, last: &[u8]) -> NetworkResult<Bytes> {
        Ok(Bytes::copy_from_slice(last))
    }

    fn downgrade_last_bytes(&self, last: &[u8]) -> NetworkResult<Bytes> {
        Ok(Bytes::copy_from_slice(last))
    }
}

/// Converter for a version step that inserted a fixed-width field into
/// the payload. Upgrading fills the field with its defined default;
/// downgrading drops it.
pub struct InsertedFieldConverter {
    /// Payload offset the newer version inserted the field at.
    insert_at: usize,
    /// Default bytes the field takes after an upgrade.
    field_default: Vec<u8>,
}

impl InsertedFieldConverter {
    /// Creates a converter for a field of `field_default.len()` bytes
    /// inserted at payload offset `insert_at`.
    pub fn new(insert_at: usize, field_default: Vec<u8>) -> Self {
        Self {
            insert_at,
            field_default,
        }
    }

    fn field_len(&self) -> usize {
        self.field_default.len()
    }

    fn read_payload_len(frame: &[u8]) -> NetworkResult<u32> {
        if frame.len() < HEADER_LEN {
            return Err(NetworkError::ValidationFailed {
                reason: "frame shorter than header".into(),
            });
        }
        let at = 4 + COMMAND_LEN;
        Ok(u32::from_le_bytes([
            frame[at],
            frame[at + 1],
            frame[at + 2],
            frame[at + 3],
        ]))
    }

    /// Rebuilds the header with the payload length adjusted by
    /// `delta`, then the payload with the differing region rewritten
    /// by `splice`.
    fn rewrite(
        &self,
        frame: &[u8],
        delta: i64,
        min_prefix: usize,
        splice: impl FnOnce(&mut BytesMut, &[u8]),
    ) -> NetworkResult<Bytes> {
        if frame.len() < HEADER_LEN + min_prefix {
            return Err(NetworkError::Configuration(format!(
                "conversion prefix too short: {} bytes, need {}",
                frame.len(),
                HEADER_LEN + min_prefix
            )));
        }
        let payload_len = Self::read_payload_len(frame)?;
        let new_len = payload_len as i64 + delta;
        if new_len < 1 {
            return Err(NetworkError::ValidationFailed {
                reason: format!("payload length {payload_len} too short to convert"),
            });
        }

        let mut out = BytesMut::with_capacity((frame.len() as i64 + delta) as usize);
        out.extend_from_slice(&frame[..4 + COMMAND_LEN]);
        out.extend_from_slice(&(new_len as u32).to_le_bytes());
        splice(&mut out, &frame[HEADER_LEN..]);
        Ok(out.freeze())
    }
}

impl FrameConverter for InsertedFieldConverter {
    fn size_delta(&self) -> i64 {
        self.field_len() as i64
    }

    fn upgrade(&self, frame: &[u8]) -> NetworkResult<Bytes> {
        self.upgrade_first_bytes(frame)
    }

    fn downgrade(&self, frame: &[u8]) -> NetworkResult<Bytes> {
        self.downgrade_first_bytes(frame)
    }

    fn upgrade_first_bytes(&self, first: &[u8]) -> NetworkResult<Bytes> {
        self.rewrite(first, self.size_delta(), self.insert_at, |out, payload| {
            out.extend_from_slice(&payload[..self.insert_at]);
            out.extend_from_slice(&self.field_default);
            out.extend_from_slice(&payload[self.insert_at..]);
        })
    }

    fn downgrade_first_bytes(&self, first: &[u8]) -> NetworkResult<Bytes> {
        let cut = self.insert_at + self.field_len();
        self.rewrite(first, -self.size_delta(), cut, |out, payload| {
            out.extend_from_slice(&payload[..self.insert_at]);
            out.extend_from_slice(&payload[cut..]);
        })
    }

    // Everything after the inserted field is byte-identical in both
    // layouts.
    fn upgrade_last_bytes(&self, last: &[u8]) -> NetworkResult<Bytes> {
        Ok(Bytes::copy_from_slice(last))
    }

    fn downgrade_last_bytes(&self, last: &[u8]) -> NetworkResult<Bytes> {
        Ok(Bytes::copy_from_slice(last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::header::encode_header;
    use crate::messages::MessageCommand;

    fn frame_with_payload(payload: &[u8]) -> Vec<u8> {
        let mut frame = encode_header(MessageCommand::HELLO, payload.len() as u32).to_vec();
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn test_upgrade_inserts_default() {
        let converter = InsertedFieldConverter::new(2, vec![0xAA, 0xBB]);
        let frame = frame_with_payload(&[1, 2, 3, 0x01]);

        let upgraded = converter.upgrade(&frame).expect("upgrade should be ok");
        assert_eq!(
            &upgraded[HEADER_LEN..],
            &[1, 2, 0xAA, 0xBB, 3, 0x01][..]
        );
        // Payload length was rewritten.
        assert_eq!(upgraded[4 + COMMAND_LEN], 6);
    }

    #[test]
    fn test_downgrade_strips_field() {
        let converter = InsertedFieldConverter::new(2, vec![0xAA, 0xBB]);
        let frame = frame_with_payload(&[1, 2, 0xCC, 0xDD, 3, 0x01]);

        let downgraded = converter.downgrade(&frame).expect("downgrade should be ok");
        assert_eq!(&downgraded[HEADER_LEN..], &[1, 2, 3, 0x01][..]);
        assert_eq!(downgraded[4 + COMMAND_LEN], 4);
    }

    #[test]
    fn test_roundtrip_replaces_unique_fields_with_defaults() {
        let converter = InsertedFieldConverter::new(1, vec![0u8; 3]);
        let frame = frame_with_payload(&[9, 7, 7, 7, 8, 0x01]);

        let down = converter.downgrade(&frame).expect("downgrade should be ok");
        let up = converter.upgrade(&down).expect("upgrade should be ok");
        // Common fields survive; the dropped field comes back zeroed.
        assert_eq!(&up[HEADER_LEN..], &[9, 0, 0, 0, 8, 0x01][..]);
    }

    #[test]
    fn test_short_prefix_is_rejected() {
        let converter = InsertedFieldConverter::new(10, vec![0u8; 4]);
        let frame = frame_with_payload(&[1, 2, 3]);
        let err = converter
            .upgrade_first_bytes(&frame)
            .expect_err("conversion should fail");
        assert!(matches!(err, NetworkError::Configuration(_)));
    }
}
