//! Frame validation capability.

use bdn_config::{CONTROL_FLAG_VALID, STARTING_SEQUENCE};
use bdn_io::InputBuffer;

use crate::error::{NetworkError, NetworkResult};
use crate::messages::MessageCommand;

/// Validates buffered frames before they are popped and parsed.
///
/// Injected into every connection so gateways and relays can tighten
/// checks for their peer kinds; the framing loop only relies on the
/// error classes coming back.
pub trait MessageValidator: Send + Sync {
    /// Validates the frame at the front of `buffer`. `is_full`,
    /// `command` and `payload_len` come from the header preview;
    /// `header_len` is the fixed header size. Must not consume bytes.
    fn validate(
        &self,
        is_full: bool,
        command: Option<MessageCommand>,
        header_len: usize,
        payload_len: Option<u32>,
        buffer: &mut InputBuffer,
    ) -> NetworkResult<()>;
}

/// Default validation: starting sequence, per-class payload ceilings,
/// and the trailing control flag once the frame is fully available.
#[derive(Debug, Default, Clone)]
pub struct DefaultMessageValidator;

impl DefaultMessageValidator {
    /// Creates the default validator.
    pub fn new() -> Self {
        Self
    }
}

impl MessageValidator for DefaultMessageValidator {
    fn validate(
        &self,
        is_full: bool,
        command: Option<MessageCommand>,
        header_len: usize,
        payload_len: Option<u32>,
        buffer: &mut InputBuffer,
    ) -> NetworkResult<()> {
        // Magic is checkable as soon as its bytes arrive, even before
        // the full header.
        let magic_len = STARTING_SEQUENCE.len().min(buffer.len());
        if magic_len > 0 {
            let front = buffer.peek(magic_len)?;
            if front != &STARTING_SEQUENCE[..magic_len] {
                return Err(NetworkError::UnrecoverableFrame {
                    reason: "starting sequence mismatch".into(),
                });
            }
        }

        let (Some(command), Some(payload_len)) = (command, payload_len) else {
            return Ok(());
        };

        if payload_len == 0 {
            // Every frame carries at least the control flag byte.
            return Err(NetworkError::ValidationFailed {
                reason: "zero payload length".into(),
            });
        }

        if payload_len as usize > command.max_payload() {
            return Err(NetworkError::UnrecoverableFrame {
                reason: format!(
                    "payload length {} exceeds ceiling {} for {}",
                    payload_len,
                    command.max_payload(),
                    command
                ),
            });
        }

        if is_full {
            let frame_len = header_len + payload_len as usize;
            let frame = buffer.peek(frame_len)?;
            let control_flag = frame[frame_len - 1];
            if control_flag != CONTROL_FLAG_VALID {
                return Err(NetworkError::ValidationFailed {
                    reason: format!("control flag {control_flag:#04x}"),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::header::{encode_header, HeaderPreview};
    use bdn_config::HEADER_LEN;
    use bytes::Bytes;

    fn validate(buffer: &mut InputBuffer) -> NetworkResult<()> {
        let preview = HeaderPreview::peek(buffer).expect("peek should be ok");
        DefaultMessageValidator::new().validate(
            preview.is_full_message,
            preview.command,
            HEADER_LEN,
            preview.payload_length,
            buffer,
        )
    }

    #[test]
    fn test_bad_magic_is_unrecoverable() {
        let mut buffer = InputBuffer::new();
        buffer.add_bytes(Bytes::from_static(b"\x00\x01\x02\x03garbage"));
        let err = validate(&mut buffer).expect_err("validate should fail");
        assert!(matches!(err, NetworkError::UnrecoverableFrame { .. }));
    }

    #[test]
    fn test_ceiling_violation_is_unrecoverable() {
        let header = encode_header(MessageCommand::PING, u32::MAX);
        let mut buffer = InputBuffer::new();
        buffer.add_bytes(Bytes::copy_from_slice(&header));
        let err = validate(&mut buffer).expect_err("validate should fail");
        assert!(matches!(err, NetworkError::UnrecoverableFrame { .. }));
    }

    #[test]
    fn test_bad_control_flag_is_recoverable() {
        let mut frame = encode_header(MessageCommand::ACK, 1).to_vec();
        frame.push(0x7F); // not the sentinel
        let mut buffer = InputBuffer::new();
        buffer.add_bytes(Bytes::from(frame));
        let err = validate(&mut buffer).expect_err("validate should fail");
        assert!(matches!(err, NetworkError::ValidationFailed { .. }));
        assert!(err.is_recoverable_bad_message());
    }

    #[test]
    fn test_partial_header_passes() {
        let mut buffer = InputBuffer::new();
        buffer.add_bytes(Bytes::copy_from_slice(&STARTING_SEQUENCE[..2]));
        assert!(validate(&mut buffer).is_ok());
    }
}
