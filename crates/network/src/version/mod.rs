//! Protocol version negotiation and cross-version transcoding.
//!
//! The manager holds a closed table of converters keyed by
//! `(older_version, command)`, one entry per version step. The table is
//! validated when the manager is built; a missing pair at traffic time
//! therefore indicates a configuration bug, not a peer problem.

pub mod converters;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use bdn_config::{MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};

use crate::error::{NetworkError, NetworkResult};
use crate::messages::{Message, MessageCommand, MessageFactory};
use converters::{FrameConverter, IdentityConverter, InsertedFieldConverter};

/// Payload offset of the node id field hello gained in v2.
const HELLO_NODE_ID_OFFSET: usize = 8;

/// Payload offset of the sub-type tag broadcast gained in v3.
const BROADCAST_TYPE_OFFSET: usize = 52;

/// Default sub-type for broadcasts upgraded from pre-v3 peers.
const DEFAULT_BROADCAST_TYPE: &[u8; 4] = b"blck";

/// Registry of per-version, per-type frame converters.
///
/// Pure and stateless once built; safe to share across connections
/// without synchronization.
pub struct VersionManager {
    converters: HashMap<(u32, MessageCommand), Arc<dyn FrameConverter>>,
}

impl VersionManager {
    /// Builds the manager with the full converter table for every
    /// supported version step. Registration problems surface here.
    pub fn new() -> NetworkResult<Self> {
        let mut manager = Self {
            converters: HashMap::new(),
        };

        // v1 → v2: hello gained the node id field.
        manager.register(
            1,
            MessageCommand::HELLO,
            Arc::new(InsertedFieldConverter::new(
                HELLO_NODE_ID_OFFSET,
                vec![0u8; 16],
            )),
        )?;

        // v2 → v3: broadcast gained the sub-type tag.
        manager.register(
            2,
            MessageCommand::BROADCAST,
            Arc::new(InsertedFieldConverter::new(
                BROADCAST_TYPE_OFFSET,
                DEFAULT_BROADCAST_TYPE.to_vec(),
            )),
        )?;

        // Every other (version, type) pair is unchanged; the table is
        // still closed over all of them.
        for version in MIN_PROTOCOL_VERSION..PROTOCOL_VERSION {
            for command in MessageCommand::KNOWN {
                if !manager.converters.contains_key(&(version, command)) {
                    manager.register(version, command, Arc::new(IdentityConverter))?;
                }
            }
        }

        Ok(manager)
    }

    fn register(
        &mut self,
        version: u32,
        command: MessageCommand,
        converter: Arc<dyn FrameConverter>,
    ) -> NetworkResult<()> {
        if !(MIN_PROTOCOL_VERSION..PROTOCOL_VERSION).contains(&version) {
            return Err(NetworkError::Configuration(format!(
                "converter version {version} outside supported step range"
            )));
        }
        if self
            .converters
            .insert((version, command), converter)
            .is_some()
        {
            return Err(NetworkError::Configuration(format!(
                "duplicate converter for version {version} command {command}"
            )));
        }
        Ok(())
    }

    fn converter(
        &self,
        version: u32,
        command: MessageCommand,
    ) -> NetworkResult<&Arc<dyn FrameConverter>> {
        self.converters
            .get(&(version, command))
            .ok_or(NetworkError::NoConverter { version, command })
    }

    /// Whether this node can talk to a peer on `version`.
    pub fn is_supported(&self, version: u32) -> bool {
        (MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&version)
    }

    /// Total payload size difference between a peer on `version` and
    /// the current layout for `command`, without decoding anything.
    pub fn size_delta(&self, version: u32, command: MessageCommand) -> NetworkResult<i64> {
        let mut delta = 0;
        for step in version..PROTOCOL_VERSION {
            delta += self.converter(step, command)?.size_delta();
        }
        Ok(delta)
    }

    /// Transcodes a complete frame received from a peer on `version`
    /// up to the current layout.
    pub fn convert_frame_from_older(
        &self,
        version: u32,
        command: MessageCommand,
        frame: Bytes,
    ) -> NetworkResult<Bytes> {
        let mut frame = frame;
        for step in version..PROTOCOL_VERSION {
            frame = self.converter(step, command)?.upgrade(&frame)?;
        }
        Ok(frame)
    }

    /// Transcodes a complete current-layout frame down to the layout a
    /// peer on `version` expects.
    pub fn convert_frame_to_older(
        &self,
        version: u32,
        command: MessageCommand,
        frame: Bytes,
    ) -> NetworkResult<Bytes> {
        let mut frame = frame;
        for step in (version..PROTOCOL_VERSION).rev() {
            frame = self.converter(step, command)?.downgrade(&frame)?;
        }
        Ok(frame)
    }

    /// Cut-through variant of [`Self::convert_frame_from_older`] for a
    /// frame's leading bytes only.
    pub fn convert_first_bytes_from_older(
        &self,
        version: u32,
        command: MessageCommand,
        first: Bytes,
    ) -> NetworkResult<Bytes> {
        let mut first = first;
        for step in version..PROTOCOL_VERSION {
            first = self.converter(step, command)?.upgrade_first_bytes(&first)?;
        }
        Ok(first)
    }

    /// Cut-through variant of [`Self::convert_frame_to_older`] for a
    /// frame's leading bytes only.
    pub fn convert_first_bytes_to_older(
        &self,
        version: u32,
        command: MessageCommand,
        first: Bytes,
    ) -> NetworkResult<Bytes> {
        let mut first = first;
        for step in (version..PROTOCOL_VERSION).rev() {
            first = self
                .converter(step, command)?
                .downgrade_first_bytes(&first)?;
        }
        Ok(first)
    }

    /// Cut-through transcoding of a frame's trailing bytes from an
    /// older peer's layout.
    pub fn convert_last_bytes_from_older(
        &self,
        version: u32,
        command: MessageCommand,
        last: Bytes,
    ) -> NetworkResult<Bytes> {
        let mut last = last;
        for step in version..PROTOCOL_VERSION {
            last = self.converter(step, command)?.upgrade_last_bytes(&last)?;
        }
        Ok(last)
    }

    /// Cut-through transcoding of a frame's trailing bytes to an older
    /// peer's layout.
    pub fn convert_last_bytes_to_older(
        &self,
        version: u32,
        command: MessageCommand,
        last: Bytes,
    ) -> NetworkResult<Bytes> {
        let mut last = last;
        for step in (version..PROTOCOL_VERSION).rev() {
            last = self.converter(step, command)?.downgrade_last_bytes(&last)?;
        }
        Ok(last)
    }

    /// A factory view pinned to a peer's negotiated version: decodes
    /// older frames by upgrading first, encodes by downgrading last.
    pub fn factory_for(
        self: &Arc<Self>,
        version: u32,
        factory: MessageFactory,
    ) -> NetworkResult<VersionedFactory> {
        if !self.is_supported(version) {
            return Err(NetworkError::UnsupportedVersion { version });
        }
        Ok(VersionedFactory {
            version,
            manager: Arc::clone(self),
            factory,
        })
    }
}

/// Message factory pinned to one peer's protocol version.
pub struct VersionedFactory {
    version: u32,
    manager: Arc<VersionManager>,
    factory: MessageFactory,
}

impl fmt::Debug for VersionedFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionedFactory")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl VersionedFactory {
    /// The pinned protocol version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Decodes a frame laid out per the pinned version.
    pub fn decode_frame(&self, frame: Bytes) -> NetworkResult<Message> {
        let mut command_bytes = [0u8; bdn_config::COMMAND_LEN];
        if frame.len() < bdn_config::HEADER_LEN {
            return Err(NetworkError::ValidationFailed {
                reason: "frame shorter than header".into(),
            });
        }
        command_bytes.copy_from_slice(&frame[4..4 + bdn_config::COMMAND_LEN]);
        let command = MessageCommand::from_bytes(command_bytes);

        let frame = self
            .manager
            .convert_frame_from_older(self.version, command, frame)?;
        self.factory.decode_frame(&frame)
    }

    /// Encodes a message into the frame layout the pinned version
    /// expects.
    pub fn encode(&self, message: &Message) -> NetworkResult<Bytes> {
        let frame = self.factory.encode(message)?;
        self.manager
            .convert_frame_to_older(self.version, message.command(), frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::payloads::{BroadcastPayload, HelloPayload};
    use bdn_config::LEGACY_PROTOCOL_VERSION;
    use uuid::Uuid;

    fn manager() -> Arc<VersionManager> {
        Arc::new(VersionManager::new().expect("manager should build"))
    }

    #[test]
    fn test_supported_window() {
        let manager = manager();
        assert!(manager.is_supported(MIN_PROTOCOL_VERSION));
        assert!(manager.is_supported(PROTOCOL_VERSION));
        assert!(!manager.is_supported(PROTOCOL_VERSION + 1));
        assert!(!manager.is_supported(0));
    }

    #[test]
    fn test_size_delta_accumulates_across_steps() {
        let manager = manager();
        // hello: +16 (node id) from v1, nothing from v2.
        assert_eq!(
            manager
                .size_delta(1, MessageCommand::HELLO)
                .expect("delta should be ok"),
            16
        );
        // broadcast: +4 (sub-type) from v2 only.
        assert_eq!(
            manager
                .size_delta(1, MessageCommand::BROADCAST)
                .expect("delta should be ok"),
            4
        );
        assert_eq!(
            manager
                .size_delta(PROTOCOL_VERSION, MessageCommand::HELLO)
                .expect("delta should be ok"),
            0
        );
    }

    #[test]
    fn test_hello_round_trip_through_v1() {
        let manager = manager();
        let factory = MessageFactory::new();
        let hello = Message::Hello(HelloPayload::new(5, Uuid::from_u128(77), 9000));
        let frame = factory.encode(&hello).expect("encode should be ok");

        let down = manager
            .convert_frame_to_older(LEGACY_PROTOCOL_VERSION, MessageCommand::HELLO, frame)
            .expect("downgrade should be ok");
        let up = manager
            .convert_frame_from_older(LEGACY_PROTOCOL_VERSION, MessageCommand::HELLO, down)
            .expect("upgrade should be ok");

        let Message::Hello(back) = factory.decode_frame(&up).expect("decode should be ok") else {
            panic!("expected hello");
        };
        // Common fields survive the round trip.
        assert_eq!(back.protocol_version, PROTOCOL_VERSION);
        assert_eq!(back.network_num, 5);
        assert_eq!(back.listen_port, 9000);
        // The v2+ field is replaced with its defined default.
        assert_eq!(back.node_id, Uuid::nil());
    }

    #[test]
    fn test_broadcast_round_trip_through_v2() {
        let manager = manager();
        let factory = MessageFactory::new();
        let broadcast = Message::Broadcast(BroadcastPayload {
            content_hash: [3u8; 32],
            network_num: 9,
            source_id: Uuid::from_u128(12),
            broadcast_type: *b"mblk",
            content: vec![5, 6, 7],
        });
        let frame = factory.encode(&broadcast).expect("encode should be ok");

        let down = manager
            .convert_frame_to_older(2, MessageCommand::BROADCAST, frame)
            .expect("downgrade should be ok");
        let up = manager
            .convert_frame_from_older(2, MessageCommand::BROADCAST, down)
            .expect("upgrade should be ok");

        let Message::Broadcast(back) = factory.decode_frame(&up).expect("decode should be ok")
        else {
            panic!("expected broadcast");
        };
        assert_eq!(back.content_hash, [3u8; 32]);
        assert_eq!(back.network_num, 9);
        assert_eq!(back.source_id, Uuid::from_u128(12));
        assert_eq!(back.content, vec![5, 6, 7]);
        // The v3 tag comes back as the default.
        assert_eq!(back.broadcast_type, *DEFAULT_BROADCAST_TYPE);
    }

    #[test]
    fn test_versioned_factory_speaks_older_layout() {
        let manager = manager();
        let versioned = manager
            .factory_for(1, MessageFactory::new())
            .expect("factory should build");
        let hello = Message::Hello(HelloPayload::new(2, Uuid::from_u128(4), 7000));

        let older_frame = versioned.encode(&hello).expect("encode should be ok");
        // v1 hello: version + network + port + control flag.
        assert_eq!(older_frame.len(), bdn_config::HEADER_LEN + 4 + 4 + 2 + 1);

        let decoded = versioned
            .decode_frame(older_frame)
            .expect("decode should be ok");
        let Message::Hello(back) = decoded else {
            panic!("expected hello");
        };
        assert_eq!(back.network_num, 2);
        assert_eq!(back.node_id, Uuid::nil());
    }

    #[test]
    fn test_unsupported_version_rejected_eagerly() {
        let manager = manager();
        let err = manager
            .factory_for(PROTOCOL_VERSION + 5, MessageFactory::new())
            .expect_err("factory should fail");
        assert!(matches!(err, NetworkError::UnsupportedVersion { .. }));
    }
}
