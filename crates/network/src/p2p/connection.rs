//! Per-peer connection state machine.
//!
//! A [`Connection`] owns the input and output buffers for one socket
//! and drives the handshake, keepalive, and relay logic over them. It
//! performs no I/O itself: the event loop feeds it received bytes and
//! drains its output, acting on the [`ProcessOutcome`] each round
//! returns.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::ops::{BitAnd, BitOr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use bdn_config::{HEADER_LEN, MAX_BAD_MESSAGES, NetworkNum, PROTOCOL_VERSION};
use bdn_io::{InputBuffer, OutputBuffer};

use crate::error::{NetworkError, NetworkResult};
use crate::messages::payloads::{AckPayload, DisconnectPayload, HelloPayload, PingPayload, PongPayload};
use crate::messages::{peek_hello_version, HeaderPreview, Message, MessageCommand, MessageFactory};
use crate::validator::MessageValidator;
use crate::version::VersionManager;

use super::protocol::ConnectionProtocol;

/// Kind of peer on the far side, as a bitmask so registry lookups can
/// match several kinds at once.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionType(u16);

impl ConnectionType {
    pub const NONE: ConnectionType = ConnectionType(0);
    /// Relay handling block-sized broadcasts.
    pub const RELAY_BLOCK: ConnectionType = ConnectionType(1 << 0);
    /// Relay handling transaction traffic.
    pub const RELAY_TRANSACTION: ConnectionType = ConnectionType(1 << 1);
    /// Gateway bridging a blockchain node.
    pub const GATEWAY: ConnectionType = ConnectionType(1 << 2);
    /// A blockchain node connected directly, without a gateway in front.
    pub const BLOCKCHAIN_NODE: ConnectionType = ConnectionType(1 << 3);
    /// Relay fronting other relays rather than terminating traffic.
    pub const RELAY_PROXY: ConnectionType = ConnectionType(1 << 4);
    /// Relay handling both traffic classes.
    pub const RELAY_ALL: ConnectionType =
        ConnectionType(Self::RELAY_BLOCK.0 | Self::RELAY_TRANSACTION.0);

    /// The single-bit kinds a connection can be bucketed under.
    pub const FLAGS: [ConnectionType; 5] = [
        Self::RELAY_BLOCK,
        Self::RELAY_TRANSACTION,
        Self::GATEWAY,
        Self::BLOCKCHAIN_NODE,
        Self::RELAY_PROXY,
    ];

    /// Whether any bit of `mask` is set on this type.
    pub fn matches(&self, mask: ConnectionType) -> bool {
        self.0 & mask.0 != 0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }
}

impl BitOr for ConnectionType {
    type Output = ConnectionType;

    fn bitor(self, rhs: Self) -> Self {
        ConnectionType(self.0 | rhs.0)
    }
}

impl BitAnd for ConnectionType {
    type Output = ConnectionType;

    fn bitand(self, rhs: Self) -> Self {
        ConnectionType(self.0 & rhs.0)
    }
}

impl fmt::Debug for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.matches(Self::RELAY_BLOCK) {
            names.push("RELAY_BLOCK");
        }
        if self.matches(Self::RELAY_TRANSACTION) {
            names.push("RELAY_TRANSACTION");
        }
        if self.matches(Self::GATEWAY) {
            names.push("GATEWAY");
        }
        if self.matches(Self::BLOCKCHAIN_NODE) {
            names.push("BLOCKCHAIN_NODE");
        }
        if self.matches(Self::RELAY_PROXY) {
            names.push("RELAY_PROXY");
        }
        if names.is_empty() {
            names.push("NONE");
        }
        write!(f, "ConnectionType({})", names.join("|"))
    }
}

/// Independent lifecycle latches for one connection. Latches only move
/// forward; a connection never becomes un-established.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// The socket exists and the opening hello has been queued.
    pub initialized: bool,
    /// The peer's hello arrived and was accepted.
    pub hello_received: bool,
    /// The peer acknowledged this node's hello.
    pub hello_acked: bool,
    /// The connection is closing; no new work is accepted.
    pub marked_for_close: bool,
    /// The peer asked not to be redialed after close.
    pub do_not_retry: bool,
    /// Inbound bytes are no longer processed (corrupt stream).
    pub halted_receive: bool,
}

impl ConnectionStatus {
    /// Whether the handshake completed in both directions.
    pub fn is_established(&self) -> bool {
        self.initialized && self.hello_received && self.hello_acked && !self.marked_for_close
    }
}

/// What one processing round changed, for the event loop to act on:
/// reindex the registry, detect duplicate peers, or tear down.
#[derive(Debug, Default)]
pub struct ProcessOutcome {
    /// The handshake completed during this round.
    pub established_now: bool,
    /// The peer announced its node id during this round.
    pub node_id_assigned: Option<Uuid>,
    /// The peer's advertised listen port replaced the ephemeral
    /// source port of an inbound socket.
    pub port_corrected: Option<u16>,
    /// The connection must be torn down.
    pub closed: bool,
}

/// State machine and buffers for one peer connection.
pub struct Connection {
    socket_id: usize,
    peer_addr: SocketAddr,
    from_me: bool,
    peer_port: u16,
    peer_id: Option<Uuid>,
    peer_version: Option<u32>,
    network_num: NetworkNum,
    node_id: Uuid,
    listen_port: u16,
    conn_type: ConnectionType,
    status: ConnectionStatus,
    input: InputBuffer,
    output: OutputBuffer,
    factory: Arc<MessageFactory>,
    version_manager: Arc<VersionManager>,
    validator: Arc<dyn MessageValidator>,
    protocol: Arc<dyn ConnectionProtocol>,
    bad_message_count: u32,
    ping_nonces: HashMap<u64, Instant>,
    latency_samples: Vec<Duration>,
    pending_relay: Vec<Message>,
    round: ProcessOutcome,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        socket_id: usize,
        peer_addr: SocketAddr,
        from_me: bool,
        conn_type: ConnectionType,
        network_num: NetworkNum,
        node_id: Uuid,
        listen_port: u16,
        factory: Arc<MessageFactory>,
        version_manager: Arc<VersionManager>,
        validator: Arc<dyn MessageValidator>,
        protocol: Arc<dyn ConnectionProtocol>,
    ) -> Self {
        Self {
            socket_id,
            peer_addr,
            from_me,
            peer_port: peer_addr.port(),
            peer_id: None,
            peer_version: None,
            network_num,
            node_id,
            listen_port,
            conn_type,
            status: ConnectionStatus::default(),
            input: InputBuffer::new(),
            output: OutputBuffer::default(),
            factory,
            version_manager,
            validator,
            protocol,
            bad_message_count: 0,
            ping_nonces: HashMap::new(),
            latency_samples: Vec::new(),
            pending_relay: Vec::new(),
            round: ProcessOutcome::default(),
        }
    }

    pub fn socket_id(&self) -> usize {
        self.socket_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn peer_ip(&self) -> IpAddr {
        self.peer_addr.ip()
    }

    /// The peer's reachable port: the socket's remote port for outbound
    /// connections, the hello-advertised listen port for inbound ones.
    pub fn peer_port(&self) -> u16 {
        self.peer_port
    }

    pub fn peer_id(&self) -> Option<Uuid> {
        self.peer_id
    }

    pub fn peer_version(&self) -> Option<u32> {
        self.peer_version
    }

    pub fn from_me(&self) -> bool {
        self.from_me
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.conn_type
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_established(&self) -> bool {
        self.status.is_established()
    }

    pub fn is_marked_for_close(&self) -> bool {
        self.status.marked_for_close
    }

    pub fn do_not_retry(&self) -> bool {
        self.status.do_not_retry
    }

    /// Mean of the recorded ping round-trip samples.
    pub fn average_latency(&self) -> Option<Duration> {
        if self.latency_samples.is_empty() {
            return None;
        }
        let total: Duration = self.latency_samples.iter().sum();
        Some(total / self.latency_samples.len() as u32)
    }

    pub fn latency_samples(&self) -> &[Duration] {
        &self.latency_samples
    }

    /// Pings awaiting a pong.
    pub fn outstanding_pings(&self) -> usize {
        self.ping_nonces.len()
    }

    /// Marks the connection initialized and queues the opening hello.
    pub fn on_initialized(&mut self) -> NetworkResult<()> {
        self.status.initialized = true;
        let hello = Message::Hello(HelloPayload::new(
            self.network_num,
            self.node_id,
            self.listen_port,
        ));
        self.enqueue_msg(&hello)
    }

    /// Feeds received bytes in and processes every complete frame now
    /// available.
    pub fn process_bytes(&mut self, data: Bytes) -> ProcessOutcome {
        self.input.add_bytes(data);
        self.advance()
    }

    /// Processes buffered frames until the buffer runs dry or the
    /// connection halts.
    pub fn advance(&mut self) -> ProcessOutcome {
        let was_established = self.status.is_established();

        while self.input.has_more()
            && !self.status.marked_for_close
            && !self.status.halted_receive
        {
            match self.advance_one() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(err) => {
                    if err.closes_connection() {
                        warn!(
                            socket_id = self.socket_id,
                            peer = %self.peer_addr,
                            error = %err,
                            "closing connection"
                        );
                        self.halt();
                        break;
                    }
                    if err.is_recoverable_bad_message() {
                        self.bad_message_count += 1;
                        warn!(
                            socket_id = self.socket_id,
                            peer = %self.peer_addr,
                            count = self.bad_message_count,
                            error = %err,
                            "bad message from peer"
                        );
                        if self.bad_message_count >= MAX_BAD_MESSAGES {
                            warn!(
                                socket_id = self.socket_id,
                                peer = %self.peer_addr,
                                "bad message threshold reached"
                            );
                            self.halt();
                            break;
                        }
                        continue;
                    }
                    // Anything else is a local bug; stop the connection
                    // rather than loop on it.
                    warn!(
                        socket_id = self.socket_id,
                        error = %err,
                        "internal error processing frame"
                    );
                    self.halt();
                    break;
                }
            }
        }

        if !was_established && self.status.is_established() {
            self.round.established_now = true;
        }
        std::mem::take(&mut self.round)
    }

    /// Processes at most one frame. `Ok(true)` means a frame was
    /// consumed and more may follow; `Ok(false)` means more bytes are
    /// needed. Errors from a frame with a known boundary have already
    /// consumed that frame's bytes.
    fn advance_one(&mut self) -> NetworkResult<bool> {
        let preview = HeaderPreview::peek(&mut self.input)?;

        let validation = self.validator.validate(
            preview.is_full_message,
            preview.command,
            HEADER_LEN,
            preview.payload_length,
            &mut self.input,
        );
        if let Err(err) = validation {
            if err.is_recoverable_bad_message() {
                self.discard_frame(&preview)?;
            }
            return Err(err);
        }

        if !preview.is_full_message {
            return Ok(false);
        }
        let (Some(command), Some(frame_len)) = (preview.command, preview.frame_len()) else {
            return Ok(false);
        };

        // The first hello fixes the peer's protocol version; its frame
        // may still be laid out per an older version.
        if command == MessageCommand::HELLO && self.peer_version.is_none() {
            if let Some(version) = peek_hello_version(&mut self.input)? {
                if !self.version_manager.is_supported(version) {
                    return Err(NetworkError::UnsupportedVersion { version });
                }
                debug!(
                    socket_id = self.socket_id,
                    peer = %self.peer_addr,
                    version,
                    "peer protocol version fixed"
                );
                self.peer_version = Some(version);
            }
        }

        let frame = self.input.remove_bytes(frame_len)?;
        let message = match self.decode_frame(command, frame) {
            Ok(message) => message,
            Err(err) => return Err(err),
        };

        if !self.status.is_established() && !command.is_handshake() {
            return Err(NetworkError::ProtocolViolation {
                peer: self.peer_addr,
                violation: format!("{command} before handshake completed"),
            });
        }

        trace!(
            socket_id = self.socket_id,
            command = %command,
            "dispatching message"
        );
        let protocol = Arc::clone(&self.protocol);
        match protocol.handlers().get(command) {
            Some(handler) => handler(self, message)?,
            // Recognized command with no registered handler is dropped.
            None => debug!(socket_id = self.socket_id, command = %command, "no handler, ignoring"),
        }
        self.bad_message_count = 0;
        Ok(true)
    }

    /// Drops the frame at the front of the buffer when its boundary is
    /// known, so one bad frame does not poison the stream.
    fn discard_frame(&mut self, preview: &HeaderPreview) -> NetworkResult<()> {
        if let Some(frame_len) = preview.frame_len() {
            if self.input.len() >= frame_len {
                self.input.remove_bytes(frame_len)?;
            }
        }
        Ok(())
    }

    fn decode_frame(&self, command: MessageCommand, frame: Bytes) -> NetworkResult<Message> {
        let version = self.peer_version.unwrap_or(PROTOCOL_VERSION);
        let frame = if version < PROTOCOL_VERSION {
            self.version_manager
                .convert_frame_from_older(version, command, frame)?
        } else {
            frame
        };
        self.factory.decode_frame(&frame)
    }

    /// Encodes and queues a message, transcoding down for older peers.
    pub fn enqueue_msg(&mut self, message: &Message) -> NetworkResult<()> {
        if self.status.marked_for_close {
            return Ok(());
        }
        let frame = self.factory.encode(message)?;
        let version = self.peer_version.unwrap_or(PROTOCOL_VERSION);
        let frame = if version < PROTOCOL_VERSION {
            self.version_manager
                .convert_frame_to_older(version, message.command(), frame)?
        } else {
            frame
        };
        self.output.enqueue(frame);
        Ok(())
    }

    /// Sends a keepalive ping and remembers the nonce for latency
    /// measurement. No-op until the handshake completes.
    pub fn send_ping(&mut self, now: Instant) -> NetworkResult<()> {
        if !self.status.is_established() {
            return Ok(());
        }
        let nonce: u64 = rand::random();
        self.ping_nonces.insert(nonce, now);
        self.enqueue_msg(&Message::Ping(PingPayload { nonce }))
    }

    /// Queues an orderly disconnect notice and marks the connection
    /// for close.
    pub fn send_disconnect(&mut self, do_not_retry: bool) -> NetworkResult<()> {
        self.enqueue_msg(&Message::Disconnect(DisconnectPayload { do_not_retry }))?;
        self.output.flush();
        self.status.marked_for_close = true;
        self.round.closed = true;
        Ok(())
    }

    fn halt(&mut self) {
        self.status.marked_for_close = true;
        self.status.halted_receive = true;
        self.round.closed = true;
    }

    /// Flushes any held batch and drains the queued output chunks for
    /// the socket writer.
    pub fn take_output_chunks(&mut self) -> Vec<Bytes> {
        self.output.flush();
        let mut chunks = Vec::new();
        while let Some(chunk) = self.output.pop_chunk() {
            chunks.push(chunk);
        }
        chunks
    }

    /// Flushes the output batch if it has aged past the hold policy.
    pub fn maybe_flush_output(&mut self, now: Instant) -> bool {
        self.output.maybe_flush(now)
    }

    /// Whether flushed output bytes are waiting for the socket.
    pub fn has_output(&self) -> bool {
        self.output.has_more()
    }

    /// Messages received on this connection that must be relayed to
    /// the rest of the network.
    pub fn take_pending_relay(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.pending_relay)
    }

    // Handler methods referenced by the protocol dispatch tables.

    pub(crate) fn msg_hello(&mut self, message: Message) -> NetworkResult<()> {
        let Message::Hello(hello) = message else {
            return Err(NetworkError::Configuration(
                "hello handler dispatched non-hello".into(),
            ));
        };
        if self.status.hello_received {
            return Err(NetworkError::ProtocolViolation {
                peer: self.peer_addr,
                violation: "duplicate hello".into(),
            });
        }
        if hello.network_num != self.network_num {
            return Err(NetworkError::ProtocolViolation {
                peer: self.peer_addr,
                violation: format!(
                    "network number {} does not match local {}",
                    hello.network_num, self.network_num
                ),
            });
        }

        if !hello.node_id.is_nil() {
            self.peer_id = Some(hello.node_id);
            self.round.node_id_assigned = Some(hello.node_id);
        }
        // Inbound sockets arrive from an ephemeral port; the hello
        // carries the port the peer actually listens on.
        if !self.from_me && hello.listen_port != 0 && hello.listen_port != self.peer_port {
            self.peer_port = hello.listen_port;
            self.round.port_corrected = Some(hello.listen_port);
        }
        self.status.hello_received = true;
        debug!(
            socket_id = self.socket_id,
            peer = %self.peer_addr,
            peer_id = %hello.node_id,
            "hello accepted"
        );
        self.enqueue_msg(&Message::Ack(AckPayload))
    }

    pub(crate) fn msg_ack(&mut self, message: Message) -> NetworkResult<()> {
        let Message::Ack(_) = message else {
            return Err(NetworkError::Configuration(
                "ack handler dispatched non-ack".into(),
            ));
        };
        if self.status.hello_acked {
            return Err(NetworkError::ProtocolViolation {
                peer: self.peer_addr,
                violation: "duplicate ack".into(),
            });
        }
        self.status.hello_acked = true;
        Ok(())
    }

    pub(crate) fn msg_ping(&mut self, message: Message) -> NetworkResult<()> {
        let Message::Ping(ping) = message else {
            return Err(NetworkError::Configuration(
                "ping handler dispatched non-ping".into(),
            ));
        };
        self.enqueue_msg(&Message::Pong(PongPayload { nonce: ping.nonce }))
    }

    pub(crate) fn msg_pong(&mut self, message: Message) -> NetworkResult<()> {
        let Message::Pong(pong) = message else {
            return Err(NetworkError::Configuration(
                "pong handler dispatched non-pong".into(),
            ));
        };
        let Some(sent_at) = self.ping_nonces.remove(&pong.nonce) else {
            debug!(
                socket_id = self.socket_id,
                nonce = pong.nonce,
                "pong with no matching ping, ignoring"
            );
            return Ok(());
        };
        let rtt = sent_at.elapsed();
        self.latency_samples.push(rtt);
        trace!(
            socket_id = self.socket_id,
            rtt_ms = rtt.as_millis() as u64,
            "latency sample recorded"
        );
        Ok(())
    }

    pub(crate) fn msg_broadcast_relay(&mut self, message: Message) -> NetworkResult<()> {
        let Message::Broadcast(ref broadcast) = message else {
            return Err(NetworkError::Configuration(
                "broadcast handler dispatched non-broadcast".into(),
            ));
        };
        if broadcast.network_num != self.network_num {
            return Err(NetworkError::ParseRejected {
                reason: format!(
                    "broadcast for network {} on network {}",
                    broadcast.network_num, self.network_num
                ),
            });
        }
        debug!(
            socket_id = self.socket_id,
            content_hash = %hex::encode(broadcast.content_hash),
            size = broadcast.content.len(),
            "relaying broadcast"
        );
        self.pending_relay.push(message);
        Ok(())
    }

    pub(crate) fn msg_tx_relay(&mut self, message: Message) -> NetworkResult<()> {
        let Message::Tx(ref tx) = message else {
            return Err(NetworkError::Configuration(
                "tx handler dispatched non-tx".into(),
            ));
        };
        if tx.network_num != self.network_num {
            return Err(NetworkError::ParseRejected {
                reason: format!(
                    "transaction for network {} on network {}",
                    tx.network_num, self.network_num
                ),
            });
        }
        self.pending_relay.push(message);
        Ok(())
    }

    pub(crate) fn msg_broadcast_consume(&mut self, message: Message) -> NetworkResult<()> {
        let Message::Broadcast(broadcast) = message else {
            return Err(NetworkError::Configuration(
                "broadcast handler dispatched non-broadcast".into(),
            ));
        };
        if broadcast.network_num != self.network_num {
            return Err(NetworkError::ParseRejected {
                reason: format!(
                    "broadcast for network {} on network {}",
                    broadcast.network_num, self.network_num
                ),
            });
        }
        debug!(
            socket_id = self.socket_id,
            content_hash = %hex::encode(broadcast.content_hash),
            "broadcast delivered locally"
        );
        Ok(())
    }

    pub(crate) fn msg_tx_consume(&mut self, message: Message) -> NetworkResult<()> {
        let Message::Tx(tx) = message else {
            return Err(NetworkError::Configuration(
                "tx handler dispatched non-tx".into(),
            ));
        };
        if tx.network_num != self.network_num {
            return Err(NetworkError::ParseRejected {
                reason: format!(
                    "transaction for network {} on network {}",
                    tx.network_num, self.network_num
                ),
            });
        }
        debug!(
            socket_id = self.socket_id,
            content_hash = %hex::encode(tx.tx_hash),
            "transaction delivered locally"
        );
        Ok(())
    }

    pub(crate) fn msg_disconnect(&mut self, message: Message) -> NetworkResult<()> {
        let Message::Disconnect(disconnect) = message else {
            return Err(NetworkError::Configuration(
                "disconnect handler dispatched non-disconnect".into(),
            ));
        };
        debug!(
            socket_id = self.socket_id,
            peer = %self.peer_addr,
            do_not_retry = disconnect.do_not_retry,
            "peer sent disconnect"
        );
        self.status.do_not_retry = disconnect.do_not_retry;
        self.halt();
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("socket_id", &self.socket_id)
            .field("peer_addr", &self.peer_addr)
            .field("from_me", &self.from_me)
            .field("peer_id", &self.peer_id)
            .field("status", &self.status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::payloads::{BroadcastPayload, TxPayload};
    use crate::p2p::protocol::protocol_for_model;
    use crate::validator::DefaultMessageValidator;
    use bdn_config::{NodeModel, CONTROL_FLAG_VALID, STARTING_SEQUENCE};
    use bdn_io::BinaryWriter;

    fn test_connection(from_me: bool) -> Connection {
        let validator: Arc<dyn MessageValidator> = Arc::new(DefaultMessageValidator::new());
        Connection::new(
            1,
            "10.0.0.9:43210".parse().expect("addr should parse"),
            from_me,
            ConnectionType::RELAY_ALL,
            1,
            Uuid::from_u128(1),
            9001,
            Arc::new(MessageFactory::new()),
            Arc::new(VersionManager::new().expect("manager should build")),
            validator,
            protocol_for_model(NodeModel::Relay).expect("protocol should build"),
        )
    }

    fn encode(message: &Message) -> Bytes {
        MessageFactory::new()
            .encode(message)
            .expect("encode should be ok")
    }

    fn peer_hello() -> Message {
        Message::Hello(HelloPayload::new(1, Uuid::from_u128(2), 9002))
    }

    fn establish(conn: &mut Connection) {
        conn.on_initialized().expect("init should be ok");
        conn.process_bytes(encode(&peer_hello()));
        let outcome = conn.process_bytes(encode(&Message::Ack(AckPayload)));
        assert!(outcome.established_now);
    }

    #[test]
    fn test_handshake_hello_then_ack_establishes() {
        let mut conn = test_connection(true);
        conn.on_initialized().expect("init should be ok");
        assert!(!conn.take_output_chunks().is_empty(), "hello should be queued");

        let outcome = conn.process_bytes(encode(&peer_hello()));
        assert_eq!(outcome.node_id_assigned, Some(Uuid::from_u128(2)));
        assert!(!conn.is_established());

        let outcome = conn.process_bytes(encode(&Message::Ack(AckPayload)));
        assert!(outcome.established_now);
        assert!(conn.is_established());
    }

    #[test]
    fn test_inbound_port_corrected_from_hello() {
        let mut conn = test_connection(false);
        conn.on_initialized().expect("init should be ok");
        assert_eq!(conn.peer_port(), 43210);

        let outcome = conn.process_bytes(encode(&peer_hello()));
        assert_eq!(outcome.port_corrected, Some(9002));
        assert_eq!(conn.peer_port(), 9002);
    }

    #[test]
    fn test_outbound_port_not_corrected() {
        let mut conn = test_connection(true);
        conn.on_initialized().expect("init should be ok");
        let outcome = conn.process_bytes(encode(&peer_hello()));
        assert_eq!(outcome.port_corrected, None);
        assert_eq!(conn.peer_port(), 43210);
    }

    #[test]
    fn test_network_mismatch_closes() {
        let mut conn = test_connection(true);
        conn.on_initialized().expect("init should be ok");
        let hello = Message::Hello(HelloPayload::new(99, Uuid::from_u128(2), 9002));
        let outcome = conn.process_bytes(encode(&hello));
        assert!(outcome.closed);
        assert!(conn.is_marked_for_close());
    }

    #[test]
    fn test_traffic_before_handshake_closes() {
        let mut conn = test_connection(true);
        conn.on_initialized().expect("init should be ok");
        let tx = Message::Tx(TxPayload {
            tx_hash: [7u8; 32],
            network_num: 1,
            source_id: Uuid::from_u128(3),
            content: vec![1, 2, 3],
        });
        let outcome = conn.process_bytes(encode(&tx));
        assert!(outcome.closed);
    }

    #[test]
    fn test_bad_message_threshold_closes() {
        let mut conn = test_connection(true);
        establish(&mut conn);

        // A valid frame with a corrupt control flag fails validation
        // but leaves the frame boundary intact.
        let mut bad = encode(&Message::Ping(PingPayload { nonce: 7 })).to_vec();
        let last = bad.len() - 1;
        bad[last] = 0x00;
        let bad = Bytes::from(bad);

        for round in 0..MAX_BAD_MESSAGES - 1 {
            let outcome = conn.process_bytes(bad.clone());
            assert!(!outcome.closed, "closed too early on round {round}");
        }
        let outcome = conn.process_bytes(bad);
        assert!(outcome.closed);
        assert!(conn.status.halted_receive);
    }

    #[test]
    fn test_good_message_resets_bad_count() {
        let mut conn = test_connection(true);
        establish(&mut conn);

        let mut bad = encode(&Message::Ping(PingPayload { nonce: 7 })).to_vec();
        let last = bad.len() - 1;
        bad[last] = 0x00;
        let bad = Bytes::from(bad);
        let good = encode(&Message::Ping(PingPayload { nonce: 8 }));

        for _ in 0..4 {
            conn.process_bytes(bad.clone());
            let outcome = conn.process_bytes(good.clone());
            assert!(!outcome.closed);
        }
        assert_eq!(conn.bad_message_count, 0);
    }

    #[test]
    fn test_magic_mismatch_halts_immediately() {
        let mut conn = test_connection(true);
        establish(&mut conn);
        let outcome = conn.process_bytes(Bytes::from_static(b"\x00\x00\x00\x00garbage"));
        assert!(outcome.closed);
        assert!(conn.status.halted_receive);
    }

    #[test]
    fn test_ping_replies_pong_and_pong_records_latency() {
        let mut conn = test_connection(true);
        establish(&mut conn);
        conn.take_output_chunks();

        conn.send_ping(Instant::now()).expect("ping should be ok");
        assert_eq!(conn.outstanding_pings(), 1);
        let nonce = *conn
            .ping_nonces
            .keys()
            .next()
            .expect("nonce should be recorded");

        let outcome = conn.process_bytes(encode(&Message::Pong(PongPayload { nonce })));
        assert!(!outcome.closed);
        assert_eq!(conn.outstanding_pings(), 0);
        assert_eq!(conn.latency_samples().len(), 1);
    }

    #[test]
    fn test_unknown_pong_nonce_is_ignored() {
        let mut conn = test_connection(true);
        establish(&mut conn);
        let outcome = conn.process_bytes(encode(&Message::Pong(PongPayload { nonce: 424242 })));
        assert!(!outcome.closed);
        assert_eq!(conn.bad_message_count, 0);
        assert!(conn.latency_samples().is_empty());
    }

    #[test]
    fn test_relay_queues_broadcast_for_fanout() {
        let mut conn = test_connection(true);
        establish(&mut conn);
        let broadcast = Message::Broadcast(BroadcastPayload {
            content_hash: [9u8; 32],
            network_num: 1,
            source_id: Uuid::from_u128(5),
            broadcast_type: *b"blck",
            content: vec![1, 2, 3, 4],
        });
        conn.process_bytes(encode(&broadcast));
        let pending = conn.take_pending_relay();
        assert_eq!(pending.len(), 1);
        assert!(conn.take_pending_relay().is_empty());
    }

    #[test]
    fn test_legacy_hello_parses_and_pins_version() {
        let mut conn = test_connection(false);
        conn.on_initialized().expect("init should be ok");

        // A v1 hello has no node id field: version, network, port.
        let mut writer = BinaryWriter::new();
        writer.write_u32(1);
        writer.write_u32(1);
        writer.write_u16(9002);
        let payload = writer.into_bytes();
        let mut frame = Vec::new();
        frame.extend_from_slice(&STARTING_SEQUENCE);
        frame.extend_from_slice(MessageCommand::HELLO.as_bytes());
        frame.extend_from_slice(&((payload.len() + 1) as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        frame.push(CONTROL_FLAG_VALID);

        let outcome = conn.process_bytes(Bytes::from(frame));
        assert!(!outcome.closed);
        assert_eq!(conn.peer_version(), Some(1));
        assert!(conn.status.hello_received);
        // Legacy peers have no node id to index by.
        assert_eq!(conn.peer_id(), None);
    }

    #[test]
    fn test_unsupported_hello_version_closes() {
        let mut conn = test_connection(false);
        conn.on_initialized().expect("init should be ok");

        let mut writer = BinaryWriter::new();
        writer.write_u32(250);
        writer.write_u32(1);
        writer.write_bytes(&[0u8; 16]);
        writer.write_u16(9002);
        let payload = writer.into_bytes();
        let mut frame = Vec::new();
        frame.extend_from_slice(&STARTING_SEQUENCE);
        frame.extend_from_slice(MessageCommand::HELLO.as_bytes());
        frame.extend_from_slice(&((payload.len() + 1) as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        frame.push(CONTROL_FLAG_VALID);

        let outcome = conn.process_bytes(Bytes::from(frame));
        assert!(outcome.closed);
    }

    #[test]
    fn test_disconnect_sets_do_not_retry() {
        let mut conn = test_connection(true);
        establish(&mut conn);
        let outcome = conn.process_bytes(encode(&Message::Disconnect(DisconnectPayload {
            do_not_retry: true,
        })));
        assert!(outcome.closed);
        assert!(conn.do_not_retry());
    }

    #[test]
    fn test_no_receive_after_disconnect_queued() {
        let mut conn = test_connection(true);
        establish(&mut conn);
        conn.send_disconnect(false).expect("disconnect should be ok");

        // A broadcast would otherwise be queued for fanout.
        let broadcast = Message::Broadcast(BroadcastPayload {
            content_hash: [3u8; 32],
            network_num: 1,
            source_id: Uuid::from_u128(5),
            broadcast_type: *b"blck",
            content: vec![1, 2, 3],
        });
        conn.process_bytes(encode(&broadcast));
        assert!(conn.take_pending_relay().is_empty());
    }

    #[test]
    fn test_split_frame_across_chunks() {
        let mut conn = test_connection(true);
        conn.on_initialized().expect("init should be ok");
        let frame = encode(&peer_hello());
        let (head, tail) = frame.split_at(7);

        let outcome = conn.process_bytes(Bytes::copy_from_slice(head));
        assert!(!conn.status.hello_received);
        assert!(!outcome.closed);

        conn.process_bytes(Bytes::copy_from_slice(tail));
        assert!(conn.status.hello_received);
    }
}
