//! Socket tasks and the central event loop.
//!
//! Task layout: one accept task, one read task and one write task per
//! socket, one detached stats task, and a single central loop task.
//! The central task is the sole owner of the connection pool and the
//! alarm queue; socket tasks only move bytes, so connection state
//! needs no cross-task synchronization beyond the per-handle mutex the
//! pool hands out.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use bdn_config::{
    CONNECT_RETRY_BASE, CONNECT_RETRY_CAP, MAX_CONNECT_RETRIES, OUTPUT_FLUSH_HOLD, PING_INTERVAL,
};

use crate::alarm::{AlarmId, AlarmQueue};
use crate::error::{NetworkError, NetworkResult};
use crate::messages::{Message, MessageFactory};
use crate::pool::{ConnectionHandle, ConnectionPool};
use crate::validator::MessageValidator;
use crate::version::VersionManager;

use super::config::NetworkConfig;
use super::connection::{Connection, ConnectionType, ProcessOutcome};
use super::events::{NetEvent, NodeCommand};
use super::protocol::{protocol_for_model, ConnectionProtocol};

const READ_BUFFER_SIZE: usize = 64 * 1024;
const STATS_CHANNEL_CAPACITY: usize = 1024;
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Traffic counters forwarded fire-and-forget to the stats task.
#[derive(Debug, Clone, Copy)]
enum StatsEvent {
    BytesIn(usize),
    BytesOut(usize),
    MessageRelayed,
    ConnectionEstablished,
    ConnectionClosed,
}

/// The node's networking front end. Construction wires the injected
/// collaborators; [`P2pNode::start`] binds the listener and spawns the
/// task set.
pub struct P2pNode {
    config: NetworkConfig,
    factory: Arc<MessageFactory>,
    version_manager: Arc<VersionManager>,
    validator: Arc<dyn MessageValidator>,
    protocol: Arc<dyn ConnectionProtocol>,
}

impl P2pNode {
    pub fn new(
        config: NetworkConfig,
        factory: Arc<MessageFactory>,
        version_manager: Arc<VersionManager>,
        validator: Arc<dyn MessageValidator>,
    ) -> NetworkResult<Self> {
        let protocol = protocol_for_model(config.node_model)?;
        Ok(Self {
            config,
            factory,
            version_manager,
            validator,
            protocol,
        })
    }

    /// Binds the listener, spawns the accept/stats/loop tasks, and
    /// dials the configured peers.
    pub async fn start(mut self) -> NetworkResult<NodeHandle> {
        let listener = TcpListener::bind(self.config.listen_socket())
            .await
            .map_err(|err| NetworkError::Connection(format!("bind failed: {err}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| NetworkError::Connection(format!("local addr: {err}")))?;
        // Helloes advertise the port actually bound, which matters
        // when the OS assigned it.
        self.config.listen_port = local_addr.port();
        info!(%local_addr, network_num = self.config.network_num, "listening for peers");

        let (event_tx, event_rx) = mpsc::channel(self.config.event_channel_capacity);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let stats_tx = spawn_stats_task();

        spawn_accept_task(listener, event_tx.clone());

        for peer in &self.config.outbound_peers {
            let _ = cmd_tx.send(NodeCommand::Connect { peer: *peer });
        }

        let mut event_loop = EventLoop::new(self, event_tx, cmd_tx.clone(), stats_tx);
        let task = tokio::spawn(async move { event_loop.run(event_rx, cmd_rx).await });

        Ok(NodeHandle {
            cmd_tx,
            local_addr,
            task,
        })
    }
}

/// Control handle returned by [`P2pNode::start`].
pub struct NodeHandle {
    cmd_tx: mpsc::UnboundedSender<NodeCommand>,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl NodeHandle {
    /// The bound listen address, with the OS-assigned port resolved.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Asks the node to dial a peer.
    pub fn connect(&self, peer: SocketAddr) {
        let _ = self.cmd_tx.send(NodeCommand::Connect { peer });
    }

    /// Queues a message for relay to every established connection.
    pub fn broadcast(&self, message: Message) {
        let _ = self.cmd_tx.send(NodeCommand::Broadcast { message });
    }

    /// Number of fully established connections.
    pub async fn connection_count(&self) -> usize {
        let (reply, response) = oneshot::channel();
        if self
            .cmd_tx
            .send(NodeCommand::ConnectionCount { reply })
            .is_err()
        {
            return 0;
        }
        response.await.unwrap_or(0)
    }

    /// Stops the event loop, notifying peers with a disconnect notice.
    pub async fn shutdown(self) {
        let _ = self.cmd_tx.send(NodeCommand::Shutdown);
        let _ = self.task.await;
    }
}

struct SocketEntry {
    writer: mpsc::Sender<Bytes>,
    read_task: JoinHandle<()>,
    ping_alarm: Option<AlarmId>,
    peer: SocketAddr,
    from_me: bool,
}

/// State owned exclusively by the central loop task.
struct EventLoop {
    config: NetworkConfig,
    factory: Arc<MessageFactory>,
    version_manager: Arc<VersionManager>,
    validator: Arc<dyn MessageValidator>,
    protocol: Arc<dyn ConnectionProtocol>,
    pool: ConnectionPool,
    alarms: AlarmQueue,
    sockets: HashMap<usize, SocketEntry>,
    retry_attempts: HashMap<SocketAddr, u32>,
    next_socket_id: usize,
    event_tx: mpsc::Sender<NetEvent>,
    cmd_tx: mpsc::UnboundedSender<NodeCommand>,
    stats_tx: mpsc::Sender<StatsEvent>,
}

impl EventLoop {
    fn new(
        node: P2pNode,
        event_tx: mpsc::Sender<NetEvent>,
        cmd_tx: mpsc::UnboundedSender<NodeCommand>,
        stats_tx: mpsc::Sender<StatsEvent>,
    ) -> Self {
        let mut alarms = AlarmQueue::new();
        let flush_tx = cmd_tx.clone();
        alarms.register_alarm(
            OUTPUT_FLUSH_HOLD,
            Box::new(move || {
                let _ = flush_tx.send(NodeCommand::FlushOutputs);
                Some(OUTPUT_FLUSH_HOLD)
            }),
        );
        Self {
            config: node.config,
            factory: node.factory,
            version_manager: node.version_manager,
            validator: node.validator,
            protocol: node.protocol,
            pool: ConnectionPool::new(),
            alarms,
            sockets: HashMap::new(),
            retry_attempts: HashMap::new(),
            next_socket_id: 0,
            event_tx,
            cmd_tx,
            stats_tx,
        }
    }

    async fn run(
        &mut self,
        mut event_rx: mpsc::Receiver<NetEvent>,
        mut cmd_rx: mpsc::UnboundedReceiver<NodeCommand>,
    ) {
        loop {
            let sleep_for = self
                .alarms
                .time_to_next_alarm()
                .unwrap_or(Duration::from_secs(1));
            tokio::select! {
                event = event_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                command = cmd_rx.recv() => match command {
                    Some(NodeCommand::Shutdown) => {
                        self.shutdown().await;
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                _ = tokio::time::sleep(sleep_for) => {}
            }
            self.alarms.fire_ready_alarms();
        }
        debug!("event loop stopped");
    }

    async fn handle_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Established {
                peer,
                stream,
                from_me,
            } => self.on_established(peer, stream, from_me).await,
            NetEvent::Bytes { socket_id, data } => {
                let _ = self.stats_tx.try_send(StatsEvent::BytesIn(data.len()));
                self.on_bytes(socket_id, data).await;
            }
            NetEvent::Closed { socket_id } => self.on_closed(socket_id).await,
            NetEvent::DialFailed { peer } => self.schedule_retry(peer),
        }
    }

    async fn handle_command(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::Connect { peer } | NodeCommand::Retry { peer, .. } => {
                self.dial(peer);
            }
            NodeCommand::SendPing { socket_id } => {
                let Some(handle) = self.pool.get_by_socket_id(socket_id).cloned() else {
                    return;
                };
                {
                    let mut conn = lock_conn(&handle);
                    if let Err(err) = conn.send_ping(Instant::now()) {
                        warn!(socket_id, error = %err, "failed to queue ping");
                    }
                }
                self.drain_output(socket_id, &handle).await;
            }
            NodeCommand::Broadcast { message } => {
                self.relay(&message, None).await;
            }
            NodeCommand::ConnectionCount { reply } => {
                let count = self
                    .pool
                    .connections_alive()
                    .iter()
                    .filter(|handle| lock_conn(handle).is_established())
                    .count();
                let _ = reply.send(count);
            }
            NodeCommand::FlushOutputs => {
                let now = Instant::now();
                let pending: Vec<(usize, ConnectionHandle)> = self
                    .pool
                    .iter()
                    .filter(|(_, handle)| {
                        let mut conn = lock_conn(handle);
                        conn.maybe_flush_output(now);
                        conn.has_output()
                    })
                    .map(|(id, handle)| (id, handle.clone()))
                    .collect();
                for (socket_id, handle) in pending {
                    self.drain_output(socket_id, &handle).await;
                }
            }
            NodeCommand::Shutdown => {
                // Handled in the select loop directly.
            }
        }
    }

    async fn on_established(&mut self, peer: SocketAddr, stream: TcpStream, from_me: bool) {
        if self.pool.has_connection(peer.ip(), peer.port()) {
            debug!(%peer, "dropping duplicate socket for known peer");
            return;
        }
        let socket_id = self.next_socket_id;
        self.next_socket_id += 1;

        let (read_half, write_half) = stream.into_split();
        let read_task = spawn_read_task(socket_id, read_half, self.event_tx.clone());
        let writer = spawn_write_task(write_half, self.config.write_channel_capacity);

        // Dialed peers are relay addresses from configuration or
        // discovery; inbound peers are treated as gateways.
        let conn_type = if from_me {
            ConnectionType::RELAY_ALL
        } else {
            ConnectionType::GATEWAY
        };
        let mut connection = Connection::new(
            socket_id,
            peer,
            from_me,
            conn_type,
            self.config.network_num,
            self.config.node_id,
            self.config.listen_port,
            Arc::clone(&self.factory),
            Arc::clone(&self.version_manager),
            Arc::clone(&self.validator),
            Arc::clone(&self.protocol),
        );
        if let Err(err) = connection.on_initialized() {
            warn!(%peer, error = %err, "failed to queue opening hello");
            read_task.abort();
            return;
        }

        let handle: ConnectionHandle = Arc::new(Mutex::new(connection));
        if let Err(err) = self
            .pool
            .add(socket_id, peer.ip(), peer.port(), conn_type, handle.clone())
        {
            warn!(%peer, error = %err, "connection not registered");
            read_task.abort();
            return;
        }
        self.sockets.insert(
            socket_id,
            SocketEntry {
                writer,
                read_task,
                ping_alarm: None,
                peer,
                from_me,
            },
        );
        debug!(socket_id, %peer, from_me, "connection initialized");
        self.drain_output(socket_id, &handle).await;
    }

    async fn on_bytes(&mut self, socket_id: usize, data: Bytes) {
        let Some(handle) = self.pool.get_by_socket_id(socket_id).cloned() else {
            return;
        };
        let (outcome, relay) = {
            let mut conn = lock_conn(&handle);
            let outcome = conn.process_bytes(data);
            (outcome, conn.take_pending_relay())
        };
        self.apply_outcome(socket_id, &handle, outcome).await;
        for message in relay {
            let _ = self.stats_tx.try_send(StatsEvent::MessageRelayed);
            self.relay(&message, Some(socket_id)).await;
        }
        self.drain_output(socket_id, &handle).await;
    }

    async fn apply_outcome(
        &mut self,
        socket_id: usize,
        handle: &ConnectionHandle,
        outcome: ProcessOutcome,
    ) {
        if let Some(node_id) = outcome.node_id_assigned {
            if self.pool.update_node_id(socket_id, node_id).is_some() {
                warn!(
                    socket_id,
                    %node_id,
                    "duplicate peer node id, closing newer connection"
                );
                let _ = lock_conn(handle).send_disconnect(true);
                self.drain_output(socket_id, handle).await;
                self.teardown(socket_id, handle, false).await;
                return;
            }
        }
        if let Some(port) = outcome.port_corrected {
            if let Err(err) = self.pool.update_port(socket_id, port) {
                warn!(socket_id, port, error = %err, "port correction rejected");
                self.teardown(socket_id, handle, false).await;
                return;
            }
        }
        if outcome.established_now {
            let peer = lock_conn(handle).peer_addr();
            info!(socket_id, %peer, "connection established");
            let _ = self.stats_tx.try_send(StatsEvent::ConnectionEstablished);
            self.retry_attempts.remove(&peer);
            if self.protocol.pings_peer() {
                let ping_tx = self.cmd_tx.clone();
                let alarm = self.alarms.register_alarm(
                    PING_INTERVAL,
                    Box::new(move || {
                        let _ = ping_tx.send(NodeCommand::SendPing { socket_id });
                        Some(PING_INTERVAL)
                    }),
                );
                if let Some(entry) = self.sockets.get_mut(&socket_id) {
                    entry.ping_alarm = Some(alarm);
                }
            }
        }
        if outcome.closed {
            self.teardown(socket_id, handle, true).await;
        }
    }

    /// Fans a message out to every established connection except the
    /// one it arrived on.
    async fn relay(&mut self, message: &Message, except: Option<usize>) {
        let targets: Vec<(usize, ConnectionHandle)> = self
            .pool
            .connections_alive()
            .into_iter()
            .filter_map(|handle| {
                let conn = lock_conn(&handle);
                let socket_id = conn.socket_id();
                if Some(socket_id) == except || !conn.is_established() {
                    return None;
                }
                drop(conn);
                Some((socket_id, handle))
            })
            .collect();
        for (socket_id, handle) in targets {
            if let Err(err) = lock_conn(&handle).enqueue_msg(message) {
                warn!(socket_id, error = %err, "relay enqueue failed");
                continue;
            }
            self.drain_output(socket_id, &handle).await;
        }
    }

    async fn on_closed(&mut self, socket_id: usize) {
        let Some(handle) = self.pool.get_by_socket_id(socket_id).cloned() else {
            return;
        };
        self.teardown(socket_id, &handle, true).await;
    }

    /// Removes the connection from every index, stops its socket
    /// tasks, cancels its alarms, and schedules a redial when policy
    /// allows.
    async fn teardown(&mut self, socket_id: usize, handle: &ConnectionHandle, retry: bool) {
        if !self.pool.delete(socket_id, handle) {
            return;
        }
        let _ = self.stats_tx.try_send(StatsEvent::ConnectionClosed);
        let (peer, from_me, do_not_retry) = {
            let conn = lock_conn(handle);
            (conn.peer_addr(), conn.from_me(), conn.do_not_retry())
        };
        if let Some(entry) = self.sockets.remove(&socket_id) {
            entry.read_task.abort();
            if let Some(alarm) = entry.ping_alarm {
                self.alarms.unregister_alarm(&alarm);
            }
            // Dropping the writer sender ends the write task.
            drop(entry.writer);
        }
        info!(socket_id, %peer, "connection closed");
        if retry && from_me && !do_not_retry {
            self.schedule_retry(peer);
        }
    }

    fn schedule_retry(&mut self, peer: SocketAddr) {
        let attempt = self.retry_attempts.entry(peer).or_insert(0);
        *attempt += 1;
        if *attempt > MAX_CONNECT_RETRIES {
            warn!(%peer, "retry budget exhausted, giving up on peer");
            self.retry_attempts.remove(&peer);
            return;
        }
        let exponent = (*attempt - 1).min(31);
        let delay = CONNECT_RETRY_BASE
            .saturating_mul(1u32 << exponent)
            .min(CONNECT_RETRY_CAP);
        let attempt = *attempt;
        debug!(%peer, attempt, delay_secs = delay.as_secs(), "scheduling reconnect");
        let retry_tx = self.cmd_tx.clone();
        self.alarms.register_alarm(
            delay,
            Box::new(move || {
                let _ = retry_tx.send(NodeCommand::Retry { peer, attempt });
                None
            }),
        );
    }

    fn dial(&mut self, peer: SocketAddr) {
        if self.pool.has_connection(peer.ip(), peer.port()) {
            trace!(%peer, "already connected, skipping dial");
            return;
        }
        let event_tx = self.event_tx.clone();
        let timeout = self.config.connect_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, TcpStream::connect(peer)).await {
                Ok(Ok(stream)) => {
                    let _ = event_tx
                        .send(NetEvent::Established {
                            peer,
                            stream,
                            from_me: true,
                        })
                        .await;
                }
                Ok(Err(err)) => {
                    debug!(%peer, error = %err, "dial failed");
                    let _ = event_tx.send(NetEvent::DialFailed { peer }).await;
                }
                Err(_) => {
                    debug!(%peer, "dial timed out");
                    let _ = event_tx.send(NetEvent::DialFailed { peer }).await;
                }
            }
        });
    }

    /// Moves flushed output chunks to the socket's write task.
    async fn drain_output(&mut self, socket_id: usize, handle: &ConnectionHandle) {
        let chunks = lock_conn(handle).take_output_chunks();
        if chunks.is_empty() {
            return;
        }
        let Some(entry) = self.sockets.get(&socket_id) else {
            return;
        };
        for chunk in chunks {
            let _ = self.stats_tx.try_send(StatsEvent::BytesOut(chunk.len()));
            if entry.writer.send(chunk).await.is_err() {
                // Write task gone; the read side will report the close.
                break;
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("shutting down network node");
        let handles: Vec<(usize, ConnectionHandle)> =
            self.pool.iter().map(|(id, h)| (id, h.clone())).collect();
        for (socket_id, handle) in handles {
            let _ = lock_conn(&handle).send_disconnect(false);
            self.drain_output(socket_id, &handle).await;
            self.teardown(socket_id, &handle, false).await;
        }
    }
}

/// Locks a connection handle. Only the loop task ever locks for
/// mutation, so a poisoned lock can only come from a panicking reader;
/// the state itself is still consistent.
fn lock_conn(handle: &ConnectionHandle) -> MutexGuard<'_, Connection> {
    match handle.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn spawn_accept_task(listener: TcpListener, event_tx: mpsc::Sender<NetEvent>) {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    if event_tx
                        .send(NetEvent::Established {
                            peer,
                            stream,
                            from_me: false,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                }
            }
        }
    });
}

fn spawn_read_task(
    socket_id: usize,
    mut read_half: OwnedReadHalf,
    event_tx: mpsc::Sender<NetEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
        loop {
            match read_half.read_buf(&mut buffer).await {
                Ok(0) => break,
                Ok(_) => {
                    let data = buffer.split().freeze();
                    if event_tx
                        .send(NetEvent::Bytes { socket_id, data })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(err) => {
                    trace!(socket_id, error = %err, "socket read error");
                    break;
                }
            }
        }
        let _ = event_tx.send(NetEvent::Closed { socket_id }).await;
    })
}

fn spawn_write_task(mut write_half: OwnedWriteHalf, capacity: usize) -> mpsc::Sender<Bytes> {
    let (tx, mut rx) = mpsc::channel::<Bytes>(capacity);
    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if let Err(err) = write_half.write_all(&chunk).await {
                trace!(error = %err, "socket write error");
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });
    tx
}

/// Detached aggregation task; every producer uses `try_send`, so a
/// full channel drops samples instead of blocking the hot path.
fn spawn_stats_task() -> mpsc::Sender<StatsEvent> {
    let (tx, mut rx) = mpsc::channel::<StatsEvent>(STATS_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut bytes_in: u64 = 0;
        let mut bytes_out: u64 = 0;
        let mut relayed: u64 = 0;
        let mut established: u64 = 0;
        let mut closed: u64 = 0;
        let mut ticker = tokio::time::interval(STATS_LOG_INTERVAL);
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(StatsEvent::BytesIn(n)) => bytes_in += n as u64,
                    Some(StatsEvent::BytesOut(n)) => bytes_out += n as u64,
                    Some(StatsEvent::MessageRelayed) => relayed += 1,
                    Some(StatsEvent::ConnectionEstablished) => established += 1,
                    Some(StatsEvent::ConnectionClosed) => closed += 1,
                    None => break,
                },
                _ = ticker.tick() => {
                    debug!(
                        bytes_in,
                        bytes_out,
                        relayed,
                        established,
                        closed,
                        "traffic stats"
                    );
                }
            }
        }
    });
    tx
}
