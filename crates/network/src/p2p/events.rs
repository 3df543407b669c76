//! Messages flowing into the central event loop.
//!
//! Socket tasks report I/O through [`NetEvent`]; the public handle and
//! alarm callbacks steer the loop through [`NodeCommand`]. The loop
//! task is the only owner of connection state, so everything that
//! touches it arrives on one of these two channels.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::messages::Message;

/// Event produced by an accept, read, or connect task.
#[derive(Debug)]
pub enum NetEvent {
    /// A TCP connection finished establishing. `from_me` is true for
    /// connections this node dialed.
    Established {
        peer: SocketAddr,
        stream: TcpStream,
        from_me: bool,
    },

    /// Raw bytes read from a peer's socket.
    Bytes { socket_id: usize, data: Bytes },

    /// The peer's socket reached EOF or errored out.
    Closed { socket_id: usize },

    /// An outbound dial failed before a socket existed.
    DialFailed { peer: SocketAddr },
}

/// Command sent into the event loop by [`crate::p2p::NodeHandle`] or by
/// alarm callbacks.
pub enum NodeCommand {
    /// Dial a peer now.
    Connect { peer: SocketAddr },

    /// Retry a previously failed peer; `attempt` drives the backoff.
    Retry { peer: SocketAddr, attempt: u32 },

    /// Send a keepalive ping on one connection.
    SendPing { socket_id: usize },

    /// Relay a message to every established connection matching the
    /// originating network.
    Broadcast { message: Message },

    /// Report how many connections are currently established.
    ConnectionCount { reply: oneshot::Sender<usize> },

    /// Drain output buffers whose flush hold expired.
    FlushOutputs,

    /// Stop the loop and close every connection.
    Shutdown,
}

impl std::fmt::Debug for NodeCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeCommand::Connect { peer } => f.debug_struct("Connect").field("peer", peer).finish(),
            NodeCommand::Retry { peer, attempt } => f
                .debug_struct("Retry")
                .field("peer", peer)
                .field("attempt", attempt)
                .finish(),
            NodeCommand::SendPing { socket_id } => f
                .debug_struct("SendPing")
                .field("socket_id", socket_id)
                .finish(),
            NodeCommand::Broadcast { message } => f
                .debug_struct("Broadcast")
                .field("command", &message.command())
                .finish(),
            NodeCommand::ConnectionCount { .. } => f.debug_struct("ConnectionCount").finish(),
            NodeCommand::FlushOutputs => write!(f, "FlushOutputs"),
            NodeCommand::Shutdown => write!(f, "Shutdown"),
        }
    }
}
