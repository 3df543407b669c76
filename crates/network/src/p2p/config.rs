//! Node networking configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use bdn_config::{NetworkNum, NodeModel};

/// Configuration for a [`crate::p2p::P2pNode`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address to listen on for inbound peers.
    pub listen_addr: IpAddr,

    /// Port to listen on for inbound peers.
    pub listen_port: u16,

    /// Logical network this node participates in. Peers on a different
    /// network number are rejected during the handshake.
    pub network_num: NetworkNum,

    /// This node's identity, announced in the hello message.
    pub node_id: Uuid,

    /// Role of this node; decides the handler table and ping policy.
    pub node_model: NodeModel,

    /// Peers to dial on startup.
    pub outbound_peers: Vec<SocketAddr>,

    /// Timeout for an outbound TCP connect.
    pub connect_timeout: Duration,

    /// Capacity of the socket-to-loop event channel.
    pub event_channel_capacity: usize,

    /// Capacity of each per-socket outbound write channel.
    pub write_channel_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 9001,
            network_num: 1,
            node_id: Uuid::new_v4(),
            node_model: NodeModel::Relay,
            outbound_peers: Vec::new(),
            connect_timeout: Duration::from_secs(10),
            event_channel_capacity: 1024,
            write_channel_capacity: 256,
        }
    }
}

impl NetworkConfig {
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn with_network_num(mut self, network_num: NetworkNum) -> Self {
        self.network_num = network_num;
        self
    }

    pub fn with_node_model(mut self, model: NodeModel) -> Self {
        self.node_model = model;
        self
    }

    pub fn with_outbound_peers(mut self, peers: Vec<SocketAddr>) -> Self {
        self.outbound_peers = peers;
        self
    }

    /// The socket address this node listens on.
    pub fn listen_socket(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.listen_port)
    }
}
