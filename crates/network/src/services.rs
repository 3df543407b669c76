//! Collaborator interfaces consumed by the network core.
//!
//! The core only drives connections; peer discovery and transaction
//! interpretation are provided by the embedding process. Declared here
//! as traits so the node binary wires concrete implementations in.

use std::net::SocketAddr;

use async_trait::async_trait;
use uuid::Uuid;

use bdn_config::NetworkNum;

use crate::error::NetworkResult;
use crate::messages::payloads::TxPayload;

/// Discovery and registration against the network's control plane.
#[async_trait]
pub trait SdnClient: Send + Sync {
    /// Registers this node and returns its assigned identity.
    async fn register_node(
        &self,
        network_num: NetworkNum,
        listen_addr: SocketAddr,
    ) -> NetworkResult<Uuid>;

    /// Fetches the relay peers this node should connect to.
    async fn fetch_peers(&self, network_num: NetworkNum) -> NetworkResult<Vec<SocketAddr>>;
}

/// Interpretation of transaction payloads beyond wire framing.
pub trait TransactionService: Send + Sync {
    /// Validates a transaction's content before it is relayed.
    fn validate_content(&self, tx: &TxPayload) -> NetworkResult<()>;
}
