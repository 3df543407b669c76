//! Role-specific message dispatch.
//!
//! Each node model installs a handler table mapping known commands to
//! connection methods. Registration rejects duplicates; a command left
//! unregistered is simply dropped at dispatch time.

use std::collections::HashMap;
use std::sync::Arc;

use bdn_config::NodeModel;

use crate::error::{NetworkError, NetworkResult};
use crate::messages::{Message, MessageCommand};

use super::connection::Connection;

/// A message handler bound to a connection.
pub type Handler = fn(&mut Connection, Message) -> NetworkResult<()>;

/// Closed dispatch table over every known command.
pub struct MessageHandlers {
    table: HashMap<MessageCommand, Handler>,
}

impl MessageHandlers {
    fn builder() -> HandlersBuilder {
        HandlersBuilder {
            table: HashMap::new(),
        }
    }

    /// Looks up the handler for `command`. `None` means the command is
    /// recognized but this role does not act on it.
    pub fn get(&self, command: MessageCommand) -> Option<Handler> {
        self.table.get(&command).copied()
    }
}

#[derive(Debug)]
struct HandlersBuilder {
    table: HashMap<MessageCommand, Handler>,
}

impl HandlersBuilder {
    fn on(mut self, command: MessageCommand, handler: Handler) -> NetworkResult<Self> {
        if self.table.insert(command, handler).is_some() {
            return Err(NetworkError::Configuration(format!(
                "duplicate handler for command {command}"
            )));
        }
        Ok(self)
    }

    fn build(self) -> MessageHandlers {
        MessageHandlers { table: self.table }
    }
}

/// Per-role connection behavior: the handler table plus keepalive
/// policy.
pub trait ConnectionProtocol: Send + Sync {
    /// The dispatch table for inbound messages.
    fn handlers(&self) -> &MessageHandlers;

    /// Whether this side initiates keepalive pings.
    fn pings_peer(&self) -> bool;
}

/// Relay protocol: forwards broadcasts and transactions to the rest of
/// the network.
pub struct RelayProtocol {
    handlers: MessageHandlers,
}

impl RelayProtocol {
    pub fn new() -> NetworkResult<Self> {
        let handlers = MessageHandlers::builder()
            .on(MessageCommand::HELLO, Connection::msg_hello)?
            .on(MessageCommand::ACK, Connection::msg_ack)?
            .on(MessageCommand::PING, Connection::msg_ping)?
            .on(MessageCommand::PONG, Connection::msg_pong)?
            .on(MessageCommand::BROADCAST, Connection::msg_broadcast_relay)?
            .on(MessageCommand::TX, Connection::msg_tx_relay)?
            .on(MessageCommand::DISCONNECT, Connection::msg_disconnect)?
            .build();
        Ok(Self { handlers })
    }
}

impl ConnectionProtocol for RelayProtocol {
    fn handlers(&self) -> &MessageHandlers {
        &self.handlers
    }

    fn pings_peer(&self) -> bool {
        true
    }
}

/// Gateway protocol: terminates broadcasts and transactions locally
/// instead of relaying them, and leaves keepalive to the relay side.
pub struct GatewayProtocol {
    handlers: MessageHandlers,
}

impl GatewayProtocol {
    pub fn new() -> NetworkResult<Self> {
        let handlers = MessageHandlers::builder()
            .on(MessageCommand::HELLO, Connection::msg_hello)?
            .on(MessageCommand::ACK, Connection::msg_ack)?
            .on(MessageCommand::PING, Connection::msg_ping)?
            .on(MessageCommand::PONG, Connection::msg_pong)?
            .on(MessageCommand::BROADCAST, Connection::msg_broadcast_consume)?
            .on(MessageCommand::TX, Connection::msg_tx_consume)?
            .on(MessageCommand::DISCONNECT, Connection::msg_disconnect)?
            .build();
        Ok(Self { handlers })
    }
}

impl ConnectionProtocol for GatewayProtocol {
    fn handlers(&self) -> &MessageHandlers {
        &self.handlers
    }

    fn pings_peer(&self) -> bool {
        false
    }
}

/// Builds the protocol matching a node model.
pub fn protocol_for_model(model: NodeModel) -> NetworkResult<Arc<dyn ConnectionProtocol>> {
    Ok(match model {
        NodeModel::Relay => Arc::new(RelayProtocol::new()?),
        NodeModel::Gateway => Arc::new(GatewayProtocol::new()?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_table_is_closed_over_all_commands() {
        let protocol = RelayProtocol::new().expect("protocol should build");
        for command in MessageCommand::KNOWN {
            assert!(
                protocol.handlers().get(command).is_some(),
                "missing handler for {command}"
            );
        }
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let err = MessageHandlers::builder()
            .on(MessageCommand::PING, Connection::msg_ping)
            .expect("first registration should be ok")
            .on(MessageCommand::PING, Connection::msg_ping)
            .expect_err("second registration should fail");
        assert!(matches!(err, NetworkError::Configuration(_)));
    }

    #[test]
    fn test_partial_table_leaves_other_commands_unhandled() {
        let handlers = MessageHandlers::builder()
            .on(MessageCommand::PING, Connection::msg_ping)
            .expect("registration should be ok")
            .build();
        assert!(handlers.get(MessageCommand::PING).is_some());
        assert!(handlers.get(MessageCommand::BROADCAST).is_none());
    }

    #[test]
    fn test_ping_policy_differs_by_role() {
        let relay = RelayProtocol::new().expect("protocol should build");
        let gateway = GatewayProtocol::new().expect("protocol should build");
        assert!(relay.pings_peer());
        assert!(!gateway.pings_peer());
    }
}
