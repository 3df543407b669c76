//! Multi-index connection registry.
//!
//! One connection is reachable four ways: by socket id (dense vector),
//! by peer (ip, port), by announced node id, and by connection-type
//! bucket. The pool stores the index keys itself so lookups never take
//! a connection lock; the event loop reports key changes explicitly
//! through [`ConnectionPool::update_node_id`] and
//! [`ConnectionPool::update_port`].

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use tracing::debug;
use uuid::Uuid;

use crate::error::{NetworkError, NetworkResult};
use crate::p2p::{Connection, ConnectionType};

/// Shared handle to one connection's state.
pub type ConnectionHandle = Arc<Mutex<Connection>>;

struct Slot {
    handle: ConnectionHandle,
    ip: IpAddr,
    port: u16,
    node_id: Option<Uuid>,
    conn_type: ConnectionType,
}

/// Registry of live connections with peer-key and type indices.
#[derive(Default)]
pub struct ConnectionPool {
    by_socket_id: Vec<Option<Slot>>,
    by_ip_port: HashMap<(IpAddr, u16), usize>,
    by_node_id: HashMap<Uuid, usize>,
    by_type: HashMap<u16, BTreeSet<usize>>,
    count: usize,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Registers a connection under its socket id and peer address. A
    /// second connection for the same (ip, port) is rejected.
    pub fn add(
        &mut self,
        socket_id: usize,
        ip: IpAddr,
        port: u16,
        conn_type: ConnectionType,
        handle: ConnectionHandle,
    ) -> NetworkResult<()> {
        if self.by_ip_port.contains_key(&(ip, port)) {
            return Err(NetworkError::DuplicateConnection { ip, port });
        }
        self.ensure_capacity(socket_id);
        if self.by_socket_id[socket_id].is_some() {
            return Err(NetworkError::Configuration(format!(
                "socket id {socket_id} already registered"
            )));
        }

        self.by_socket_id[socket_id] = Some(Slot {
            handle,
            ip,
            port,
            node_id: None,
            conn_type,
        });
        self.by_ip_port.insert((ip, port), socket_id);
        for flag in ConnectionType::FLAGS {
            if conn_type.matches(flag) {
                self.by_type.entry(flag.bits()).or_default().insert(socket_id);
            }
        }
        self.count += 1;
        debug!(socket_id, %ip, port, "connection registered");
        Ok(())
    }

    fn ensure_capacity(&mut self, socket_id: usize) {
        if socket_id >= self.by_socket_id.len() {
            let new_len = (self.by_socket_id.len() * 2).max(socket_id + 1).max(8);
            self.by_socket_id.resize_with(new_len, || None);
        }
    }

    pub fn get_by_socket_id(&self, socket_id: usize) -> Option<&ConnectionHandle> {
        self.by_socket_id
            .get(socket_id)?
            .as_ref()
            .map(|slot| &slot.handle)
    }

    /// Looks a peer up by address, falling back to node id when the
    /// address key is stale (the peer reconnected from another port).
    pub fn get_by_ip_port(
        &self,
        ip: IpAddr,
        port: u16,
        node_id: Option<Uuid>,
    ) -> Option<&ConnectionHandle> {
        if let Some(&socket_id) = self.by_ip_port.get(&(ip, port)) {
            return self.get_by_socket_id(socket_id);
        }
        node_id.and_then(|id| self.get_by_node_id(id))
    }

    pub fn get_by_node_id(&self, node_id: Uuid) -> Option<&ConnectionHandle> {
        let socket_id = *self.by_node_id.get(&node_id)?;
        self.get_by_socket_id(socket_id)
    }

    /// Whether a connection is registered for exactly this peer
    /// address.
    pub fn has_connection(&self, ip: IpAddr, port: u16) -> bool {
        self.by_ip_port.contains_key(&(ip, port))
    }

    /// Records the node id announced for `socket_id`. Returns the
    /// handle previously registered under that id, if any; the caller
    /// decides which duplicate to keep.
    pub fn update_node_id(
        &mut self,
        socket_id: usize,
        node_id: Uuid,
    ) -> Option<ConnectionHandle> {
        let previous = self
            .by_node_id
            .get(&node_id)
            .filter(|&&existing| existing != socket_id)
            .and_then(|&existing| self.get_by_socket_id(existing))
            .cloned();

        let slot = self.by_socket_id.get_mut(socket_id)?.as_mut()?;
        if let Some(old_id) = slot.node_id.replace(node_id) {
            if old_id != node_id {
                self.by_node_id.remove(&old_id);
            }
        }
        if previous.is_none() {
            self.by_node_id.insert(node_id, socket_id);
        }
        previous
    }

    /// Moves a connection to its corrected peer port after the hello
    /// announced a listen port differing from the socket's source port.
    pub fn update_port(&mut self, socket_id: usize, new_port: u16) -> NetworkResult<()> {
        let Some(Some(slot)) = self.by_socket_id.get_mut(socket_id) else {
            return Ok(());
        };
        if slot.port == new_port {
            return Ok(());
        }
        let ip = slot.ip;
        if self.by_ip_port.contains_key(&(ip, new_port)) {
            return Err(NetworkError::DuplicateConnection { ip, port: new_port });
        }
        let old_port = slot.port;
        slot.port = new_port;
        self.by_ip_port.remove(&(ip, old_port));
        self.by_ip_port.insert((ip, new_port), socket_id);
        debug!(socket_id, %ip, old_port, new_port, "peer port reindexed");
        Ok(())
    }

    /// Removes a connection, clearing every index. The handle must
    /// still be the one registered for `socket_id`; a stale delete
    /// after the slot was reused is a no-op.
    pub fn delete(&mut self, socket_id: usize, handle: &ConnectionHandle) -> bool {
        let Some(Some(slot)) = self.by_socket_id.get(socket_id) else {
            return false;
        };
        if !Arc::ptr_eq(&slot.handle, handle) {
            return false;
        }
        let Some(slot) = self.by_socket_id[socket_id].take() else {
            return false;
        };
        if self.by_ip_port.get(&(slot.ip, slot.port)) == Some(&socket_id) {
            self.by_ip_port.remove(&(slot.ip, slot.port));
        }
        if let Some(node_id) = slot.node_id {
            if self.by_node_id.get(&node_id) == Some(&socket_id) {
                self.by_node_id.remove(&node_id);
            }
        }
        for bucket in self.by_type.values_mut() {
            bucket.remove(&socket_id);
        }
        self.count -= 1;
        debug!(socket_id, ip = %slot.ip, port = slot.port, "connection removed");
        true
    }

    /// Connections whose type has any bit in common with `mask`.
    pub fn get_by_type(&self, mask: ConnectionType) -> Vec<ConnectionHandle> {
        let mut socket_ids = BTreeSet::new();
        for flag in ConnectionType::FLAGS {
            if mask.matches(flag) {
                if let Some(bucket) = self.by_type.get(&flag.bits()) {
                    socket_ids.extend(bucket.iter().copied());
                }
            }
        }
        socket_ids
            .into_iter()
            .filter_map(|id| self.get_by_socket_id(id).cloned())
            .collect()
    }

    /// Cloned snapshot of every handle, safe to walk while the pool is
    /// mutated.
    pub fn connections_alive(&self) -> Vec<ConnectionHandle> {
        self.by_socket_id
            .iter()
            .flatten()
            .map(|slot| slot.handle.clone())
            .collect()
    }

    /// Borrow-based walk over registered handles with their socket ids.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &ConnectionHandle)> {
        self.by_socket_id
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|slot| (id, &slot.handle)))
    }
}
