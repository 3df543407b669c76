//! In-process handshake and keepalive scenario: two connection state
//! machines wired back to back by shuttling their output bytes.

use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use bdn_config::NodeModel;
use bdn_network::p2p::protocol::protocol_for_model;
use bdn_network::p2p::{Connection, ConnectionType};
use bdn_network::{DefaultMessageValidator, MessageFactory, MessageValidator, VersionManager};

fn connection(socket_id: usize, from_me: bool, node_id: u128, listen_port: u16) -> Connection {
    let validator: Arc<dyn MessageValidator> = Arc::new(DefaultMessageValidator::new());
    Connection::new(
        socket_id,
        format!("127.0.0.1:{}", 50000 + socket_id)
            .parse()
            .expect("addr should parse"),
        from_me,
        ConnectionType::RELAY_ALL,
        1,
        Uuid::from_u128(node_id),
        listen_port,
        Arc::new(MessageFactory::new()),
        Arc::new(VersionManager::new().expect("manager should build")),
        validator,
        protocol_for_model(NodeModel::Relay).expect("protocol should build"),
    )
}

/// Moves queued output between the two peers until both are idle.
fn shuttle(a: &mut Connection, b: &mut Connection) {
    loop {
        let mut moved = false;
        for chunk in a.take_output_chunks() {
            moved = true;
            b.process_bytes(chunk);
        }
        for chunk in b.take_output_chunks() {
            moved = true;
            a.process_bytes(chunk);
        }
        if !moved {
            break;
        }
    }
}

#[test]
fn test_hello_ack_establishes_both_sides() {
    let mut dialer = connection(1, true, 0xA, 9001);
    let mut listener = connection(2, false, 0xB, 9002);
    dialer.on_initialized().expect("init should be ok");
    listener.on_initialized().expect("init should be ok");

    shuttle(&mut dialer, &mut listener);

    assert!(dialer.is_established());
    assert!(listener.is_established());
    assert_eq!(dialer.peer_id(), Some(Uuid::from_u128(0xB)));
    assert_eq!(listener.peer_id(), Some(Uuid::from_u128(0xA)));
}

#[test]
fn test_ping_pong_records_latency_and_clears_nonce() {
    let mut dialer = connection(1, true, 0xA, 9001);
    let mut listener = connection(2, false, 0xB, 9002);
    dialer.on_initialized().expect("init should be ok");
    listener.on_initialized().expect("init should be ok");
    shuttle(&mut dialer, &mut listener);

    dialer.send_ping(Instant::now()).expect("ping should be ok");
    assert_eq!(dialer.outstanding_pings(), 1);

    shuttle(&mut dialer, &mut listener);

    assert_eq!(dialer.outstanding_pings(), 0, "nonce cleared after pong");
    assert_eq!(dialer.latency_samples().len(), 1);
    // The peer only answered; it never measured anything.
    assert_eq!(listener.latency_samples().len(), 0);
}

#[test]
fn test_inbound_side_learns_advertised_port() {
    let mut dialer = connection(1, true, 0xA, 9001);
    let mut listener = connection(2, false, 0xB, 9002);
    dialer.on_initialized().expect("init should be ok");
    listener.on_initialized().expect("init should be ok");
    shuttle(&mut dialer, &mut listener);

    // The listener saw an ephemeral source port but indexes the peer
    // under the port it advertised.
    assert_eq!(listener.peer_port(), 9001);
    // The dialer already knew the right port.
    assert_eq!(dialer.peer_port(), 50001);
}
