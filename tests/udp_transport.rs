//! Integration tests for the UDP client and server

mod common;

use std::net::UdpSocket;
use std::time::{Duration, Instant};

use peerlink::event::{self, EventKind, EventReceiver};
use peerlink::io::{Client, Server, Transport, UdpClient, UdpConfig, UdpServer, MAX_DATAGRAM_SIZE};
use peerlink::{Endpoint, TransportError};

use common::{next_data, next_matching, wait_until, PATIENCE};

fn fast() -> UdpConfig {
    UdpConfig::with_read_timeout(Duration::from_millis(50))
}

fn start_server() -> (UdpServer, EventReceiver) {
    common::init_tracing();
    let server = UdpServer::with_config(Endpoint::localhost("hub", 0), fast());
    let (listener, events) = event::channel();
    server.add_listener(listener);
    server.start().unwrap();
    (server, events)
}

fn client_for(server: &UdpServer, id: &str) -> (UdpClient, EventReceiver) {
    let addr = server.local_addr().unwrap();
    let client = UdpClient::with_config(Endpoint::from_socket_addr(id, addr), fast());
    let (listener, events) = event::channel();
    client.add_listener(listener);
    client.start().unwrap();
    (client, events)
}

#[test]
fn test_peers_learned_from_senders() {
    let (server, mut events) = start_server();
    let target = server.local_addr().unwrap();

    let senders: Vec<UdpSocket> = (0..3).map(|_| UdpSocket::bind("127.0.0.1:0").unwrap()).collect();
    for (i, sender) in senders.iter().enumerate() {
        sender.send_to(format!("hello {}", i).as_bytes(), target).unwrap();
        let event = next_data(&mut events);
        assert_eq!(event.endpoint(), &Endpoint::from_peer(sender.local_addr().unwrap()));
        assert_eq!(event.endpoint().id(), sender.local_addr().unwrap().to_string());
    }
    assert_eq!(server.clients().len(), 3);

    // A known sender does not add a peer
    senders[1].send_to(b"again", target).unwrap();
    next_data(&mut events);
    assert_eq!(server.clients().len(), 3);
}

#[test]
fn test_broadcast_to_learned_peers() {
    let (server, _events) = start_server();
    let target = server.local_addr().unwrap();

    let a = UdpSocket::bind("127.0.0.1:0").unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").unwrap();
    for socket in [&a, &b] {
        socket.set_read_timeout(Some(PATIENCE)).unwrap();
        socket.send_to(b"hi", target).unwrap();
    }
    wait_until("two peers", || server.clients().len() == 2);

    let report = Server::send(&server, b"broadcast").unwrap();
    assert_eq!(report.attempted(), 2);
    assert!(report.is_complete());

    let mut buf = [0u8; 64];
    for socket in [&a, &b] {
        let (n, from) = socket.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"broadcast");
        assert_eq!(from, target);
    }
}

#[test]
fn test_client_server_echo() {
    let (server, mut server_events) = start_server();
    let (client, mut client_events) = client_for(&server, "echo");

    client.send(b"marco").unwrap();
    let event = next_data(&mut server_events);
    assert_eq!(event.payload().unwrap().as_ref(), b"marco");
    assert_eq!(event.endpoint().port(), client.local_addr().unwrap().port());

    server.send_to(event.endpoint(), b"polo").unwrap();
    let reply = next_data(&mut client_events);
    assert_eq!(reply.payload().unwrap().as_ref(), b"polo");
    // A client tags everything with its configured endpoint
    assert_eq!(reply.endpoint(), client.endpoint());
}

#[test]
fn test_datagram_size_limit() {
    let (server, mut events) = start_server();
    let (client, _client_events) = client_for(&server, "big");

    let largest = vec![7u8; MAX_DATAGRAM_SIZE];
    client.send(&largest).unwrap();
    let event = next_data(&mut events);
    assert_eq!(event.payload().unwrap().len(), MAX_DATAGRAM_SIZE);

    let oversized = vec![7u8; MAX_DATAGRAM_SIZE + 1];
    assert!(matches!(
        client.send(&oversized),
        Err(TransportError::PayloadTooLarge { .. })
    ));
    assert!(matches!(
        Server::send(&server, &oversized),
        Err(TransportError::PayloadTooLarge { .. })
    ));
}

#[test]
fn test_server_reports_timeouts_with_own_endpoint() {
    let (server, mut events) = start_server();
    let event = next_matching(&mut events, "timeout event", |e| matches!(e.kind(), EventKind::Timeout));
    assert_eq!(event.endpoint(), server.endpoint());
    assert!(server.is_running());
}

#[test]
fn test_stop_is_prompt_and_restartable() {
    common::init_tracing();
    let config = UdpConfig::with_read_timeout(Duration::from_secs(30));
    let server = UdpServer::with_config(Endpoint::localhost("slow", 0), config);
    server.start().unwrap();

    let started = Instant::now();
    server.stop();
    assert!(started.elapsed() < PATIENCE);
    assert!(!server.is_running());
    server.stop();

    server.start().unwrap();
    assert!(server.is_running());
}

#[test]
fn test_server_send_without_peers() {
    let (server, _events) = start_server();
    assert!(matches!(
        Server::send(&server, b"anyone?"),
        Err(TransportError::NoPeersConnected)
    ));
}
