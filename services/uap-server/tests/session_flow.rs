//! End-to-end session exchanges against a real server socket.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uap_protocol::{Command, Packet};
use uap_server::{Server, ServerConfig};

const SID: u32 = 0x1234;

async fn start_server(
    inactivity_timeout: Duration,
) -> (SocketAddr, watch::Sender<bool>, JoinHandle<std::io::Result<()>>) {
    let server = Server::bind(&ServerConfig {
        port: 0,
        inactivity_timeout,
    })
    .await
    .expect("bind");
    let port = server.local_addr().expect("local_addr").port();
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move { server.run(shutdown_rx).await });
    (addr, shutdown_tx, task)
}

async fn client_socket(server: SocketAddr) -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind client");
    socket.connect(server).await.expect("connect client");
    socket
}

async fn send(socket: &UdpSocket, packet: &Packet) {
    socket.send(&packet.encode()).await.expect("send");
}

async fn recv_packet(socket: &UdpSocket) -> Packet {
    let mut buf = [0u8; 4096];
    let len = timeout(Duration::from_secs(1), socket.recv(&mut buf))
        .await
        .expect("timed out waiting for a reply")
        .expect("recv");
    Packet::decode(&buf[..len]).expect("decode reply")
}

async fn expect_silence(socket: &UdpSocket) {
    let mut buf = [0u8; 4096];
    let result = timeout(Duration::from_millis(300), socket.recv(&mut buf)).await;
    assert!(result.is_err(), "expected no reply, got one");
}

#[tokio::test]
async fn hello_data_goodbye_round_trip() {
    let (addr, _shutdown, _task) = start_server(Duration::from_secs(1000)).await;
    let socket = client_socket(addr).await;

    send(&socket, &Packet::control(Command::Hello, 0, SID, 1)).await;
    let alive = recv_packet(&socket).await;
    assert_eq!(alive.command, Command::Alive);
    assert_eq!(alive.seq, 1);
    assert_eq!(alive.session_id, SID);

    send(&socket, &Packet::data(1, SID, 2, "abc")).await;
    let alive = recv_packet(&socket).await;
    assert_eq!(alive.command, Command::Alive);
    assert_eq!(alive.seq, 2);

    send(&socket, &Packet::control(Command::Goodbye, 2, SID, 3)).await;
    let goodbye = recv_packet(&socket).await;
    assert_eq!(goodbye.command, Command::Goodbye);
    assert_eq!(goodbye.seq, 3);
}

#[tokio::test]
async fn duplicate_data_gets_no_reply() {
    let (addr, _shutdown, _task) = start_server(Duration::from_secs(1000)).await;
    let socket = client_socket(addr).await;

    send(&socket, &Packet::control(Command::Hello, 0, SID, 1)).await;
    recv_packet(&socket).await;
    send(&socket, &Packet::data(1, SID, 2, "x")).await;
    recv_packet(&socket).await;

    send(&socket, &Packet::data(1, SID, 3, "x")).await;
    expect_silence(&socket).await;
}

#[tokio::test]
async fn gap_is_accepted_and_acked_past_the_losses() {
    let (addr, _shutdown, _task) = start_server(Duration::from_secs(1000)).await;
    let socket = client_socket(addr).await;

    send(&socket, &Packet::control(Command::Hello, 0, SID, 1)).await;
    recv_packet(&socket).await;

    send(&socket, &Packet::data(3, SID, 2, "y")).await;
    let alive = recv_packet(&socket).await;
    assert_eq!(alive.command, Command::Alive);
    assert_eq!(alive.seq, 4);
}

#[tokio::test]
async fn regression_terminates_session_and_id_is_reusable() {
    let (addr, _shutdown, _task) = start_server(Duration::from_secs(1000)).await;
    let socket = client_socket(addr).await;

    send(&socket, &Packet::control(Command::Hello, 0, SID, 1)).await;
    recv_packet(&socket).await;
    send(&socket, &Packet::data(5, SID, 2, "a")).await;
    recv_packet(&socket).await;

    send(&socket, &Packet::data(2, SID, 3, "b")).await;
    let goodbye = recv_packet(&socket).await;
    assert_eq!(goodbye.command, Command::Goodbye);
    assert_eq!(goodbye.seq, 3);

    // A fresh HELLO with the same id starts over.
    send(&socket, &Packet::control(Command::Hello, 0, SID, 4)).await;
    let alive = recv_packet(&socket).await;
    assert_eq!(alive.command, Command::Alive);
    assert_eq!(alive.seq, 1);
}

#[tokio::test]
async fn runt_and_bad_magic_datagrams_are_dropped_silently() {
    let (addr, _shutdown, _task) = start_server(Duration::from_secs(1000)).await;
    let socket = client_socket(addr).await;

    let runt = [0u8; 19];
    socket.send(&runt).await.expect("send runt");

    let mut bad_magic = Packet::control(Command::Hello, 0, SID, 1).encode();
    bad_magic[0] = 0xAA;
    socket.send(&bad_magic).await.expect("send bad magic");

    expect_silence(&socket).await;

    // The server is still healthy afterwards.
    send(&socket, &Packet::control(Command::Hello, 0, SID, 2)).await;
    assert_eq!(recv_packet(&socket).await.command, Command::Alive);
}

#[tokio::test]
async fn shutdown_broadcasts_goodbye_to_open_sessions() {
    let (addr, shutdown, task) = start_server(Duration::from_secs(1000)).await;
    let socket = client_socket(addr).await;

    send(&socket, &Packet::control(Command::Hello, 0, SID, 1)).await;
    recv_packet(&socket).await;

    shutdown.send(true).expect("signal shutdown");

    let goodbye = recv_packet(&socket).await;
    assert_eq!(goodbye.command, Command::Goodbye);
    assert_eq!(goodbye.seq, 0);
    assert_eq!(goodbye.session_id, SID);

    timeout(Duration::from_secs(1), task)
        .await
        .expect("server should exit")
        .expect("join")
        .expect("run");
}

#[tokio::test]
async fn idle_session_is_closed_by_the_sweeper() {
    let (addr, _shutdown, _task) = start_server(Duration::from_secs(1)).await;
    let socket = client_socket(addr).await;

    send(&socket, &Packet::control(Command::Hello, 0, SID, 1)).await;
    recv_packet(&socket).await;

    let mut buf = [0u8; 4096];
    let len = timeout(Duration::from_secs(4), socket.recv(&mut buf))
        .await
        .expect("sweeper should send GOODBYE")
        .expect("recv");
    let goodbye = Packet::decode(&buf[..len]).expect("decode");
    assert_eq!(goodbye.command, Command::Goodbye);
    assert_eq!(goodbye.seq, 0);
}
