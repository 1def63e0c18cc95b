//! UDP session server speaking the UAP protocol.
//!
//! One task owns the datagram loop, a second sweeps idle sessions once a
//! second, and a third watches stdin for the operator quit. The three share
//! the session table behind a mutex; the state machine itself lives in
//! [`session`] and never touches a socket.

pub mod session;

use session::SessionTable;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info};
use uap_protocol::Packet;

/// Default inactivity bound before the sweeper closes a session.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(1000);

const SWEEP_PERIOD: Duration = Duration::from_secs(1);
const RECV_BUFFER: usize = 4096;

pub struct ServerConfig {
    pub port: u16,
    pub inactivity_timeout: Duration,
}

pub struct Server {
    socket: Arc<UdpSocket>,
    table: Arc<Mutex<SessionTable>>,
    inactivity_timeout: Duration,
}

impl Server {
    /// Bind the UDP socket on `0.0.0.0`.
    pub async fn bind(config: &ServerConfig) -> io::Result<Server> {
        let socket = UdpSocket::bind(("0.0.0.0", config.port)).await?;
        println!("Waiting on port {}...", socket.local_addr()?.port());
        Ok(Server {
            socket: Arc::new(socket),
            table: Arc::new(Mutex::new(SessionTable::new())),
            inactivity_timeout: config.inactivity_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve datagrams until the shutdown flag flips, then send GOODBYE to
    /// every open session and return.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let sweeper = tokio::spawn(sweep_loop(
            Arc::clone(&self.socket),
            Arc::clone(&self.table),
            self.inactivity_timeout,
        ));

        let mut buf = [0u8; RECV_BUFFER];
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                        Err(e) => error!(error = %e, "recv failed"),
                    }
                }
            }
        }

        sweeper.abort();
        info!("shutting down, terminating open sessions");
        let goodbyes = self.table.lock().await.terminate_all(Instant::now());
        send_all(&self.socket, goodbyes).await;
        Ok(())
    }

    async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        // Undecodable datagrams are dropped without a reply.
        let Ok(packet) = Packet::decode(datagram) else {
            return;
        };
        let replies = self
            .table
            .lock()
            .await
            .handle_packet(&packet, from, Instant::now());
        send_all(&self.socket, replies).await;
    }
}

async fn send_all(socket: &UdpSocket, outgoing: Vec<session::Outgoing>) {
    for reply in outgoing {
        match socket.send_to(&reply.packet.encode(), reply.to).await {
            Ok(_) => debug!(command = %reply.packet.command, to = %reply.to, "sent"),
            Err(e) => error!(error = %e, to = %reply.to, "send failed"),
        }
    }
}

async fn sweep_loop(socket: Arc<UdpSocket>, table: Arc<Mutex<SessionTable>>, bound: Duration) {
    let mut interval = tokio::time::interval(SWEEP_PERIOD);
    loop {
        interval.tick().await;
        let goodbyes = table.lock().await.sweep(Instant::now(), bound);
        send_all(&socket, goodbyes).await;
    }
}

/// Flip the shutdown flag when the operator types `q` or closes stdin.
///
/// Runs as its own task; tokio backs stdin with a blocking thread, so the
/// datagram loop never waits on the terminal.
pub async fn watch_stdin(shutdown: watch::Sender<bool>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().eq_ignore_ascii_case("q") => break,
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }
    let _ = shutdown.send(true);
}
