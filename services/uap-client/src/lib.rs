//! UAP client: runs one session against a server, forwarding lines from a
//! file or from standard input as DATA packets.
//!
//! Three concurrent pieces share the connection: the input driver (file or
//! stdin), a receive loop, and an inactivity monitor. Any of them can flip
//! the shutdown flag; the others observe it and wind down.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, watch};
use tokio::time::timeout;
use tracing::{debug, error};
use uap_protocol::{Command, LogicalClock, Packet};

/// Default bound on server silence before the client gives up.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(1000);
/// Default grace after the last file line, letting server logs flush
/// before the GOODBYE goes out.
pub const DEFAULT_EOF_GRACE: Duration = Duration::from_secs(5);
/// Default bound on waiting for the server to echo our GOODBYE.
pub const DEFAULT_REPLY_GRACE: Duration = Duration::from_secs(5);

const MONITOR_PERIOD: Duration = Duration::from_secs(1);
const RECV_BUFFER: usize = 4096;

pub struct ClientConfig {
    pub server: String,
    pub port: u16,
    /// Read DATA lines from this file; `None` drives the session from stdin.
    pub input_file: Option<PathBuf>,
    pub inactivity_timeout: Duration,
    pub eof_grace: Duration,
    pub reply_grace: Duration,
}

impl ClientConfig {
    pub fn new(server: impl Into<String>, port: u16) -> ClientConfig {
        ClientConfig {
            server: server.into(),
            port,
            input_file: None,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            eof_grace: DEFAULT_EOF_GRACE,
            reply_grace: DEFAULT_REPLY_GRACE,
        }
    }
}

struct Shared {
    clock: LogicalClock,
    next_seq: u32,
    last_received: Instant,
}

struct Connection {
    socket: UdpSocket,
    session_id: u32,
    shared: Mutex<Shared>,
}

impl Connection {
    /// Stamp, send, and advance the sequence counter on success.
    async fn send(&self, command: Command, payload: &str) -> io::Result<()> {
        let mut shared = self.shared.lock().await;
        let packet = Packet {
            command,
            seq: shared.next_seq,
            session_id: self.session_id,
            clock: shared.clock.tick(),
            payload: payload.to_owned(),
        };
        self.socket.send(&packet.encode()).await?;
        shared.next_seq = shared.next_seq.wrapping_add(1);
        Ok(())
    }
}

/// Run one full session: HELLO, the input-driven DATA stream, GOODBYE.
pub async fn run(config: ClientConfig) -> io::Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket
        .connect((config.server.as_str(), config.port))
        .await?;

    let connection = Arc::new(Connection {
        socket,
        session_id: random_session_id()?,
        shared: Mutex::new(Shared {
            clock: LogicalClock::new(),
            next_seq: 0,
            last_received: Instant::now(),
        }),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    println!("Sending HELLO...");
    connection.send(Command::Hello, "").await?;

    let receiver = tokio::spawn(recv_loop(
        Arc::clone(&connection),
        shutdown_tx.clone(),
        shutdown_rx.clone(),
    ));
    let monitor = tokio::spawn(inactivity_monitor(
        Arc::clone(&connection),
        config.inactivity_timeout,
        shutdown_tx.clone(),
        shutdown_rx.clone(),
    ));

    let outcome = match &config.input_file {
        Some(path) => {
            drive_from_file(&connection, path, config.eof_grace, shutdown_rx.clone()).await
        }
        None => drive_from_stdin(&connection, shutdown_rx.clone()).await,
    };
    if let Err(e) = &outcome {
        error!(error = %e, "input driver failed");
    }

    // Bounded wait for the server's GOODBYE echo, then wind down regardless.
    let mut shutdown = shutdown_rx;
    let _ = timeout(config.reply_grace, shutdown.wait_for(|stop| *stop)).await;
    let _ = shutdown_tx.send(true);
    let _ = receiver.await;
    monitor.abort();
    outcome
}

async fn drive_from_file(
    connection: &Connection,
    path: &Path,
    eof_grace: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                // Blank lines are skipped in file mode.
                if line.is_empty() {
                    continue;
                }
                connection.send(Command::Data, line).await?;
            }
        }
    }

    // Grace window so the server's logs flush before we say goodbye; a
    // shutdown arriving meanwhile (server GOODBYE, inactivity) wins.
    if timeout(eof_grace, shutdown.wait_for(|stop| *stop)).await.is_ok() {
        return Ok(());
    }
    send_goodbye(connection).await;
    println!("EOF reached. Goodbye sent. Closing connection...");
    Ok(())
}

async fn drive_from_stdin(
    connection: &Connection,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            line = lines.next_line() => {
                match line? {
                    None => {
                        send_goodbye(connection).await;
                        return Ok(());
                    }
                    Some(line) => {
                        let line = line.trim();
                        if line == "q" {
                            send_goodbye(connection).await;
                            return Ok(());
                        }
                        connection.send(Command::Data, line).await?;
                    }
                }
            }
        }
    }
}

async fn send_goodbye(connection: &Connection) {
    println!("Sending GOODBYE...");
    if let Err(e) = connection.send(Command::Goodbye, "").await {
        debug!(error = %e, "goodbye send failed");
    }
}

async fn recv_loop(
    connection: Arc<Connection>,
    shutdown_tx: watch::Sender<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = [0u8; RECV_BUFFER];
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            received = connection.socket.recv(&mut buf) => {
                match received {
                    Ok(len) => {
                        // Header failures are dropped; bad payload bytes are
                        // replaced rather than rejected.
                        let Ok(packet) = Packet::decode_lossy(&buf[..len]) else {
                            continue;
                        };
                        {
                            let mut shared = connection.shared.lock().await;
                            shared.last_received = Instant::now();
                            shared.clock.observe(packet.clock);
                        }
                        println!("Received {} from server", packet.command);
                        if packet.command == Command::Goodbye {
                            println!("Closing connection...");
                            let _ = shutdown_tx.send(true);
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "recv failed");
                        let _ = shutdown_tx.send(true);
                        break;
                    }
                }
            }
        }
    }
}

async fn inactivity_monitor(
    connection: Arc<Connection>,
    bound: Duration,
    shutdown_tx: watch::Sender<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(MONITOR_PERIOD);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = interval.tick() => {
                let idle = connection.shared.lock().await.last_received.elapsed();
                if idle > bound {
                    println!("Timeout reached. No response from the server. Quitting the client...");
                    let _ = shutdown_tx.send(true);
                    return;
                }
            }
        }
    }
}

/// Uniform random id in `[1, 2^32 - 1]`; a zero draw is resampled.
fn random_session_id() -> io::Result<u32> {
    loop {
        let mut bytes = [0u8; 4];
        getrandom::fill(&mut bytes)
            .map_err(|e| io::Error::other(format!("random source unavailable: {e}")))?;
        let id = u32::from_be_bytes(bytes);
        if id != 0 {
            return Ok(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::random_session_id;

    #[test]
    fn session_id_is_never_zero() {
        for _ in 0..64 {
            assert_ne!(random_session_id().unwrap(), 0);
        }
    }
}
