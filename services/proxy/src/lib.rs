//! Intercepting HTTP/HTTPS forwarding proxy.
//!
//! One task per accepted connection. Plain requests are downgraded to
//! HTTP/1.0 close semantics and forwarded once; CONNECT tunnels get a
//! synthetic 200 and a blind byte relay. Either way the session owns both
//! sockets and drops them on any exit path.

pub mod header;

use header::RequestHead;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info};

/// Default per-read and connect bound for every socket in a session.
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(20);

const REQUEST_CHUNK: usize = 2048;
const TUNNEL_CHUNK: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("I/O: {0}")]
    Io(#[from] io::Error),
    #[error("socket timed out")]
    Timeout(#[from] tokio::time::error::Elapsed),
}

pub struct ProxyConfig {
    pub port: u16,
    pub socket_timeout: Duration,
}

/// Validate the CLI port argument: an integer in `[1024, 65535]`.
pub fn parse_listen_port(value: &str) -> Result<u16, String> {
    match value.parse::<u32>() {
        Ok(port) if (1024..=65535).contains(&port) => Ok(port as u16),
        _ => Err("Port must be an integer between 1024 and 65535".to_owned()),
    }
}

pub struct Proxy {
    listener: TcpListener,
    socket_timeout: Duration,
}

impl Proxy {
    /// Bind the listener on `0.0.0.0`.
    pub async fn bind(config: &ProxyConfig) -> io::Result<Proxy> {
        let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
        println!(
            "{}Proxy listening on port {}",
            date_stamp(),
            listener.local_addr()?.port()
        );
        Ok(Proxy {
            listener,
            socket_timeout: config.socket_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the shutdown flag flips, one task per
    /// session, then stop listening and drain the sessions in flight.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((connection, addr)) => {
                            debug!(client = %addr, "accepted");
                            let socket_timeout = self.socket_timeout;
                            sessions.spawn(async move {
                                if let Err(e) = serve_connection(connection, socket_timeout).await {
                                    debug!(client = %addr, error = %e, "session ended");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "accept failed"),
                    }
                }
            }
        }

        // Stop taking new work; in-flight sessions keep their sockets until
        // they finish on their own.
        drop(self.listener);
        info!(active = sessions.len(), "draining sessions");
        while sessions.join_next().await.is_some() {}
    }
}

/// Flip the shutdown flag when the operator types `q` or closes stdin.
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

async fn serve_connection(
    mut connection: TcpStream,
    socket_timeout: Duration,
) -> Result<(), SessionError> {
    let request_bytes = read_request_head(&mut connection, socket_timeout).await?;
    if request_bytes.is_empty() {
        return Ok(());
    }

    let head = RequestHead::parse(&request_bytes);

    // Requests without a Host line are dropped without logging.
    let Some(host) = head.target_host() else {
        return Ok(());
    };
    println!("{}>>> {}", date_stamp(), head.start_line());
    let port = head.target_port();

    let upstream = match timeout(socket_timeout, TcpStream::connect((host.as_str(), port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(_)) | Err(_) => {
            debug!(host = %host, port, "upstream connect failed");
            let response = format!("{} 502 Bad Gateway\r\n\r\n", head.version());
            connection.write_all(response.as_bytes()).await?;
            return Ok(());
        }
    };

    if head.is_connect() {
        connection.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await?;
        tunnel(connection, upstream).await
    } else {
        let mut upstream = upstream;
        upstream.write_all(head.rewritten().as_bytes()).await?;
        tunnel(connection, upstream).await
    }
}

/// Accumulate 2048-byte reads until the head terminator or EOF. Each read
/// is individually bounded by the socket timeout.
async fn read_request_head(
    connection: &mut TcpStream,
    socket_timeout: Duration,
) -> Result<Vec<u8>, SessionError> {
    let mut request = Vec::new();
    let mut chunk = [0u8; REQUEST_CHUNK];
    loop {
        let n = timeout(socket_timeout, connection.read(&mut chunk)).await??;
        if n == 0 {
            break;
        }
        request.extend_from_slice(&chunk[..n]);
        if ends_headers(&request) {
            break;
        }
    }
    Ok(request)
}

fn ends_headers(bytes: &[u8]) -> bool {
    bytes.windows(4).any(|w| w == b"\r\n\r\n") || bytes.windows(2).any(|w| w == b"\n\n")
}

/// Pump bytes both ways until either side closes or errors, then drop both
/// sockets.
async fn tunnel(client: TcpStream, upstream: TcpStream) -> Result<(), SessionError> {
    let (mut client_rd, mut client_wr) = client.into_split();
    let (mut upstream_rd, mut upstream_wr) = upstream.into_split();
    tokio::select! {
        done = pump(&mut client_rd, &mut upstream_wr) => done?,
        done = pump(&mut upstream_rd, &mut client_wr) => done?,
    }
    Ok(())
}

async fn pump(from: &mut OwnedReadHalf, to: &mut OwnedWriteHalf) -> Result<(), SessionError> {
    let mut chunk = [0u8; TUNNEL_CHUNK];
    loop {
        let n = from.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        to.write_all(&chunk[..n]).await?;
    }
}

fn date_stamp() -> String {
    chrono::Local::now().format("%d %B %H:%M:%S - ").to_string()
}
