use clap::{Arg, Command};
use proxy::{Proxy, ProxyConfig};
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

fn validate_listen_port(value: &str) -> Result<u16, String> {
    proxy::parse_listen_port(value)
}

fn validate_timeout_value(value: &str) -> Result<u64, String> {
    value
        .parse::<u64>()
        .map_err(|_| "Invalid timeout value".to_owned())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "proxy starting");

    let matches = Command::new("Forwarding Proxy")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Intercepting HTTP/HTTPS forwarding proxy")
        .arg(
            Arg::new("port")
                .help("The TCP port to listen on, between 1024 and 65535")
                .value_parser(validate_listen_port)
                .required(true),
        )
        .arg(
            Arg::new("timeout")
                .help("Per-read and connect timeout in seconds")
                .short('t')
                .long("timeout")
                .value_parser(validate_timeout_value)
                .default_value("20"),
        )
        .get_matches();

    let config = ProxyConfig {
        port: *matches.get_one::<u16>("port").expect("port is required"),
        socket_timeout: Duration::from_secs(
            *matches.get_one::<u64>("timeout").expect("timeout has a default"),
        ),
    };

    let proxy = match Proxy::bind(&config).await {
        Ok(proxy) => proxy,
        Err(e) => {
            eprintln!("Couldn't start server: {e}");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(proxy::watch_stdin(shutdown_tx));

    proxy.run(shutdown_rx).await;
}
