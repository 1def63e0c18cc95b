use clap::{Arg, Command};
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use uap_server::{Server, ServerConfig};

fn validate_port_value(value: &str) -> Result<u16, String> {
    value
        .parse::<u16>()
        .map_err(|_| "Invalid port number".to_owned())
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

    info!(version = env!("CARGO_PKG_VERSION"), "uap-server starting");

    let matches = Command::new("UAP Server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("UDP session server speaking the UAP protocol")
        .arg(
            Arg::new("port")
                .help("The UDP port to bind on 0.0.0.0")
                .value_name("portnum")
                .value_parser(validate_port_value)
                .required(true),
        )
        .arg(
            Arg::new("timeout")
                .help("Seconds a session may stay idle before it is closed")
                .short('t')
                .long("timeout")
                .value_parser(validate_timeout_value)
                .default_value("1000"),
        )
        .get_matches();

    let config = ServerConfig {
        port: *matches.get_one::<u16>("port").expect("port is required"),
        inactivity_timeout: Duration::from_secs(
            *matches.get_one::<u64>("timeout").expect("timeout has a default"),
        ),
    };

    let server = match Server::bind(&config).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Unable to bind to port {}: {}", config.port, e);
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(uap_server::watch_stdin(shutdown_tx));

    if let Err(e) = server.run(shutdown_rx).await {
        eprintln!("Server error: {e}");
        std::process::exit(1);
    }
}
