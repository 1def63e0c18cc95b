use clap::{Arg, Command};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use uap_client::ClientConfig;

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

fn validate_existing_file(value: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(value);
    match path.is_file() {
        true => Ok(path),
        false => Err("File doesn't exist on file system! Use a different file".to_owned()),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "uap-client starting");

    let matches = Command::new("UAP Client")
        .version(env!("CARGO_PKG_VERSION"))
        .about("UDP session client speaking the UAP protocol")
        .arg(
            Arg::new("hostname")
                .help("The server hostname or IPv4 address")
                .required(true),
        )
        .arg(
            Arg::new("port")
                .help("The server UDP port")
                .value_name("portnum")
                .value_parser(validate_port_value)
                .required(true),
        )
        .arg(
            Arg::new("inputfile")
                .help("Read DATA lines from this file instead of standard input")
                .value_parser(validate_existing_file),
        )
        .arg(
            Arg::new("timeout")
                .help("Seconds of server silence tolerated before quitting")
                .short('t')
                .long("timeout")
                .value_parser(validate_timeout_value)
                .default_value("1000"),
        )
        .get_matches();

    let mut config = ClientConfig::new(
        matches
            .get_one::<String>("hostname")
            .expect("hostname is required")
            .clone(),
        *matches.get_one::<u16>("port").expect("port is required"),
    );
    config.input_file = matches.get_one::<PathBuf>("inputfile").cloned();
    config.inactivity_timeout = Duration::from_secs(
        *matches.get_one::<u64>("timeout").expect("timeout has a default"),
    );

    if let Err(e) = uap_client::run(config).await {
        eprintln!("Client error: {e}");
        std::process::exit(1);
    }
}
