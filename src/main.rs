use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use parley::{client, ChatError, ClientConfig, Session, StateCell, Transport};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransportKind {
    Tcp,
    Udp,
}

#[derive(Parser, Debug)]
#[command(version, about = "Chat protocol client over TCP or UDP")]
struct Cli {
    /// Transport protocol used for the connection.
    #[arg(short = 't', long, value_enum)]
    transport: TransportKind,

    /// Server IP address or hostname.
    #[arg(short = 's', long)]
    server: String,

    /// Server port.
    #[arg(short = 'p', long, default_value_t = parley::DEFAULT_PORT)]
    port: u16,

    /// UDP confirmation timeout in milliseconds.
    #[arg(short = 'd', long, default_value_t = 250)]
    timeout: u64,

    /// Maximum number of UDP retransmissions.
    #[arg(short = 'r', long, default_value_t = 3)]
    retries: u8,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ClientConfig {
        host: cli.server,
        port: cli.port,
        udp_timeout: Duration::from_millis(cli.timeout),
        udp_retries: cli.retries,
    };

    let cancel = CancellationToken::new();
    let state = StateCell::new();
    let transport = match cli.transport {
        TransportKind::Tcp => Transport::tcp(config, cancel.clone()),
        TransportKind::Udp => Transport::udp(config, state.clone(), cancel.clone()),
    };
    let (session, driver, events) = Session::new(transport, state, cancel);

    let code = match client::run(session, driver, events).await {
        Ok(()) | Err(ChatError::Cancelled) => 0,
        Err(e) => {
            eprintln!("ERROR: {e}");
            1
        }
    };
    std::process::exit(code);
}
