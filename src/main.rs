use clap::Parser;
use log::{error, info, LevelFilter};
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use ringlet::chord::{
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_JOIN_TIMEOUT, DEFAULT_REPLICATION_FACTOR,
    DEFAULT_RING_BITS,
};
use ringlet::network::{node::ChordPeer, PeerConfig};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, long_about = None)]
#[command(name = "ringlet")]
#[command(about = "A self-organizing ring DHT node over UDP")]
struct Cli {
    /// Address to listen on, e.g. 127.0.0.1:6001
    addr: String,
    /// Address of a ring member to join through; pass ADDR again to start a new ring
    bootstrap: String,
    /// Replication factor (accepted, keys are not replicated)
    #[arg(short = 'r', long = "replication", default_value_t = DEFAULT_REPLICATION_FACTOR)]
    replication: u32,
    /// Log every datagram sent and received
    #[arg(short = 't', long = "trace")]
    trace: bool,
    /// Ring size exponent m; all nodes of a ring must agree
    #[arg(long = "ring-bits", default_value_t = DEFAULT_RING_BITS)]
    ring_bits: u8,
    #[arg(long = "heartbeat-secs", default_value_t = DEFAULT_HEARTBEAT_INTERVAL.as_secs())]
    heartbeat_secs: u64,
    #[arg(long = "join-timeout-secs", default_value_t = DEFAULT_JOIN_TIMEOUT.as_secs())]
    join_timeout_secs: u64,
}

fn init_logging(trace: bool) -> Result<(), String> {
    let level = if trace { LevelFilter::Trace } else { LevelFilter::Info };
    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S%.3f)} {l:<5} {t} - {m}{n}",
        )))
        .build();
    let config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(level))
        .map_err(|e| format!("Invalid logging config: {}", e))?;
    log4rs::init_config(config).map_err(|e| format!("Failed to initialize logging: {}", e))?;
    Ok(())
}

fn parse_addr(what: &str, raw: &str) -> Result<SocketAddr, String> {
    raw.parse()
        .map_err(|e| format!("Invalid {} address {:?}: {}", what, raw, e))
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let cli = Cli::parse();
    init_logging(cli.trace)?;

    let addr = parse_addr("listen", &cli.addr)?;
    let bootstrap = parse_addr("bootstrap", &cli.bootstrap)?;

    let config = PeerConfig {
        bind_addr: addr,
        ring_bits: cli.ring_bits,
        heartbeat_interval: Duration::from_secs(cli.heartbeat_secs),
        join_timeout: Duration::from_secs(cli.join_timeout_secs),
        replication_factor: cli.replication,
        ..PeerConfig::default()
    };

    let mut peer = ChordPeer::bind(config).await.map_err(|e| {
        error!("Failed to start node: {}", e);
        format!("Failed to start node: {}", e)
    })?;

    if addr == bootstrap {
        info!("Initializing bootstrap node...");
        peer.create_network()
            .await
            .map_err(|e| format!("Failed to create network: {}", e))?;
        info!("Other nodes can join using: ringlet <ADDR> {}", peer.local_addr());
    } else {
        peer.join(bootstrap)
            .await
            .map_err(|e| format!("Failed to join network: {}", e))?;
    }

    peer.start_maintenance();

    peer.run().await;
    info!("Node shut down gracefully");
    Ok(())
}
