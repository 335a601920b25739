use std::time::Duration;

use anyhow::anyhow;
use clap::Parser;
use clap_derive::Parser;
use packet_listener::config::{OverflowPolicy, PacketConfig};
use packet_listener::dispatch::{listen_with_config, Connection};
use packet_listener::error::PacketError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, info, warn, Level};

/// Accepts connections on any supported network and echoes everything it receives
#[derive(Parser)]
struct Args {
    /// e.g. udp, udp6, unixgram, tcp
    network: String,
    address: String,

    #[clap(long, default_value_t = 10_000)]
    heartbeat_millis: u64,

    #[clap(long, default_value_t = false)]
    drop_on_overflow: bool,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.heartbeat_millis == 0 {
        return Err(anyhow!("heartbeat interval must be positive"));
    }

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let config = PacketConfig {
        heartbeat_interval: Duration::from_millis(args.heartbeat_millis),
        overflow: if args.drop_on_overflow { OverflowPolicy::DropNewest } else { OverflowPolicy::Block },
        ..PacketConfig::default()
    };

    let listener = listen_with_config(&args.network, &args.address, config).await?;
    info!("echoing on {} {}", args.network, listener.local_addr()?);

    loop {
        match listener.accept().await {
            Ok(connection) => {
                tokio::spawn(echo(connection));
            }
            Err(PacketError::Closed) => {
                info!("listener closed");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn echo(mut connection: Box<dyn Connection>) {
    let peer = match connection.peer_addr() {
        Ok(peer) => peer.to_string(),
        Err(_) => "<unnamed>".to_string(),
    };
    info!("new connection from {}", peer);

    let mut buf = vec![0u8; 8192];
    loop {
        let n = match connection.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("error reading from {}: {}", peer, e);
                break;
            }
        };

        if let Err(e) = connection.write_all(&buf[..n]).await {
            error!("error echoing to {}: {}", peer, e);
            break;
        }
    }
    info!("connection from {} ended", peer);
}
