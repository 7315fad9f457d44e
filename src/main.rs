use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use mconn_transport::config::Config;
use mconn_transport::error::AppError;
use mconn_transport::logging::setup_logging;
use mconn_transport::shutdown::ShutdownManager;
use mconn_transport::{Connection, Endpoint, NodeKey, Stream, StreamError, Transport};

#[derive(Parser, Debug)]
#[command(name = "mconnd")]
#[command(about = "MConn peer transport daemon", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "mconnd.toml")]
    config: PathBuf,

    /// Overrides `transport.listen_address`.
    #[arg(long)]
    listen: Option<String>,

    /// Endpoints to dial in addition to the configured persistent peers.
    #[arg(long)]
    dial: Vec<String>,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.generate_config {
        match Config::default().save_to_file(&args.config) {
            Ok(()) => {
                println!("Generated default config at: {}", args.config.display());
                return;
            }
            Err(e) => {
                eprintln!("Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let mut config = match Config::load_or_create(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(listen) = args.listen.clone() {
        config.transport.listen_address = listen;
    }
    config.transport.persistent_peers.extend(args.dial.iter().cloned());

    setup_logging(&config.logging, args.verbose);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting mconnd");

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "mconnd failed");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), AppError> {
    config.validate()?;
    let node_key = NodeKey::load_or_generate(&config.node_key_path())?;
    let listen = config.listen_endpoint()?;
    let node_info = config.node_info(node_key.id(), &listen);
    tracing::info!(node_id = %node_key.id(), moniker = %node_info.moniker, network = %node_info.network, "Node identity");

    let transport = Arc::new(Transport::new(
        node_key,
        node_info,
        config.mconn_config(),
        config.transport_options()?,
    ));
    transport.set_channel_descriptors(config.channels.clone());
    transport.listen(&listen).await?;

    let mut shutdown = ShutdownManager::new();
    let token = shutdown.token();
    let channels: Vec<u8> = config.channels.iter().map(|ch| ch.id).collect();

    let accept_task = {
        let transport = transport.clone();
        let token = token.clone();
        let channels = channels.clone();
        tokio::spawn(async move { accept_loop(transport, token, channels).await })
    };
    shutdown.register_task(accept_task);

    for peer in config.persistent_peers()? {
        let transport = transport.clone();
        let token = token.clone();
        let channels = channels.clone();
        shutdown.register_task(tokio::spawn(async move {
            dial_peer(transport, token, peer, channels).await
        }));
    }

    shutdown.wait_for_shutdown().await;
    transport.close();
    Ok(())
}

async fn accept_loop(transport: Arc<Transport>, token: CancellationToken, channels: Vec<u8>) {
    loop {
        match transport.accept(&token).await {
            Ok(Some(conn)) => {
                tracing::info!(peer = %conn.remote_endpoint(), moniker = %conn.node_info().moniker, "Accepted peer");
                serve_connection(conn, &token, &channels);
            }
            // Cancelled: shutting down.
            Ok(None) => return,
            Err(e) if e.as_rejected().is_some() => {
                tracing::debug!(error = %e, "Rejected inbound peer");
            }
            Err(e) => {
                tracing::error!(error = %e, "Accept failed");
                return;
            }
        }
    }
}

async fn dial_peer(
    transport: Arc<Transport>,
    token: CancellationToken,
    peer: Endpoint,
    channels: Vec<u8>,
) {
    match transport.dial(&token, &peer).await {
        Ok(conn) => {
            tracing::info!(peer = %conn.remote_endpoint(), moniker = %conn.node_info().moniker, "Dialed peer");
            serve_connection(conn, &token, &channels);
        }
        Err(e) => tracing::warn!(peer = %peer, error = %e, "Dial failed"),
    }
}

/// Spawns one reader per channel; the connection closes on shutdown.
fn serve_connection(conn: Connection, token: &CancellationToken, channels: &[u8]) {
    for &id in channels {
        let Ok(stream) = conn.stream(u16::from(id)) else {
            continue;
        };
        let conn = conn.clone();
        let token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => conn.close(),
                _ = read_stream(&conn, stream) => {}
            }
        });
    }
}

async fn read_stream(conn: &Connection, stream: Stream) {
    let peer = conn.remote_endpoint();
    let mut buf = vec![0u8; 64 * 1024];
    let mut message = Vec::new();
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => {
                tracing::info!(peer = %peer, channel = stream.id(), bytes = message.len(), "Received message");
                tracing::trace!(peer = %peer, channel = stream.id(), data = %hex::encode(&message), "Message payload");
                message.clear();
            }
            Ok(n) => message.extend_from_slice(&buf[..n]),
            Err(StreamError::ShortBuffer { needed, .. }) => buf.resize(needed, 0),
            Err(e) => {
                tracing::debug!(peer = %peer, channel = stream.id(), error = %e, "Stream ended");
                return;
            }
        }
    }
}
