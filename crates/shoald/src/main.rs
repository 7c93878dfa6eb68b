use anyhow::Context;
use clap::Parser;
use shoal_rpc::Addr;
use shoald::dispatch::Dispatch;
use shoald::ServerState;
use std::path::PathBuf;
use std::sync::Arc;

/// Node-local server of the shoal aggregation filesystem: metadata shard,
/// backing-store manager, and client session broker for one node.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// This server's rank within the job.
    #[arg(long, env = "SHOAL_RANK")]
    rank: u32,

    /// Rank-ordered peer endpoints (host:port), ours included.
    #[arg(long, env = "SHOAL_PEERS", value_delimiter = ',', required = true)]
    peers: Vec<String>,

    /// Address to bind the peer endpoint on; defaults to our entry in
    /// --peers.
    #[arg(long, env = "SHOAL_LISTEN")]
    listen: Option<String>,

    /// Unix socket clients on this node dial; defaults to
    /// <spill-dir>/shoald.sock.
    #[arg(long, env = "SHOAL_CLIENT_SOCKET")]
    client_socket: Option<PathBuf>,

    /// Backing-store root directory.
    #[arg(long, env = "SHOAL_LOGIO_SPILL_DIR", default_value = "/var/tmp/shoal")]
    spill_dir: PathBuf,

    /// Slice size for cross-rank data requests, in bytes.
    #[arg(long, env = "SHOAL_META_RANGE_SIZE", default_value = "1048576")]
    meta_range_size: usize,

    /// Log threshold (an EnvFilter directive).
    #[arg(long, env = "SHOAL_LOG_VERBOSITY", default_value = "info")]
    log_verbosity: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&cli.log_verbosity))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let peer_addrs: Vec<Addr> = cli
        .peers
        .iter()
        .map(|addr| addr.parse().context("invalid peer address"))
        .collect::<anyhow::Result<_>>()?;
    anyhow::ensure!(
        (cli.rank as usize) < peer_addrs.len(),
        "rank {} out of range for {} peers",
        cli.rank,
        peer_addrs.len(),
    );

    let listen = cli
        .listen
        .clone()
        .unwrap_or_else(|| cli.peers[cli.rank as usize].clone());
    let client_socket = cli
        .client_socket
        .clone()
        .unwrap_or_else(|| cli.spill_dir.join("shoald.sock"));

    let state = ServerState::new(
        cli.rank,
        peer_addrs,
        cli.spill_dir.clone(),
        cli.meta_range_size,
    )?;
    let handler: Arc<dyn shoal_rpc::Handler> = Arc::new(Dispatch(state.clone()));

    tracing::info!(
        rank = cli.rank,
        nranks = state.nranks,
        %listen,
        client_socket = %client_socket.display(),
        spill_dir = %cli.spill_dir.display(),
        "shoald starting",
    );

    let peer_listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind peer endpoint {listen}"))?;

    // A stale socket from a previous run would refuse the bind.
    let _ = std::fs::remove_file(&client_socket);
    let client_listener = tokio::net::UnixListener::bind(&client_socket)
        .with_context(|| format!("failed to bind {}", client_socket.display()))?;

    let peer_srv = tokio::spawn(shoal_rpc::serve_tcp(peer_listener, handler.clone()));
    let client_srv = tokio::spawn(shoal_rpc::serve_unix(client_listener, handler));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
        }
        result = peer_srv => {
            tracing::error!(?result, "peer endpoint exited");
        }
        result = client_srv => {
            tracing::error!(?result, "client endpoint exited");
        }
    }

    state.lsm.unpublish_all();
    let _ = std::fs::remove_file(&client_socket);
    Ok(())
}
