//! Standalone Charon server: forwards a selected method set from XMPP to
//! a backend JSON-RPC endpoint and serves long-poll notifications through
//! pub/sub.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use jid::Jid;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use charon::notifications::{
    NotificationType, PendingChangeNotification, StateChangeNotification,
};
use charon::rpc::ForwardingRpcServer;
use charon::rpcwaiter::RpcUpdateWaiter;
use charon::server::ReconnectLoop;
use charon::waiter::WaiterLoop;
use charon::{ConnectionConfig, Server, TcpConnector};

/// Time between connection retries if the server gets disconnected.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "charon-server", version, about = "Run a Charon server")]
struct Args {
    /// URL at which the backend JSON-RPC interface is available.
    #[arg(long = "backend_rpc_url")]
    backend_rpc_url: String,

    /// A string identifying the version of the backend provided.
    #[arg(long = "backend_version", default_value = "")]
    backend_version: String,

    /// Bare or full JID for the server.
    #[arg(long = "server_jid")]
    server_jid: String,

    /// XMPP password for the server JID.
    #[arg(long = "password")]
    password: String,

    /// Priority for the XMPP connection.
    #[arg(long = "priority", default_value_t = 0)]
    priority: i8,

    /// The pubsub service to use on the server.
    #[arg(long = "pubsub_service")]
    pubsub_service: Option<String>,

    /// If set, enable waitforchange updates.
    #[arg(long = "waitforchange")]
    waitforchange: bool,

    /// If set, enable waitforpendingchange updates.
    #[arg(long = "waitforpendingchange")]
    waitforpendingchange: bool,

    /// Comma-separated list of supported RPC methods.
    #[arg(long = "methods", default_value = "")]
    methods: String,

    /// Comma-separated list of methods to exclude.
    #[arg(long = "methods_exclude", default_value = "")]
    methods_exclude: String,

    /// If specified, load methods from the given JSON file.
    #[arg(long = "methods_json_spec")]
    methods_json_spec: Option<PathBuf>,
}

fn new_waiter(
    url: &str,
    method: &str,
    notification: Arc<dyn NotificationType>,
) -> WaiterLoop {
    let waiter = Arc::new(RpcUpdateWaiter::new(
        url,
        method,
        notification.always_block_id(),
    ));
    WaiterLoop::new(notification, waiter)
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let methods = charon_cli::methods::selected_methods(
        &args.methods,
        args.methods_json_spec.as_deref(),
        &args.methods_exclude,
    )?;
    if methods.is_empty() {
        warn!("no methods are selected for forwarding");
    }

    let mut backend = ForwardingRpcServer::new(&args.backend_rpc_url);
    info!(url = %args.backend_rpc_url, "forwarding calls to JSON-RPC server");
    info!(version = %args.backend_version, "reporting backend version");
    for method in &methods {
        info!(%method, "allowing method");
        backend.allow_method(method);
    }

    let jid = Jid::from_str(&args.server_jid)
        .with_context(|| format!("invalid server JID '{}'", args.server_jid))?;
    let config = ConnectionConfig::new(jid, args.password.clone());

    let server = Server::new(
        args.backend_version.clone(),
        Arc::new(backend),
        TcpConnector,
        config,
    );

    match &args.pubsub_service {
        Some(service) => {
            let service = Jid::from_str(service)
                .with_context(|| format!("invalid pubsub service '{service}'"))?;
            server.add_pubsub(service);
        }
        None if args.waitforchange || args.waitforpendingchange => {
            bail!("--pubsub_service must be set to enable notifications");
        }
        None => (),
    }

    if args.waitforchange {
        server
            .add_notification(new_waiter(
                &args.backend_rpc_url,
                "waitforchange",
                Arc::new(StateChangeNotification),
            ))
            .await;
    }
    if args.waitforpendingchange {
        server
            .add_notification(new_waiter(
                &args.backend_rpc_url,
                "waitforpendingchange",
                Arc::new(PendingChangeNotification),
            ))
            .await;
    }

    let mut reconnect = ReconnectLoop::new(server.clone(), RECONNECT_INTERVAL);
    reconnect.start(args.priority);

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    info!("shutting down");

    reconnect.stop().await;
    server.shutdown().await;
    Ok(())
}
