//! Standalone Charon client: exposes a local JSON-RPC HTTP server whose
//! configured methods are forwarded over XMPP to a discovered Charon
//! server.  A `stop` notification shuts the process down.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use clap::Parser;
use jid::Jid;
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use charon::error::{rpc_codes, RpcError};
use charon::notifications::{
    NotificationType, PendingChangeNotification, StateChangeNotification,
};
use charon::{Client, ConnectionConfig, TcpConnector};

#[derive(Parser)]
#[command(name = "charon-client", version, about = "Run a Charon client")]
struct Args {
    /// Bare JID of the Charon server account to connect to.
    #[arg(long = "server_jid")]
    server_jid: String,

    /// The backend version required from the server.
    #[arg(long = "backend_version", default_value = "")]
    backend_version: String,

    /// Bare or full JID for the client.
    #[arg(long = "client_jid")]
    client_jid: String,

    /// XMPP password for the client JID.
    #[arg(long = "password")]
    password: String,

    /// Root CA certificate file for TLS verification.
    #[arg(long = "cafile")]
    cafile: Option<PathBuf>,

    /// Port for the local JSON-RPC server.
    #[arg(long = "port")]
    port: u16,

    /// If set, enable forwarding of waitforchange waits.
    #[arg(long = "waitforchange")]
    waitforchange: bool,

    /// If set, enable forwarding of waitforpendingchange waits.
    #[arg(long = "waitforpendingchange")]
    waitforpendingchange: bool,

    /// Whether to run server detection immediately on start.
    #[arg(long = "detect_server", default_value_t = true, action = clap::ArgAction::Set)]
    detect_server: bool,

    /// Comma-separated list of RPC methods to forward.
    #[arg(long = "methods", default_value = "")]
    methods: String,

    /// Comma-separated list of methods to exclude.
    #[arg(long = "methods_exclude", default_value = "")]
    methods_exclude: String,

    /// If specified, load methods from the given JSON file.
    #[arg(long = "methods_json_spec")]
    methods_json_spec: Option<PathBuf>,
}

/// State shared with the local JSON-RPC request handler.
struct LocalServer {
    client: Client<TcpConnector>,
    /// Methods forwarded verbatim to the Charon server.
    forwarded: BTreeSet<String>,
    /// Waiter methods, mapping the RPC name to the notification type.
    notifications: HashMap<String, String>,
    stop: tokio::sync::watch::Sender<bool>,
}

fn error_body(id: Value, error: &RpcError) -> Value {
    let mut body = json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": error.code, "message": error.message},
    });
    if !error.data.is_null() {
        body["error"]["data"] = error.data.clone();
    }
    body
}

async fn handle_rpc(
    State(state): State<Arc<LocalServer>>,
    Json(request): Json<Value>,
) -> Json<Value> {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let Some(method) = request.get("method").and_then(Value::as_str) else {
        let error = RpcError::new(rpc_codes::INVALID_PARAMS, "request without method");
        return Json(error_body(id, &error));
    };
    let params = request.get("params").cloned().unwrap_or(Value::Null);

    if method == "stop" && request.get("id").is_none() {
        info!("received stop notification");
        let _ = state.stop.send(true);
        return Json(Value::Null);
    }

    let outcome = if let Some(type_name) = state.notifications.get(method) {
        let known = params
            .as_array()
            .and_then(|a| a.first())
            .cloned()
            .unwrap_or(Value::Null);
        state.client.wait_for_change(type_name, known).await
    } else if state.forwarded.contains(method) {
        state.client.forward_method(method, &params).await
    } else {
        Err(RpcError::method_not_found(method))
    };

    match outcome {
        Ok(result) => Json(json!({"jsonrpc": "2.0", "id": id, "result": result})),
        Err(error) => Json(error_body(id, &error)),
    }
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

    let server_jid = Jid::from_str(&args.server_jid)
        .with_context(|| format!("invalid server JID '{}'", args.server_jid))?
        .to_bare();
    let client_jid = Jid::from_str(&args.client_jid)
        .with_context(|| format!("invalid client JID '{}'", args.client_jid))?;

    let client = Client::new(
        server_jid,
        args.backend_version.clone(),
        TcpConnector,
        ConnectionConfig::new(client_jid, args.password.clone()),
    );
    if let Some(cafile) = &args.cafile {
        client.set_root_ca(cafile.clone());
    }

    let mut notifications = HashMap::new();
    if args.waitforchange {
        let notification = StateChangeNotification;
        notifications.insert(
            "waitforchange".to_string(),
            notification.type_name().to_string(),
        );
        client.add_notification(Arc::new(notification));
    }
    if args.waitforpendingchange {
        let notification = PendingChangeNotification;
        notifications.insert(
            "waitforpendingchange".to_string(),
            notification.type_name().to_string(),
        );
        client.add_notification(Arc::new(notification));
    }

    client.connect().await.context("XMPP connect failed")?;

    if args.detect_server {
        let resource = client.get_server_resource().await;
        if resource.is_empty() {
            warn!("could not detect a Charon server");
        } else {
            info!(%resource, "detected Charon server");
        }
    }

    let forwarded = charon_cli::methods::selected_methods(
        &args.methods,
        args.methods_json_spec.as_deref(),
        &args.methods_exclude,
    )?;
    for method in &forwarded {
        info!(%method, "forwarding method");
    }

    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    let state = Arc::new(LocalServer {
        client: client.clone(),
        forwarded,
        notifications,
        stop: stop_tx,
    });

    let app = Router::new().route("/", post(handle_rpc)).with_state(state);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", args.port))
        .await
        .with_context(|| format!("failed to bind local RPC server on port {}", args.port))?;
    info!(address = %listener.local_addr()?, "local JSON-RPC server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = stop_rx.changed().await;
        })
        .await
        .context("local RPC server failed")?;

    info!("shutting down");
    client.disconnect().await;
    Ok(())
}
