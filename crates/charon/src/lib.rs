//! Charon tunnels JSON-RPC request/response traffic and push-style state
//! notifications between clients and a pool of backend service providers
//! over XMPP.
//!
//! The [`Client`] discovers a server instance behind a shared account,
//! forwards method calls to it over IQ stanzas and tracks notification
//! state pushed through pub/sub.  The [`Server`] answers those calls
//! through a backend [`rpc::RpcHandler`] and publishes state updates
//! gathered by long-polling [`waiter::WaiterLoop`]s.

pub mod client;
pub mod connection;
pub mod error;
pub mod notifications;
pub mod pubsub;
pub mod rpc;
pub mod rpcwaiter;
pub mod server;
pub mod stanza;
pub mod stream;
pub mod testutil;
pub mod transport;
pub mod waiter;
pub mod xmldata;

pub use client::Client;
pub use error::{ConnectionError, RpcError};
pub use server::{ReconnectLoop, Server};
pub use transport::{ConnectionConfig, TcpConnector};
