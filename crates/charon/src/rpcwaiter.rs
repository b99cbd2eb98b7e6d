//! UpdateWaiter implementation backed by a long-polling JSON-RPC method.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::rpc::call_json_rpc;
use crate::waiter::{UpdateWaiter, WaiterError};

/// Calls a long-polling RPC method (e.g. `waitforchange`) with the
/// notification's always-block id as its only positional argument.  Each
/// instance supports one concurrent call, which is all the waiter loop
/// ever makes.
pub struct RpcUpdateWaiter {
    url: String,
    method: String,
    params: Value,
    http: reqwest::Client,
    in_flight: AsyncMutex<u64>,
}

impl RpcUpdateWaiter {
    pub fn new(url: impl Into<String>, method: impl Into<String>, always_block: Value) -> Self {
        Self {
            url: url.into(),
            method: method.into(),
            params: Value::Array(vec![always_block]),
            // The backend holds these calls open on purpose; no client
            // timeout applies.
            http: reqwest::Client::new(),
            in_flight: AsyncMutex::new(0),
        }
    }
}

#[async_trait]
impl UpdateWaiter for RpcUpdateWaiter {
    async fn wait_for_update(&self) -> Result<Value, WaiterError> {
        debug!(method = self.method, "calling backend waiter RPC");

        let mut guard = self
            .in_flight
            .try_lock()
            .expect("concurrent calls to wait_for_update");
        *guard += 1;

        call_json_rpc(&self.http, &self.url, *guard, &self.method, &self.params)
            .await
            .map_err(|e| WaiterError(e.to_string()))
    }
}
