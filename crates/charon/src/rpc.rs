//! Backend RPC glue: the method-handler capability used by the server and
//! a forwarding implementation that proxies an allow-listed set of methods
//! to a JSON-RPC HTTP endpoint.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{rpc_codes, RpcError};

/// Answers method calls on behalf of the Charon server.  Returns the JSON
/// result on success and an `RpcError` for everything the caller should
/// see as a JSON-RPC error.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle_method(&self, method: &str, params: &Value) -> Result<Value, RpcError>;
}

/// Forwards calls for a fixed set of allowed methods to another JSON-RPC
/// endpoint; every other method fails with the well-known
/// method-not-found code.
pub struct ForwardingRpcServer {
    methods: HashSet<String>,
    url: String,
    http: reqwest::Client,
    counter: AtomicU64,
}

impl ForwardingRpcServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            methods: HashSet::new(),
            url: url.into(),
            http: reqwest::Client::new(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn allow_method(&mut self, method: impl Into<String>) {
        self.methods.insert(method.into());
    }
}

#[async_trait]
impl RpcHandler for ForwardingRpcServer {
    async fn handle_method(&self, method: &str, params: &Value) -> Result<Value, RpcError> {
        debug!(method, "attempted forwarding call");

        if !self.methods.contains(method) {
            return Err(RpcError::method_not_found(method));
        }

        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        call_json_rpc(&self.http, &self.url, id, method, params).await
    }
}

/// Performs one JSON-RPC 2.0 call over HTTP.  Transport problems surface
/// as internal errors; an error object in the response is returned
/// verbatim.
pub async fn call_json_rpc(
    http: &reqwest::Client,
    url: &str,
    id: u64,
    method: &str,
    params: &Value,
) -> Result<Value, RpcError> {
    let request = json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    });

    let response = http
        .post(url)
        .json(&request)
        .send()
        .await
        .map_err(|e| RpcError::internal(format!("HTTP request to {url} failed: {e}")))?;

    let body: Value = response
        .json()
        .await
        .map_err(|e| RpcError::internal(format!("invalid JSON-RPC response from {url}: {e}")))?;

    parse_json_rpc_response(body)
}

/// Splits a JSON-RPC 2.0 response body into result or error.
pub fn parse_json_rpc_response(body: Value) -> Result<Value, RpcError> {
    if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
        let code = error
            .get("code")
            .and_then(Value::as_i64)
            .unwrap_or(rpc_codes::INTERNAL_ERROR);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let data = error.get("data").cloned().unwrap_or(Value::Null);
        return Err(RpcError::with_data(code, message, data));
    }

    match body.get("result") {
        Some(result) => Ok(result.clone()),
        None => Err(RpcError::internal("JSON-RPC response without result")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_method_is_rejected_without_network() {
        let mut server = ForwardingRpcServer::new("http://localhost:1/");
        server.allow_method("allowed");

        let error = server
            .handle_method("forbidden", &json!([]))
            .await
            .expect_err("must be rejected");
        assert_eq!(error.code, rpc_codes::METHOD_NOT_FOUND);
        assert!(error.message.contains("forbidden"));
    }

    #[test]
    fn response_parsing_handles_result_and_error() {
        let ok = json!({"jsonrpc": "2.0", "id": 1, "result": {"x": 5}});
        assert_eq!(parse_json_rpc_response(ok).unwrap(), json!({"x": 5}));

        let err = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": 42, "message": "boom", "data": ["d"]},
        });
        let error = parse_json_rpc_response(err).unwrap_err();
        assert_eq!(error.code, 42);
        assert_eq!(error.message, "boom");
        assert_eq!(error.data, json!(["d"]));

        let null_error = json!({"jsonrpc": "2.0", "id": 1, "result": 7, "error": null});
        assert_eq!(parse_json_rpc_response(null_error).unwrap(), json!(7));

        let empty = json!({"jsonrpc": "2.0", "id": 1});
        assert!(parse_json_rpc_response(empty).is_err());
    }
}
