//! End-to-end behavior of the client/server pair over the in-process
//! broker: request forwarding, error propagation, timeouts, reselection
//! and the notification cycle.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use jid::{BareJid, Jid};
use serde_json::{json, Value};

use charon::client::Client;
use charon::error::rpc_codes;
use charon::notifications::NotificationType;
use charon::server::Server;
use charon::testutil::{
    test_config, unique_account, Broker, BrokerConnector, IdNotification, TestBackend,
    UpdatableState, PUBSUB_SERVICE, TEST_ERROR_CODE,
};
use charon::waiter::WaiterLoop;

fn bare(account: &str) -> BareJid {
    BareJid::from_str(&format!("{account}@example.com")).expect("valid account JID")
}

async fn start_server(broker: &Broker, account: &str, version: &str) -> Server<BrokerConnector> {
    let server = Server::new(
        version,
        Arc::new(TestBackend),
        broker.connector(),
        test_config(account),
    );
    server.connect(0).await.expect("server connect");
    server
}

fn new_client(broker: &Broker, server_account: &str, version: &str) -> Client<BrokerConnector> {
    Client::new(
        bare(server_account),
        version,
        broker.connector(),
        test_config(&unique_account("client")),
    )
}

/// Gives in-flight stanzas and background tasks time to land.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn happy_path_echo() {
    let broker = Broker::new();
    let account = unique_account("server");
    let server = start_server(&broker, &account, "1.0").await;

    let client = new_client(&broker, &account, "1.0");
    client.connect().await.expect("client connect");

    let result = client
        .forward_method("echo", &json!(["foo"]))
        .await
        .expect("echo succeeds");
    assert_eq!(result, json!("foo"));

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn backend_error_is_carried_as_rpc_error() {
    let broker = Broker::new();
    let account = unique_account("server");
    let server = start_server(&broker, &account, "1.0").await;

    let client = new_client(&broker, &account, "1.0");
    client.connect().await.expect("client connect");

    let error = client
        .forward_method("error", &json!(["foo"]))
        .await
        .expect_err("error method must fail");
    // The error came through as a JSON-RPC error embedded in an IQ result;
    // a transport-level failure would surface as internal error instead.
    assert_eq!(error.code, TEST_ERROR_CODE);
    assert_eq!(error.message, "foo");

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn method_not_allowed_uses_well_known_code() {
    let broker = Broker::new();
    let account = unique_account("server");
    let server = start_server(&broker, &account, "1.0").await;

    let client = new_client(&broker, &account, "1.0");
    client.connect().await.expect("client connect");

    let error = client
        .forward_method("no-such-method", &json!([]))
        .await
        .expect_err("unknown method must fail");
    assert_eq!(error.code, rpc_codes::METHOD_NOT_FOUND);

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn timeout_then_recovery() {
    let broker = Broker::new();
    let account = unique_account("server");
    let server = start_server(&broker, &account, "1.0").await;

    let client = new_client(&broker, &account, "1.0");
    client.connect().await.expect("client connect");

    // Select a server first so the short timeout only hits the call.
    assert!(!client.get_server_resource().await.is_empty());

    client.set_timeout(Duration::from_millis(10));
    let error = client
        .forward_method("slow", &json!(["x"]))
        .await
        .expect_err("must time out");
    assert_eq!(error.code, rpc_codes::INTERNAL_ERROR);
    assert!(error.message.contains("timeout"), "{}", error.message);

    // With the timeout restored the next call succeeds.
    client.set_timeout(Duration::from_secs(3));
    let result = client
        .forward_method("echo", &json!(["back"]))
        .await
        .expect("echo succeeds after restoring the timeout");
    assert_eq!(result, json!("back"));

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn reselection_after_server_disappears() {
    let broker = Broker::new();
    let account = unique_account("server");
    let s1 = start_server(&broker, &account, "1.0").await;
    let s2 = start_server(&broker, &account, "1.0").await;

    let client = new_client(&broker, &account, "1.0");
    client.connect().await.expect("client connect");

    let result = client
        .forward_method("echo", &json!(["one"]))
        .await
        .expect("first call succeeds");
    assert_eq!(result, json!("one"));

    let selected = client.get_server_resource().await;
    assert!(!selected.is_empty());

    // Kill the selected instance; the mutual presence subscription makes
    // the broker tell the client, which clears its selection.
    let (victim, survivor) = if s1.jid().unwrap().resource().as_str() == selected {
        (&s1, &s2)
    } else {
        (&s2, &s1)
    };
    victim.disconnect().await;
    settle().await;

    let result = client
        .forward_method("echo", &json!(["two"]))
        .await
        .expect("second call succeeds via the surviving instance");
    assert_eq!(result, json!("two"));

    let reselected = client.get_server_resource().await;
    assert_eq!(
        reselected,
        survivor.jid().unwrap().resource().as_str(),
        "the client must have moved to the surviving instance"
    );

    // With no server left at all, calls fail after the timeout.
    survivor.disconnect().await;
    settle().await;

    client.set_timeout(Duration::from_millis(200));
    let error = client
        .forward_method("echo", &json!(["three"]))
        .await
        .expect_err("no server left");
    assert_eq!(error.code, rpc_codes::INTERNAL_ERROR);

    client.disconnect().await;
    s1.shutdown().await;
    s2.shutdown().await;
}

#[tokio::test]
async fn version_mismatch_prevents_selection() {
    let broker = Broker::new();
    let account = unique_account("server");
    let server = start_server(&broker, &account, "2.0").await;

    let client = new_client(&broker, &account, "1.0");
    client.set_timeout(Duration::from_millis(200));
    client.connect().await.expect("client connect");

    assert_eq!(client.get_server_resource().await, "");

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn missing_notification_support_prevents_selection() {
    let broker = Broker::new();
    let account = unique_account("server");
    // The server offers no notifications at all.
    let server = start_server(&broker, &account, "1.0").await;

    let client = new_client(&broker, &account, "1.0");
    client.add_notification(Arc::new(IdNotification::new("state")));
    client.set_timeout(Duration::from_millis(200));
    client.connect().await.expect("client connect");

    assert_eq!(client.get_server_resource().await, "");

    client.disconnect().await;
    server.shutdown().await;
}

struct NotificationSetup {
    broker: Broker,
    account: String,
    server: Server<BrokerConnector>,
    client: Client<BrokerConnector>,
    state: UpdatableState,
}

async fn notification_setup() -> NotificationSetup {
    let broker = Broker::new();
    let account = unique_account("server");

    let server = Server::new(
        "1.0",
        Arc::new(TestBackend),
        broker.connector(),
        test_config(&account),
    );
    server.add_pubsub(Jid::from_str(PUBSUB_SERVICE).unwrap());

    let (state, waiter) = UpdatableState::new();
    let notification: Arc<dyn NotificationType> = Arc::new(IdNotification::new("state"));
    let mut waiter_loop = WaiterLoop::new(notification, waiter);
    waiter_loop.set_backoff(Duration::from_millis(20));
    server.add_notification(waiter_loop).await;

    server.connect(0).await.expect("server connect");
    assert!(server.is_ready());

    let client = new_client(&broker, &account, "1.0");
    client.add_notification(Arc::new(IdNotification::new("state")));
    client.connect().await.expect("client connect");

    // Forcing discovery also joins the subscription calls, so updates
    // published afterwards reach the client.
    assert!(!client.get_server_resource().await.is_empty());

    NotificationSetup {
        broker,
        account,
        server,
        client,
        state,
    }
}

fn spawn_wait(
    client: &Client<BrokerConnector>,
    known: Value,
) -> tokio::task::JoinHandle<Result<Value, charon::error::RpcError>> {
    let client = client.clone();
    tokio::spawn(async move { client.wait_for_change("state", known).await })
}

#[tokio::test]
async fn wait_for_change_cycle() {
    let setup = notification_setup().await;

    // No state is known anywhere yet: the call blocks.
    let call = spawn_wait(&setup.client, json!(""));
    settle().await;
    assert!(!call.is_finished());

    setup.state.set(json!({"id": "a", "value": "1"}));
    let result = call.await.unwrap().expect("wait returns first state");
    assert_eq!(result, json!({"id": "a", "value": "1"}));

    // Known id matches the current state: blocks until the id changes.
    let call = spawn_wait(&setup.client, json!("a"));
    settle().await;
    assert!(!call.is_finished());

    setup.state.set(json!({"id": "b", "value": "2"}));
    let result = call.await.unwrap().expect("wait returns second state");
    assert_eq!(result, json!({"id": "b", "value": "2"}));

    // A mismatching known id returns immediately.
    let result = setup
        .client
        .wait_for_change("state", json!("a"))
        .await
        .expect("mismatch returns current state");
    assert_eq!(result, json!({"id": "b", "value": "2"}));

    // A different value with the same id is deduplicated by the server
    // and must not wake the call.
    let call = spawn_wait(&setup.client, json!("b"));
    setup.state.set(json!({"id": "b", "value": "3"}));
    settle().await;
    assert!(!call.is_finished());
    call.abort();

    setup.client.disconnect().await;
    setup.server.shutdown().await;
}

#[tokio::test]
async fn waiter_failure_backs_off_and_recovers() {
    let setup = notification_setup().await;

    let call = spawn_wait(&setup.client, json!(""));
    setup.state.fail();
    setup.state.set(json!({"id": "a", "value": "1"}));

    let result = call.await.unwrap().expect("update arrives after backoff");
    assert_eq!(result, json!({"id": "a", "value": "1"}));

    setup.client.disconnect().await;
    setup.server.shutdown().await;
}

#[tokio::test]
async fn notifications_survive_server_reconnect() {
    let setup = notification_setup().await;

    setup.state.set(json!({"id": "a", "value": "1"}));
    let result = setup
        .client
        .wait_for_change("state", json!(""))
        .await
        .expect("initial update");
    assert_eq!(result, json!({"id": "a", "value": "1"}));

    let node_before = setup.server.notification_node("state").await.unwrap();

    setup.server.disconnect().await;
    settle().await;
    setup.server.connect(0).await.expect("server reconnect");

    let node_after = setup.server.notification_node("state").await.unwrap();
    assert_ne!(node_before, node_after, "reconnect must recreate the node");

    // Explicit reselection re-subscribes the client to the fresh node.
    assert!(!setup.client.get_server_resource().await.is_empty());

    let call = spawn_wait(&setup.client, json!("a"));
    settle().await;
    setup.state.set(json!({"id": "b", "value": "2"}));

    let result = call.await.unwrap().expect("updates flow again");
    assert_eq!(result, json!({"id": "b", "value": "2"}));

    setup.client.disconnect().await;
    setup.server.shutdown().await;
}

#[tokio::test]
async fn discovery_fails_without_an_answering_server() {
    let broker = Broker::new();
    let account = unique_account("server");

    // The server exists but never connects, so nothing answers the ping
    // and discovery runs into its timeout.
    let server = Server::new(
        "1.0",
        Arc::new(TestBackend),
        broker.connector(),
        test_config(&account),
    );
    let client = new_client(&broker, &account, "1.0");
    client.set_timeout(Duration::from_millis(150));
    client.connect().await.expect("client connect");

    let error = client
        .forward_method("echo", &json!(["x"]))
        .await
        .expect_err("no ready server answers");
    assert_eq!(error.code, rpc_codes::INTERNAL_ERROR);

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn notification_added_while_connected_starts_publishing() {
    let setup = notification_setup().await;
    assert_eq!(setup.broker.node_names().len(), 1);

    let (_pending_state, waiter) = UpdatableState::new();
    let mut waiter_loop = WaiterLoop::new(Arc::new(IdNotification::new("pending")), waiter);
    waiter_loop.set_backoff(Duration::from_millis(20));
    setup.server.add_notification(waiter_loop).await;

    // The node is created right away and the server stays ready.
    assert!(setup.server.is_ready());
    assert!(setup.server.notification_node("pending").await.is_some());
    assert_eq!(setup.broker.node_names().len(), 2);

    setup.client.disconnect().await;
    setup.server.shutdown().await;
}

#[tokio::test]
async fn failed_node_creation_clears_readiness() {
    let setup = notification_setup().await;
    assert!(setup.server.is_ready());

    setup.broker.fail_node_creation(true);
    let (_pending_state, waiter) = UpdatableState::new();
    let mut waiter_loop = WaiterLoop::new(Arc::new(IdNotification::new("pending")), waiter);
    waiter_loop.set_backoff(Duration::from_millis(20));
    setup.server.add_notification(waiter_loop).await;

    // With one notification not publishing, the server is no longer
    // ready and stops answering discovery pings.
    assert!(!setup.server.is_ready());
    assert!(setup.server.notification_node("pending").await.is_none());

    let probe = new_client(&setup.broker, &setup.account, "1.0");
    probe.set_timeout(Duration::from_millis(200));
    probe.connect().await.expect("probe connect");
    assert_eq!(probe.get_server_resource().await, "");

    // A reconnect cycle recreates all nodes and restores readiness.
    setup.broker.fail_node_creation(false);
    setup.server.disconnect().await;
    setup.server.connect(0).await.expect("server reconnect");
    assert!(setup.server.is_ready());
    assert!(setup.server.notification_node("pending").await.is_some());

    assert!(!probe.get_server_resource().await.is_empty());

    probe.disconnect().await;
    setup.client.disconnect().await;
    setup.server.shutdown().await;
}

#[tokio::test]
async fn owned_nodes_are_deleted_on_disconnect() {
    let setup = notification_setup().await;

    assert_eq!(setup.broker.node_names().len(), 1);
    setup.server.disconnect().await;
    settle().await;
    assert!(
        setup.broker.node_names().is_empty(),
        "the owned node must be deleted on disconnect"
    );

    setup.client.disconnect().await;
    setup.server.shutdown().await;
}
