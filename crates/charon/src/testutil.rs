//! Shared test utilities: an in-process stanza broker with a pub/sub
//! service, a dummy RPC backend and settable update sources.
//!
//! The broker stands in for a real XMPP server in tests: it routes
//! message/presence/iq stanzas between connected transports, emulates the
//! pub/sub service (instant nodes, publishes fanned out to subscribers)
//! and emits unavailable presences to directed-presence peers when a
//! party disconnects.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use jid::{FullJid, Jid};
use minidom::Element;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::debug;

use crate::error::{ConnectionError, RpcError};
use crate::pubsub::{NS_PUBSUB, NS_PUBSUB_EVENT, NS_PUBSUB_OWNER};
use crate::rpc::RpcHandler;
use crate::stream::ns;
use crate::transport::{ConnectionConfig, Connector, Session, StanzaTransport};
use crate::waiter::{UpdateWaiter, WaiterError};

/// The pub/sub service JID emulated by the broker.
pub const PUBSUB_SERVICE: &str = "pubsub.example.com";

#[derive(Default)]
struct NodeState {
    subscribers: HashSet<String>,
}

#[derive(Default)]
struct BrokerInner {
    clients: HashMap<String, mpsc::UnboundedSender<Element>>,
    bare_index: HashMap<String, Vec<String>>,
    /// Who gets an unavailable presence when a full JID disappears.
    presence_peers: HashMap<String, HashSet<String>>,
    nodes: HashMap<String, NodeState>,
    fail_node_creation: bool,
    counter: u64,
}

/// In-process stanza broker.
#[derive(Clone, Default)]
pub struct Broker {
    inner: Arc<StdMutex<BrokerInner>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> BrokerConnector {
        BrokerConnector {
            broker: self.clone(),
        }
    }

    /// Forcibly drops a client, as if its TCP connection died.  Directed
    /// presence peers are notified.
    pub fn kill(&self, jid: &FullJid) {
        self.remove_client(&jid.to_string());
    }

    /// All live node names, for asserting on node lifecycle.
    pub fn node_names(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("broker poisoned");
        inner.nodes.keys().cloned().collect()
    }

    /// Makes the pub/sub service reject node creation requests.
    pub fn fail_node_creation(&self, fail: bool) {
        self.inner.lock().expect("broker poisoned").fail_node_creation = fail;
    }

    fn register(
        &self,
        config: &ConnectionConfig,
    ) -> Result<(FullJid, mpsc::UnboundedReceiver<Element>), ConnectionError> {
        let mut inner = self.inner.lock().expect("broker poisoned");

        inner.counter += 1;
        let resource = match config.jid.resource() {
            Some(resource) => resource.to_string(),
            None => format!("res-{}", inner.counter),
        };
        let full = FullJid::from_str(&format!(
            "{}@{}/{}",
            config
                .jid
                .node()
                .ok_or_else(|| ConnectionError::AuthenticationFailed(
                    "JID without local part".to_string()
                ))?,
            config.jid.domain(),
            resource,
        ))
        .map_err(|e| ConnectionError::StreamError(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let key = full.to_string();
        inner.clients.insert(key.clone(), tx);
        inner
            .bare_index
            .entry(full.to_bare().to_string())
            .or_default()
            .push(key);

        Ok((full, rx))
    }

    fn remove_client(&self, full: &str) {
        let peers = {
            let mut inner = self.inner.lock().expect("broker poisoned");
            inner.clients.remove(full);

            let bare = full.split('/').next().unwrap_or(full).to_string();
            if let Some(resources) = inner.bare_index.get_mut(&bare) {
                resources.retain(|r| r != full);
            }
            for node in inner.nodes.values_mut() {
                node.subscribers.remove(full);
            }

            inner.presence_peers.remove(full)
        };

        if let Some(peers) = peers {
            for peer in peers {
                let unavailable = Element::builder("presence", ns::JABBER_CLIENT)
                    .attr("type", "unavailable")
                    .attr("from", full)
                    .attr("to", peer.as_str())
                    .build();
                self.deliver(&peer, unavailable);
            }
        }
    }

    fn deliver(&self, to: &str, element: Element) {
        let tx = {
            let inner = self.inner.lock().expect("broker poisoned");
            inner.clients.get(to).cloned()
        };
        if let Some(tx) = tx {
            let _ = tx.send(element);
        }
    }

    fn route(&self, from: &FullJid, mut element: Element) {
        element.set_attr("from", from.to_string());

        let Some(to) = element.attr("to").map(str::to_string) else {
            // Undirected presence and the like need no routing here.
            return;
        };

        if element.name() == "presence" && element.attr("type").is_none() {
            // A directed available presence creates the mutual pair used
            // for unavailability notification.
            let mut inner = self.inner.lock().expect("broker poisoned");
            inner
                .presence_peers
                .entry(from.to_string())
                .or_default()
                .insert(to.clone());
            inner
                .presence_peers
                .entry(to.clone())
                .or_default()
                .insert(from.to_string());
        }

        if to == PUBSUB_SERVICE {
            self.handle_pubsub(from, &element);
            return;
        }

        let recipients: Vec<String> = {
            let inner = self.inner.lock().expect("broker poisoned");
            if inner.clients.contains_key(&to) {
                vec![to.clone()]
            } else {
                inner.bare_index.get(&to).cloned().unwrap_or_default()
            }
        };

        if recipients.is_empty() {
            debug!(%to, "no recipient for stanza");
            if element.name() == "iq"
                && matches!(element.attr("type"), Some("get") | Some("set"))
            {
                let reply = service_unavailable_reply(&element, &to, &from.to_string());
                self.deliver(&from.to_string(), reply);
            }
            return;
        }

        for recipient in recipients {
            self.deliver(&recipient, element.clone());
        }
    }

    fn handle_pubsub(&self, from: &FullJid, element: &Element) {
        if element.name() != "iq" {
            return;
        }
        let id = element.attr("id").unwrap_or_default().to_string();
        let sender = from.to_string();

        let reply = |payload: Option<Element>| {
            let mut builder = Element::builder("iq", ns::JABBER_CLIENT)
                .attr("type", "result")
                .attr("id", id.as_str())
                .attr("from", PUBSUB_SERVICE)
                .attr("to", sender.as_str());
            if let Some(payload) = payload {
                builder = builder.append(payload);
            }
            builder.build()
        };
        let error = || service_unavailable_reply(element, PUBSUB_SERVICE, &sender);

        let Some(pubsub) = element
            .get_child("pubsub", NS_PUBSUB)
            .or_else(|| element.get_child("pubsub", NS_PUBSUB_OWNER))
        else {
            self.deliver(&sender, error());
            return;
        };

        if pubsub.get_child("create", NS_PUBSUB).is_some() {
            let node = {
                let mut inner = self.inner.lock().expect("broker poisoned");
                if inner.fail_node_creation {
                    drop(inner);
                    self.deliver(&sender, error());
                    return;
                }
                inner.counter += 1;
                let node = format!("instant-{}", inner.counter);
                inner.nodes.insert(node.clone(), NodeState::default());
                node
            };
            let created = Element::builder("pubsub", NS_PUBSUB)
                .append(
                    Element::builder("create", NS_PUBSUB)
                        .attr("node", node.as_str())
                        .build(),
                )
                .build();
            self.deliver(&sender, reply(Some(created)));
        } else if let Some(publish) = pubsub.get_child("publish", NS_PUBSUB) {
            let Some(node) = publish.attr("node") else {
                self.deliver(&sender, error());
                return;
            };
            let subscribers: Vec<String> = {
                let inner = self.inner.lock().expect("broker poisoned");
                match inner.nodes.get(node) {
                    Some(state) => state.subscribers.iter().cloned().collect(),
                    None => {
                        drop(inner);
                        self.deliver(&sender, error());
                        return;
                    }
                }
            };

            let payloads: Vec<Element> = publish
                .children()
                .filter(|c| c.name() == "item")
                .filter_map(|item| item.children().next().cloned())
                .collect();
            for subscriber in subscribers {
                let mut items = Element::builder("items", NS_PUBSUB_EVENT)
                    .attr("node", node)
                    .build();
                for payload in &payloads {
                    items.append_child(
                        Element::builder("item", NS_PUBSUB_EVENT)
                            .append(payload.clone())
                            .build(),
                    );
                }
                let event = Element::builder("event", NS_PUBSUB_EVENT).append(items).build();
                let message = Element::builder("message", ns::JABBER_CLIENT)
                    .attr("from", PUBSUB_SERVICE)
                    .attr("to", subscriber.as_str())
                    .append(event)
                    .build();
                self.deliver(&subscriber, message);
            }

            self.deliver(&sender, reply(None));
        } else if let Some(subscribe) = pubsub.get_child("subscribe", NS_PUBSUB) {
            let granted = {
                let mut inner = self.inner.lock().expect("broker poisoned");
                match subscribe.attr("node").and_then(|n| inner.nodes.get_mut(n)) {
                    Some(state) => {
                        state.subscribers.insert(sender.clone());
                        true
                    }
                    None => false,
                }
            };

            if granted {
                let node = subscribe.attr("node").unwrap_or_default();
                let subscription = Element::builder("pubsub", NS_PUBSUB)
                    .append(
                        Element::builder("subscription", NS_PUBSUB)
                            .attr("node", node)
                            .attr("jid", sender.as_str())
                            .attr("subscription", "subscribed")
                            .build(),
                    )
                    .build();
                self.deliver(&sender, reply(Some(subscription)));
            } else {
                self.deliver(&sender, error());
            }
        } else if let Some(unsubscribe) = pubsub.get_child("unsubscribe", NS_PUBSUB) {
            {
                let mut inner = self.inner.lock().expect("broker poisoned");
                if let Some(state) = unsubscribe
                    .attr("node")
                    .and_then(|n| inner.nodes.get_mut(n))
                {
                    state.subscribers.remove(&sender);
                }
            }
            self.deliver(&sender, reply(None));
        } else if let Some(delete) = pubsub.get_child("delete", NS_PUBSUB_OWNER) {
            {
                let mut inner = self.inner.lock().expect("broker poisoned");
                if let Some(node) = delete.attr("node") {
                    inner.nodes.remove(node);
                }
            }
            self.deliver(&sender, reply(None));
        } else {
            self.deliver(&sender, error());
        }
    }
}

fn service_unavailable_reply(request: &Element, from: &str, to: &str) -> Element {
    let condition =
        Element::builder("service-unavailable", ns::STANZAS).build();
    let error = Element::builder("error", ns::JABBER_CLIENT)
        .attr("type", "cancel")
        .append(condition)
        .build();
    Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", "error")
        .attr("id", request.attr("id").unwrap_or_default())
        .attr("from", from)
        .attr("to", to)
        .append(error)
        .build()
}

/* ************************************************************************ */

#[derive(Clone)]
pub struct BrokerConnector {
    broker: Broker,
}

pub struct BrokerTransport {
    broker: Broker,
    jid: FullJid,
    rx: mpsc::UnboundedReceiver<Element>,
    closed: bool,
}

impl Connector for BrokerConnector {
    type Transport = BrokerTransport;

    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Session<BrokerTransport>, ConnectionError> {
        let (jid, rx) = self.broker.register(config)?;
        Ok(Session {
            transport: BrokerTransport {
                broker: self.broker.clone(),
                jid: jid.clone(),
                rx,
                closed: false,
            },
            jid,
        })
    }
}

impl StanzaTransport for BrokerTransport {
    async fn send(&mut self, element: Element) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        self.broker.route(&self.jid, element);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Element>, ConnectionError> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        if !self.closed {
            self.closed = true;
            self.broker.remove_client(&self.jid.to_string());
        }
        Ok(())
    }
}

impl Drop for BrokerTransport {
    fn drop(&mut self) {
        if !self.closed {
            self.broker.remove_client(&self.jid.to_string());
        }
    }
}

/* ************************************************************************ */

/// A connection config for one of the test accounts.
pub fn test_config(name: &str) -> ConnectionConfig {
    let jid = Jid::from_str(&format!("{name}@example.com")).expect("valid test JID");
    let mut config = ConnectionConfig::new(jid, "password");
    config.timeout = Duration::from_secs(5);
    config
}

/// Dummy backend with two methods taking a single string argument:
/// `echo` returns it and `error` fails with it as message (code 42).
pub struct TestBackend;

pub const TEST_ERROR_CODE: i64 = 42;

#[async_trait]
impl RpcHandler for TestBackend {
    async fn handle_method(&self, method: &str, params: &Value) -> Result<Value, RpcError> {
        let arg = params
            .as_array()
            .and_then(|a| a.first())
            .cloned()
            .unwrap_or(Value::Null);

        match method {
            "echo" => Ok(arg),
            "error" => Err(RpcError::new(
                TEST_ERROR_CODE,
                arg.as_str().unwrap_or_default(),
            )),
            "slow" => {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(arg)
            }
            _ => Err(RpcError::method_not_found(method)),
        }
    }
}

/// A state source whose value tests set explicitly, driving the server's
/// waiter loop like a real long poll would.
#[derive(Clone)]
pub struct UpdatableState {
    tx: mpsc::UnboundedSender<Value>,
}

pub struct UpdatableStateWaiter {
    rx: AsyncMutex<mpsc::UnboundedReceiver<Value>>,
}

impl UpdatableState {
    pub fn new() -> (Self, Arc<UpdatableStateWaiter>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self { tx },
            Arc::new(UpdatableStateWaiter {
                rx: AsyncMutex::new(rx),
            }),
        )
    }

    /// Publishes a new full state to the waiter.
    pub fn set(&self, state: Value) {
        let _ = self.tx.send(state);
    }

    /// Makes the next waiter call fail, exercising the backoff path.
    pub fn fail(&self) {
        // Closing is not an option (the loop would hang), so failures are
        // signalled in-band.
        let _ = self.tx.send(Value::String("\u{0}fail".to_string()));
    }
}

#[async_trait]
impl UpdateWaiter for UpdatableStateWaiter {
    async fn wait_for_update(&self) -> Result<Value, WaiterError> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(Value::String(s)) if s == "\u{0}fail" => {
                Err(WaiterError("injected failure".to_string()))
            }
            Some(state) => Ok(state),
            None => std::future::pending().await,
        }
    }
}

/// Notification type for tests: the state is an object whose `id` field
/// is the identifier, so states with equal ids but different values are
/// equivalent for dedup.
pub struct IdNotification {
    name: String,
}

impl IdNotification {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl crate::notifications::NotificationType for IdNotification {
    fn type_name(&self) -> &str {
        &self.name
    }

    fn extract_state_id(&self, full_state: &Value) -> Option<Value> {
        full_state.as_object().and_then(|o| o.get("id")).cloned()
    }

    fn always_block_id(&self) -> Value {
        Value::String(String::new())
    }
}

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// A process-unique account name, so tests sharing a broker never clash.
pub fn unique_account(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}{n}")
}
