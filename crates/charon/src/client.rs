//! The Charon client: discovers a server instance, forwards RPC calls to
//! it and tracks pushed notification state.
//!
//! Discovery is a two-round handshake: a ping message to the configured
//! bare JID, answered by ready servers with a pong presence carrying their
//! version and notification capabilities.  The first acceptable pong wins;
//! a directed presence back to the chosen instance completes the mutual
//! subscription, so its disappearance clears the selection and the next
//! call discovers afresh.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use jid::{BareJid, FullJid, Jid};
use serde_json::Value;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::message::{Message, MessageType};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use crate::connection::{make_iq, Connection, ConnectionEvent, Stanza};
use crate::error::RpcError;
use crate::notifications::NotificationType;
use crate::pubsub::ItemCallback;
use crate::stanza::{
    find_payload, NotificationUpdate, Ping, Pong, RpcRequest, RpcResponse, ResponseKind,
    SupportedNotifications, NS_CHARON,
};
use crate::transport::{ConnectionConfig, Connector};

/// Default timeout for discovery and forwarded calls.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Fixed poll timeout for wait-for-change calls.
const WAITFORCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for pub/sub subscription round-trips.
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Client-side state of one enabled notification type.
struct ClientNotification {
    notification: Arc<dyn NotificationType>,
    state: StdMutex<Option<Value>>,
    version: watch::Sender<u64>,
}

impl ClientNotification {
    fn new(notification: Arc<dyn NotificationType>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            notification,
            state: StdMutex::new(None),
            version,
        }
    }

    fn apply_update(&self, update: &NotificationUpdate) {
        {
            let mut state = self.state.lock().expect("notification state poisoned");
            *state = Some(update.state().clone());
        }
        self.version.send_modify(|v| *v += 1);
    }
}

struct ClientInner<C: Connector> {
    server_jid: BareJid,
    version: String,
    timeout: StdMutex<Duration>,
    connection: Connection<C>,
    selected: watch::Sender<Option<FullJid>>,
    /// Deadline of the in-flight discovery ping, if any.
    ping: StdMutex<Option<Instant>>,
    notifications: StdMutex<BTreeMap<String, Arc<ClientNotification>>>,
    /// Handles of in-flight subscription tasks; joined on reselection and
    /// by `get_server_resource`.
    subscriptions: AsyncMutex<Vec<JoinHandle<()>>>,
    event_task: StdMutex<Option<JoinHandle<()>>>,
}

/// The client component.  Cheap to clone; all clones share the XMPP
/// connection and selection state.
pub struct Client<C: Connector> {
    inner: Arc<ClientInner<C>>,
}

impl<C: Connector> Clone for Client<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> Client<C> {
    /// Creates the client.  `server_jid` is the account whose instances
    /// will be discovered; `version` must match what they advertise.
    pub fn new(
        server_jid: BareJid,
        version: impl Into<String>,
        connector: C,
        config: ConnectionConfig,
    ) -> Self {
        let (connection, events) = Connection::new(connector, config);
        let (selected, _) = watch::channel(None);

        let inner = Arc::new(ClientInner {
            server_jid,
            version: version.into(),
            timeout: StdMutex::new(DEFAULT_TIMEOUT),
            connection,
            selected,
            ping: StdMutex::new(None),
            notifications: StdMutex::new(BTreeMap::new()),
            subscriptions: AsyncMutex::new(Vec::new()),
            event_task: StdMutex::new(None),
        });

        let client = Self { inner };
        let task = tokio::spawn(run_events(Arc::clone(&client.inner), events));
        *client.inner.event_task.lock().expect("event task poisoned") = Some(task);
        client
    }

    /// Sets the timeout for discovery and forwarded calls.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.inner.timeout.lock().expect("timeout poisoned") = timeout;
    }

    pub fn set_root_ca(&self, path: std::path::PathBuf) {
        self.inner.connection.set_root_ca(path);
    }

    /// Enables a notification type.  Must be called before connecting.
    pub fn add_notification(&self, notification: Arc<dyn NotificationType>) {
        assert!(
            !self.inner.connection.is_connected(),
            "notifications must be added before connecting"
        );
        let type_name = notification.type_name().to_string();
        let previous = self
            .inner
            .notifications
            .lock()
            .expect("notifications poisoned")
            .insert(type_name.clone(), Arc::new(ClientNotification::new(notification)));
        assert!(previous.is_none(), "duplicate notification: {type_name}");
    }

    pub async fn connect(&self) -> Result<(), crate::error::ConnectionError> {
        self.inner.connection.connect(0).await
    }

    pub async fn disconnect(&self) {
        self.inner.selected.send_replace(None);
        // Tearing the connection down first wakes subscription calls that
        // are still blocked on a service reply, so the join below cannot
        // stall.
        self.inner.connection.disconnect().await;
        let previous: Vec<JoinHandle<()>> =
            self.inner.subscriptions.lock().await.drain(..).collect();
        for handle in previous {
            let _ = handle.await;
        }

        if let Some(task) = self
            .inner
            .event_task
            .lock()
            .expect("event task poisoned")
            .take()
        {
            task.abort();
        }
    }

    /// Forces discovery if needed and returns the selected server's
    /// resource, or the empty string if none could be found.  Also joins
    /// any subscription calls still in flight, so callers can rely on
    /// notifications being set up afterwards.
    pub async fn get_server_resource(&self) -> String {
        let selected = ensure_connected(&self.inner).await;

        let previous: Vec<JoinHandle<()>> =
            self.inner.subscriptions.lock().await.drain(..).collect();
        for handle in previous {
            let _ = handle.await;
        }

        selected
            .map(|jid| jid.resource().to_string())
            .unwrap_or_default()
    }

    /// Forwards an RPC call to the selected server and returns its
    /// result, discovering a server first if necessary.
    pub async fn forward_method(&self, method: &str, params: &Value) -> Result<Value, RpcError> {
        let Some(target) = ensure_connected(&self.inner).await else {
            return Err(RpcError::internal(format!(
                "could not discover full server JID for {}",
                self.inner.server_jid
            )));
        };

        let sender = self
            .inner
            .connection
            .sender()
            .map_err(|e| RpcError::internal(format!("not connected: {e}")))?;
        let id = sender.next_id();
        let request = RpcRequest::new(method, params.clone());
        let iq = make_iq(&Jid::from(target.clone()), "get", &id, request.to_element());

        let mut waiter = sender.register(&id);
        sender
            .send(iq)
            .map_err(|e| RpcError::internal(format!("failed to send request: {e}")))?;
        info!(method, target = %target, "sent IQ request");

        let timeout = *self.inner.timeout.lock().expect("timeout poisoned");
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(method, "call timed out");
                return Err(RpcError::internal(format!(
                    "timeout waiting for result from {target}"
                )));
            }

            let reply = match tokio::time::timeout(remaining, waiter.recv()).await {
                Ok(Some(reply)) => reply,
                Ok(None) => {
                    return Err(RpcError::internal(
                        "connection closed while waiting for reply",
                    ));
                }
                Err(_) => {
                    warn!(method, "call timed out");
                    return Err(RpcError::internal(format!(
                        "timeout waiting for result from {target}"
                    )));
                }
            };

            match interpret_reply(&reply) {
                ReplyOutcome::Success(result) => return Ok(result),
                ReplyOutcome::Error(error) => return Err(error),
                ReplyOutcome::Unavailable => {
                    // The selected instance is gone.  The call fails; the
                    // accompanying unavailable presence clears the
                    // selection so the next call rediscovers.
                    warn!(target = %target, "server resource is unavailable");
                    return Err(RpcError::internal(format!(
                        "server {target} is unavailable"
                    )));
                }
                ReplyOutcome::Ignore => {
                    debug!("ignoring unusable reply, continuing to wait");
                }
            }
        }
    }

    /// Waits for a state change of the given notification type.  Returns
    /// immediately if the current state does not match `known`; otherwise
    /// waits up to the fixed poll timeout and returns whatever the
    /// current state then is (possibly JSON null).
    pub async fn wait_for_change(&self, type_name: &str, known: Value) -> Result<Value, RpcError> {
        let entry = self
            .inner
            .notifications
            .lock()
            .expect("notifications poisoned")
            .get(type_name)
            .cloned();
        let Some(entry) = entry else {
            return Err(RpcError::internal(format!(
                "notification type {type_name} is not enabled"
            )));
        };

        let mut version = entry.version.subscribe();
        version.borrow_and_update();

        {
            let state = entry.state.lock().expect("notification state poisoned");
            if let Some(current) = &*state {
                // The always-block sentinel matches nothing, so it always
                // falls through to the wait below.
                if known != entry.notification.always_block_id() {
                    let current_id = entry.notification.extract_state_id(current);
                    if current_id.as_ref() != Some(&known) {
                        return Ok(current.clone());
                    }
                }
            }
        }

        let _ = tokio::time::timeout(WAITFORCHANGE_TIMEOUT, version.changed()).await;

        let state = entry
            .state
            .lock()
            .expect("notification state poisoned")
            .clone();
        Ok(state.unwrap_or(Value::Null))
    }
}

/* ************************************************************************ */

enum ReplyOutcome {
    Success(Value),
    Error(RpcError),
    Unavailable,
    Ignore,
}

fn interpret_reply(iq: &Iq) -> ReplyOutcome {
    match &iq.payload {
        IqType::Error(error) => {
            use xmpp_parsers::stanza_error::DefinedCondition;
            if error.defined_condition == DefinedCondition::ServiceUnavailable {
                ReplyOutcome::Unavailable
            } else {
                warn!(condition = ?error.defined_condition, "ignoring IQ error");
                ReplyOutcome::Ignore
            }
        }
        IqType::Result(Some(payload)) if payload.is("response", NS_CHARON) => {
            let response = RpcResponse::from_element(payload);
            match response.kind() {
                Some(ResponseKind::Success(result)) => ReplyOutcome::Success(result.clone()),
                Some(ResponseKind::Error {
                    code,
                    message,
                    data,
                }) => ReplyOutcome::Error(RpcError::with_data(*code, message.clone(), data.clone())),
                None => {
                    warn!("ignoring invalid response stanza");
                    ReplyOutcome::Ignore
                }
            }
        }
        _ => {
            warn!("ignoring IQ reply without response payload");
            ReplyOutcome::Ignore
        }
    }
}

/// Returns the selected server, performing the ping/pong discovery if
/// none is selected yet.  Concurrent callers share one in-flight ping.
async fn ensure_connected<C: Connector>(inner: &Arc<ClientInner<C>>) -> Option<FullJid> {
    let mut selected = inner.selected.subscribe();
    if let Some(jid) = selected.borrow_and_update().clone() {
        return Some(jid);
    }

    let timeout = *inner.timeout.lock().expect("timeout poisoned");
    let deadline = {
        let mut ping = inner.ping.lock().expect("ping state poisoned");
        match *ping {
            Some(deadline) if deadline > Instant::now() => deadline,
            _ => {
                info!(server = %inner.server_jid, "no full server JID, sending ping");
                let mut message = Message::new(Some(Jid::from(inner.server_jid.clone())));
                message.type_ = MessageType::Normal;
                message.payloads.push(Ping.to_element());
                if let Err(e) = inner.connection.send_stanza(message.into()) {
                    warn!(error = %e, "failed to send discovery ping");
                    return None;
                }

                let deadline = Instant::now() + timeout;
                *ping = Some(deadline);
                deadline
            }
        }
    };

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!("waiting for pong timed out");
            let mut ping = inner.ping.lock().expect("ping state poisoned");
            if *ping == Some(deadline) {
                *ping = None;
            }
            return None;
        }

        match tokio::time::timeout(remaining, selected.changed()).await {
            Ok(Ok(())) => {
                if let Some(jid) = selected.borrow_and_update().clone() {
                    info!(jid = %jid, "we now have a full server JID");
                    return Some(jid);
                }
            }
            Ok(Err(_)) => return None,
            Err(_) => continue,
        }
    }
}

async fn run_events<C: Connector>(
    inner: Arc<ClientInner<C>>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Online => (),
            ConnectionEvent::Disconnected => {
                inner.selected.send_replace(None);
            }
            ConnectionEvent::Stanza(Stanza::Presence(presence)) => {
                handle_presence(&inner, &presence).await;
            }
            ConnectionEvent::Stanza(_) => (),
        }
    }
}

async fn handle_presence<C: Connector>(inner: &Arc<ClientInner<C>>, presence: &Presence) {
    let Some(from) = presence.from.clone() else {
        return;
    };

    match presence.type_ {
        PresenceType::Unavailable => {
            let selected = inner.selected.borrow().clone();
            if let Some(selected) = selected {
                if Jid::from(selected.clone()) == from {
                    info!(jid = %selected, "selected server became unavailable");
                    inner.selected.send_replace(None);
                }
            }
        }
        PresenceType::None => {
            let Some(pong_elem) = find_payload(&presence.payloads, "pong") else {
                return;
            };
            let pong = Pong::from_element(pong_elem);

            if pong.version().unwrap_or_default() != inner.version {
                warn!(
                    advertised = ?pong.version(),
                    required = %inner.version,
                    "dropping pong with wrong version"
                );
                return;
            }

            let enabled: Vec<String> = inner
                .notifications
                .lock()
                .expect("notifications poisoned")
                .keys()
                .cloned()
                .collect();

            let supported = find_payload(&presence.payloads, "notifications")
                .map(SupportedNotifications::from_element);
            if !enabled.is_empty() {
                let Some(supported) = &supported else {
                    warn!("dropping pong without notification declaration");
                    return;
                };
                if !supported.is_valid() {
                    warn!("dropping pong with invalid notification declaration");
                    return;
                }
                let missing: Vec<&String> = enabled
                    .iter()
                    .filter(|t| !supported.notifications().contains_key(*t))
                    .collect();
                if !missing.is_empty() {
                    warn!(?missing, "dropping pong lacking required notifications");
                    return;
                }
            }

            let Ok(full) = from.clone().try_into_full() else {
                warn!(from = %from, "dropping pong from bare JID");
                return;
            };
            if full.to_bare() != inner.server_jid {
                warn!(from = %full, "dropping pong from unexpected sender");
                return;
            }

            // First pong wins; later replies are ignored.
            if inner.selected.borrow().is_some() {
                debug!(from = %full, "already have a selected server");
                return;
            }

            set_selected_server(inner, full, supported).await;
        }
        _ => (),
    }
}

async fn set_selected_server<C: Connector>(
    inner: &Arc<ClientInner<C>>,
    full: FullJid,
    supported: Option<SupportedNotifications>,
) {
    assert_eq!(full.to_bare(), inner.server_jid);
    info!(jid = %full, "found full server JID");

    // Directed presence back to the chosen instance completes the mutual
    // presence subscription.
    let handshake = Presence {
        from: None,
        to: Some(Jid::from(full.clone())),
        id: None,
        type_: PresenceType::None,
        show: None,
        statuses: Default::default(),
        priority: 0i8,
        payloads: vec![],
    };
    if let Err(e) = inner.connection.send_stanza(handshake.into()) {
        warn!(error = %e, "failed to send directed presence");
    }

    let enabled = !inner
        .notifications
        .lock()
        .expect("notifications poisoned")
        .is_empty();
    if enabled {
        if let Some(supported) = supported {
            // Subscriptions block on service replies, so they run on their
            // own task; the previous selection's calls are finished off
            // first.  The handle is registered before the selection is
            // published, so anyone observing the new selection can join
            // the subscription call.
            let mut subscriptions = inner.subscriptions.lock().await;
            let previous: Vec<JoinHandle<()>> = subscriptions.drain(..).collect();
            let task = tokio::spawn(run_subscriptions(Arc::clone(inner), supported, previous));
            subscriptions.push(task);
        }
    }

    inner.selected.send_replace(Some(full));
}

async fn run_subscriptions<C: Connector>(
    inner: Arc<ClientInner<C>>,
    supported: SupportedNotifications,
    previous: Vec<JoinHandle<()>>,
) {
    for handle in previous {
        let _ = handle.await;
    }

    let service = match Jid::from_str(supported.service()) {
        Ok(service) => service,
        Err(e) => {
            warn!(service = supported.service(), error = %e, "invalid pubsub service");
            return;
        }
    };
    let pubsub = match inner.connection.attach_pubsub(service, SUBSCRIBE_TIMEOUT) {
        Ok(pubsub) => pubsub,
        Err(e) => {
            warn!(error = %e, "cannot attach pubsub while disconnected");
            return;
        }
    };

    let entries: Vec<(String, Arc<ClientNotification>)> = inner
        .notifications
        .lock()
        .expect("notifications poisoned")
        .iter()
        .map(|(k, v)| (k.clone(), Arc::clone(v)))
        .collect();

    for (type_name, entry) in entries {
        let Some(node) = supported.notifications().get(&type_name) else {
            // The presence handler verified the declaration is a superset
            // of the enabled types.
            continue;
        };

        let expected = type_name.clone();
        let target = Arc::clone(&entry);
        let callback: ItemCallback = Box::new(move |payload| {
            let update = NotificationUpdate::from_element(payload);
            if !update.is_valid() {
                warn!("dropping invalid notification update");
                return;
            }
            if update.type_name() != expected {
                warn!(
                    got = update.type_name(),
                    %expected, "dropping update of unexpected type"
                );
                return;
            }
            target.apply_update(&update);
        });

        if pubsub.subscribe_to_node(node, callback).await {
            debug!(%type_name, %node, "subscribed to notification node");
        } else {
            warn!(%type_name, %node, "failed to subscribe to notification node");
        }
    }
}
