//! The Charon server: answers forwarded RPC requests over IQ and pushes
//! notification updates through pub/sub.
//!
//! Each enabled notification runs its waiter loop permanently; the pub/sub
//! node only exists while connected.  The server answers discovery pings
//! only when *ready*, i.e. connected with every notification publishing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use jid::Jid;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::message::Message;
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use crate::connection::{
    make_iq, Connection, ConnectionEvent, Stanza, StanzaSender,
};
use crate::error::ConnectionError;
use crate::pubsub::PubSub;
use crate::rpc::RpcHandler;
use crate::stanza::{
    find_payload, NotificationUpdate, Pong, RpcRequest, RpcResponse, SupportedNotifications,
    NS_CHARON,
};
use crate::transport::{ConnectionConfig, Connector};
use crate::waiter::WaiterLoop;

/// Timeout for pub/sub service round-trips (node creation, publishes).
const PUBSUB_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a notification currently publishes to.  Empty while the server
/// is disconnected.
#[derive(Clone)]
struct PublishTarget {
    pubsub: Arc<PubSub>,
    node: String,
}

/// One enabled notification: the permanently running waiter loop plus the
/// publish target shared with its update handler.
struct ServerNotification {
    waiter: WaiterLoop,
    target: Arc<StdMutex<Option<PublishTarget>>>,
}

impl ServerNotification {
    fn new(mut waiter: WaiterLoop) -> Self {
        let target: Arc<StdMutex<Option<PublishTarget>>> = Arc::new(StdMutex::new(None));
        let type_name = waiter.type_name().to_string();

        let handler_target = Arc::clone(&target);
        waiter.set_update_handler(Arc::new(move |state| {
            let target = Arc::clone(&handler_target);
            let type_name = type_name.clone();
            Box::pin(async move {
                // The publish below blocks on the service reply, and the
                // disconnect path takes this lock to clear the target.
                // Snapshot and drop the lock before publishing.
                let snapshot = target.lock().expect("publish target poisoned").clone();
                let Some(PublishTarget { pubsub, node }) = snapshot else {
                    return;
                };

                debug!(%type_name, "publishing notification update");
                let payload = NotificationUpdate::new(type_name, state).to_element();
                pubsub.publish(&node, payload).await;
            })
        }));

        waiter.start();
        Self { waiter, target }
    }

    fn connect_pubsub(&self, pubsub: Arc<PubSub>, node: String) {
        let mut target = self.target.lock().expect("publish target poisoned");
        assert!(target.is_none(), "notification is already publishing");
        info!(
            type_name = self.waiter.type_name(),
            %node, "serving notification on pubsub node"
        );
        *target = Some(PublishTarget { pubsub, node });
    }

    fn disconnect_pubsub(&self) {
        let mut target = self.target.lock().expect("publish target poisoned");
        if target.take().is_some() {
            info!(
                type_name = self.waiter.type_name(),
                "stopped pubsub updates"
            );
        }
    }

    fn node(&self) -> Option<String> {
        self.target
            .lock()
            .expect("publish target poisoned")
            .as_ref()
            .map(|t| t.node.clone())
    }
}

struct ServerInner<C: Connector> {
    version: String,
    backend: Arc<dyn RpcHandler>,
    connection: Connection<C>,
    pubsub_service: StdMutex<Option<Jid>>,
    notifications: AsyncMutex<BTreeMap<String, ServerNotification>>,
    ready: AtomicBool,
    event_task: StdMutex<Option<JoinHandle<()>>>,
}

/// The server component.  Cheap to clone; all clones share one XMPP
/// connection and notification registry.
pub struct Server<C: Connector> {
    inner: Arc<ServerInner<C>>,
}

impl<C: Connector> Clone for Server<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> Server<C> {
    pub fn new(
        version: impl Into<String>,
        backend: Arc<dyn RpcHandler>,
        connector: C,
        config: ConnectionConfig,
    ) -> Self {
        let (connection, events) = Connection::new(connector, config);

        let inner = Arc::new(ServerInner {
            version: version.into(),
            backend,
            connection,
            pubsub_service: StdMutex::new(None),
            notifications: AsyncMutex::new(BTreeMap::new()),
            ready: AtomicBool::new(false),
            event_task: StdMutex::new(None),
        });

        let server = Self { inner };
        let task = tokio::spawn(run_events(Arc::clone(&server.inner), events));
        *server.inner.event_task.lock().expect("event task poisoned") = Some(task);
        server
    }

    /// Configures the pub/sub service used for notifications.  Must be
    /// called before any notification is added.
    pub fn add_pubsub(&self, service: Jid) {
        let mut slot = self
            .inner
            .pubsub_service
            .lock()
            .expect("pubsub service poisoned");
        assert!(slot.is_none(), "pubsub service is already configured");
        *slot = Some(service);
    }

    pub fn set_root_ca(&self, path: std::path::PathBuf) {
        self.inner.connection.set_root_ca(path);
    }

    /// Enables a notification.  The waiter loop starts immediately;
    /// publishing starts when (or if) the server is connected.
    pub async fn add_notification(&self, waiter: WaiterLoop) {
        assert!(
            self.inner
                .pubsub_service
                .lock()
                .expect("pubsub service poisoned")
                .is_some(),
            "notifications require a pubsub service"
        );

        let type_name = waiter.type_name().to_string();
        let notification = ServerNotification::new(waiter);

        if self.inner.connection.is_connected() {
            if let Some(pubsub) = self.inner.connection.pubsub() {
                match pubsub.create_node().await {
                    Some(node) => notification.connect_pubsub(pubsub, node),
                    None => {
                        // Ready means every registered notification is
                        // publishing; until the next reconnect rebuilds
                        // the nodes, this one is not.
                        warn!(%type_name, "could not create node for new notification");
                        self.inner.ready.store(false, Ordering::SeqCst);
                    }
                }
            }
        }

        let mut notifications = self.inner.notifications.lock().await;
        let previous = notifications.insert(type_name.clone(), notification);
        assert!(previous.is_none(), "duplicate notification: {type_name}");
    }

    /// Connects to XMPP and brings every notification into the publishing
    /// state.  The server answers pings only after this succeeds.
    pub async fn connect(&self, priority: i8) -> Result<(), ConnectionError> {
        self.inner.connection.connect(priority).await?;

        let service = self
            .inner
            .pubsub_service
            .lock()
            .expect("pubsub service poisoned")
            .clone();
        if let Some(service) = service {
            let pubsub = self
                .inner
                .connection
                .attach_pubsub(service, PUBSUB_TIMEOUT)?;

            let failed = {
                let notifications = self.inner.notifications.lock().await;
                let mut failed = None;
                for (type_name, notification) in notifications.iter() {
                    // A previous session's target may still linger if its
                    // disconnect event has not been processed yet.
                    notification.disconnect_pubsub();
                    match pubsub.create_node().await {
                        Some(node) => notification.connect_pubsub(Arc::clone(&pubsub), node),
                        None => {
                            failed = Some(type_name.clone());
                            break;
                        }
                    }
                }
                failed
            };

            if let Some(type_name) = failed {
                warn!(%type_name, "failed to create notification node");
                self.handle_disconnect().await;
                self.inner.connection.disconnect().await;
                return Err(ConnectionError::StreamError(format!(
                    "could not create pubsub node for {type_name}"
                )));
            }
        }

        self.inner.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Disconnects from XMPP.  Waiter loops keep running so a later
    /// connect resumes publishing with fresh nodes.
    pub async fn disconnect(&self) {
        self.handle_disconnect().await;
        self.inner.connection.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    /// The full JID this instance is bound to, while connected.
    pub fn jid(&self) -> Option<jid::FullJid> {
        self.inner.connection.jid()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// Final teardown: disconnect and stop all waiter loops.
    pub async fn shutdown(&self) {
        self.disconnect().await;

        let mut notifications = self.inner.notifications.lock().await;
        for (_, notification) in notifications.iter_mut() {
            notification.waiter.clear_update_handler();
            notification.waiter.stop().await;
        }
        notifications.clear();

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

    async fn handle_disconnect(&self) {
        self.inner.ready.store(false, Ordering::SeqCst);
        let notifications = self.inner.notifications.lock().await;
        for notification in notifications.values() {
            notification.disconnect_pubsub();
        }
    }

    /// The pub/sub node currently serving the given notification type.
    pub async fn notification_node(&self, type_name: &str) -> Option<String> {
        let notifications = self.inner.notifications.lock().await;
        notifications.get(type_name).and_then(|n| n.node())
    }
}

/* ************************************************************************ */

async fn run_events<C: Connector>(
    inner: Arc<ServerInner<C>>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Online => (),
            ConnectionEvent::Disconnected => {
                // Server-initiated disconnects have already run this; for
                // a connection dropped by the peer it is the only cleanup.
                // A stale event racing a completed reconnect must not tear
                // down the fresh session's state.
                if inner.connection.is_connected() {
                    continue;
                }
                inner.ready.store(false, Ordering::SeqCst);
                let notifications = inner.notifications.lock().await;
                for notification in notifications.values() {
                    notification.disconnect_pubsub();
                }
            }
            ConnectionEvent::Stanza(Stanza::Message(message)) => {
                handle_message(&inner, &message).await;
            }
            ConnectionEvent::Stanza(Stanza::Iq(iq)) => {
                handle_iq(&inner, *iq);
            }
            ConnectionEvent::Stanza(Stanza::Presence(_)) => (),
        }
    }
}

async fn handle_message<C: Connector>(inner: &Arc<ServerInner<C>>, message: &Message) {
    if find_payload(&message.payloads, "ping").is_none() {
        return;
    }
    let Some(from) = message.from.clone() else {
        return;
    };

    if !inner.ready.load(Ordering::SeqCst) {
        warn!(from = %from, "server is not ready yet, ignoring ping");
        return;
    }
    info!(from = %from, "processing ping");

    let mut payloads = vec![Pong::new(inner.version.clone()).to_element()];

    let notifications = inner.notifications.lock().await;
    if !notifications.is_empty() {
        let Some(pubsub) = inner.connection.pubsub() else {
            warn!("notifications configured but no pubsub attached");
            return;
        };

        let mut supported = SupportedNotifications::new(pubsub.service().to_string());
        for (type_name, notification) in notifications.iter() {
            // Readiness guarantees every entry has its node; if one is
            // missing anyway, the pong still goes out without it.
            let Some(node) = notification.node() else {
                warn!(%type_name, "notification without node despite readiness");
                continue;
            };
            supported.add_notification(type_name.clone(), node);
        }
        payloads.push(supported.to_element());
    }
    drop(notifications);

    let response = Presence {
        from: None,
        to: Some(from),
        id: None,
        type_: PresenceType::None,
        show: None,
        statuses: Default::default(),
        priority: 0i8,
        payloads,
    };
    if let Err(e) = inner.connection.send_stanza(response.into()) {
        warn!(error = %e, "failed to send pong presence");
    }
}

fn handle_iq<C: Connector>(inner: &Arc<ServerInner<C>>, iq: Iq) {
    let request = match &iq.payload {
        IqType::Get(elem) if elem.is("request", NS_CHARON) => RpcRequest::from_element(elem),
        IqType::Get(_) => return,
        IqType::Set(elem) | IqType::Result(Some(elem)) if elem.is("request", NS_CHARON) => {
            warn!("ignoring request IQ that is not of type get");
            return;
        }
        _ => return,
    };

    if !request.is_valid() {
        warn!("ignoring invalid request stanza");
        return;
    }
    let Some(from) = iq.from.clone() else {
        warn!("ignoring request IQ without sender");
        return;
    };
    let Ok(sender) = inner.connection.sender() else {
        return;
    };

    info!(from = %from, method = request.method(), "received IQ request");

    let backend = Arc::clone(&inner.backend);
    tokio::spawn(answer_request(backend, sender, from, iq.id, request));
}

/// Calls the backend and replies.  The reply is always an IQ of type
/// result, even for a JSON-RPC error; IQ errors are reserved for
/// transport problems, mirroring JSON-RPC over HTTP best practice.
async fn answer_request(
    backend: Arc<dyn RpcHandler>,
    sender: StanzaSender,
    from: Jid,
    id: String,
    request: RpcRequest,
) {
    let response = match backend
        .handle_method(request.method(), request.params())
        .await
    {
        Ok(result) => RpcResponse::success(result),
        Err(error) => RpcResponse::error(error.code, error.message, error.data),
    };

    let reply = make_iq(&from, "result", &id, response.to_element());
    if let Err(e) = sender.send(reply) {
        warn!(error = %e, "failed to send RPC reply");
    }
}

/* ************************************************************************ */

/// Keeps a server connected: periodically checks the connection and
/// reconnects with the configured priority.
pub struct ReconnectLoop<C: Connector> {
    server: Server<C>,
    interval: Duration,
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl<C: Connector> ReconnectLoop<C> {
    pub fn new(server: Server<C>, interval: Duration) -> Self {
        Self {
            server,
            interval,
            stop_tx: None,
            task: None,
        }
    }

    /// Starts the loop, which immediately attempts the first connect.
    pub fn start(&mut self, priority: i8) {
        assert!(self.task.is_none(), "reconnect loop is already running");

        let (stop_tx, mut stop_rx) = watch::channel(false);
        self.stop_tx = Some(stop_tx);

        let server = self.server.clone();
        let interval = self.interval;
        self.task = Some(tokio::spawn(async move {
            loop {
                if !server.is_connected() {
                    if let Err(e) = server.connect(priority).await {
                        warn!(error = %e, "reconnect attempt failed");
                    }
                }

                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => (),
                }
            }
        }));
    }

    /// Stops the loop and disconnects the server if it is connected.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        let _ = task.await;

        if self.server.is_connected() {
            self.server.disconnect().await;
        }
    }
}
