//! The XMPP connection owned by a Charon client or server.
//!
//! One driver task owns the transport for the lifetime of a session.  All
//! outbound stanzas flow through its queue, which serializes emission, and
//! all inbound stanzas are routed by it: IQ results and errors to the
//! pending-request registry, pub/sub event messages to the attached
//! coordinator, everything else to the component's event stream.
//! Dropping the pending registry on session teardown is what wakes every
//! caller still blocked on a reply.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use jid::{FullJid, Jid};
use minidom::Element;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use xmpp_parsers::iq::Iq;
use xmpp_parsers::message::Message;
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use crate::error::ConnectionError;
use crate::pubsub::{PubSub, NS_PUBSUB_EVENT};
use crate::stream::ns;
use crate::transport::{ConnectionConfig, Connector, StanzaTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// A typed top-level stanza as routed to components.
#[derive(Debug, Clone)]
pub enum Stanza {
    Message(Box<Message>),
    Presence(Box<Presence>),
    Iq(Box<Iq>),
}

/// Events delivered to the owning component.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A session has been established.
    Online,
    /// An inbound stanza not claimed by the correlation map or pub/sub.
    Stanza(Stanza),
    /// The session ended, whether by request or because the server dropped
    /// us.  Components clear their per-session state on this.
    Disconnected,
}

enum DriverCommand {
    Send(Element),
    Shutdown,
}

type PendingMap = Arc<StdMutex<HashMap<String, mpsc::UnboundedSender<Iq>>>>;
type PubSubSlot = Arc<StdMutex<Option<Arc<PubSub>>>>;

/// Receives the replies correlated with one IQ id.  More than one stanza
/// can arrive for an id (e.g. an unusable reply followed by nothing); the
/// caller keeps receiving until satisfied or timed out.  Dropping the
/// waiter removes the registration.
pub struct IqWaiter {
    id: String,
    rx: mpsc::UnboundedReceiver<Iq>,
    pending: PendingMap,
}

impl IqWaiter {
    /// The next reply for this id; None once the session is torn down.
    pub async fn recv(&mut self) -> Option<Iq> {
        self.rx.recv().await
    }
}

impl Drop for IqWaiter {
    fn drop(&mut self) {
        self.pending
            .lock()
            .expect("pending registry poisoned")
            .remove(&self.id);
    }
}

/// Cloneable handle for sending stanzas and making correlated IQ requests
/// on the current session.  Held by the pub/sub coordinator and by
/// in-flight client calls; outlives neither the session's driver nor its
/// pending registry in any way that matters, because a dead session just
/// makes every operation fail with `Closed`.
#[derive(Clone)]
pub struct StanzaSender {
    outbound: mpsc::UnboundedSender<DriverCommand>,
    pending: PendingMap,
    counter: Arc<AtomicU64>,
    prefix: u32,
}

impl StanzaSender {
    /// Enqueues a stanza for emission.
    pub fn send(&self, element: Element) -> Result<(), ConnectionError> {
        self.outbound
            .send(DriverCommand::Send(element))
            .map_err(|_| ConnectionError::Closed)
    }

    /// Allocates a fresh stanza id.  The random prefix keeps ids from
    /// clashing across connections and restarts.
    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("charon-{:x}-{n}", self.prefix)
    }

    /// Registers interest in replies carrying the given IQ id.
    pub fn register(&self, id: &str) -> IqWaiter {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending
            .lock()
            .expect("pending registry poisoned")
            .insert(id.to_string(), tx);
        IqWaiter {
            id: id.to_string(),
            rx,
            pending: Arc::clone(&self.pending),
        }
    }

    /// Sends an IQ with the given id and waits for the first correlated
    /// reply.  The returned IQ may be a result or an error; a timeout or
    /// session teardown surfaces as `Err`.
    pub async fn request(
        &self,
        element: Element,
        id: &str,
        limit: Duration,
    ) -> Result<Iq, ConnectionError> {
        let mut waiter = self.register(id);
        self.send(element)?;

        match tokio::time::timeout(limit, waiter.recv()).await {
            Ok(Some(iq)) => Ok(iq),
            Ok(None) => Err(ConnectionError::Closed),
            Err(_) => Err(ConnectionError::Timeout),
        }
    }
}

/// Builds a complete IQ element around a payload.
pub fn make_iq(to: &Jid, type_: &str, id: &str, payload: Element) -> Element {
    Element::builder("iq", ns::JABBER_CLIENT)
        .attr("to", to.to_string())
        .attr("type", type_)
        .attr("id", id)
        .append(payload)
        .build()
}

/// The connection abstraction: session lifecycle, send serialization and
/// inbound routing.
pub struct Connection<C: Connector> {
    connector: C,
    config: StdMutex<ConnectionConfig>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    jid: StdMutex<Option<FullJid>>,
    outbound: StdMutex<Option<mpsc::UnboundedSender<DriverCommand>>>,
    pending: PendingMap,
    pubsub: PubSubSlot,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    driver: AsyncMutex<Option<JoinHandle<()>>>,
    counter: Arc<AtomicU64>,
    id_prefix: u32,
}

impl<C: Connector> Connection<C> {
    /// Creates the (still disconnected) connection and the event stream
    /// its owning component consumes.
    pub fn new(
        connector: C,
        config: ConnectionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        let connection = Self {
            connector,
            config: StdMutex::new(config),
            state_tx: Arc::new(state_tx),
            jid: StdMutex::new(None),
            outbound: StdMutex::new(None),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            pubsub: Arc::new(StdMutex::new(None)),
            events_tx,
            driver: AsyncMutex::new(None),
            counter: Arc::new(AtomicU64::new(0)),
            id_prefix: rand::random(),
        };
        (connection, events_rx)
    }

    /// Sets the root CA used for TLS verification on all future connects.
    pub fn set_root_ca(&self, path: PathBuf) {
        self.config.lock().expect("config poisoned").root_ca = Some(path);
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.state_tx.borrow() == ConnectionState::Connected
    }

    /// The full JID we are bound to, while connected.
    pub fn jid(&self) -> Option<FullJid> {
        self.jid.lock().expect("jid poisoned").clone()
    }

    /// Logs in and starts the driver task.  Sends the initial presence
    /// with the given priority.  On failure the connection is left
    /// disconnected.
    pub async fn connect(&self, priority: i8) -> Result<(), ConnectionError> {
        let mut driver = self.driver.lock().await;

        if self.is_connected() {
            return Ok(());
        }
        // A server-side drop leaves the old driver task behind; reap it
        // before starting over.
        if let Some(stale) = driver.take() {
            let _ = stale.await;
        }

        let config = self.config.lock().expect("config poisoned").clone();
        info!(jid = %config.jid, priority, "connecting to XMPP");
        self.state_tx.send_replace(ConnectionState::Connecting);

        let session = match self.connector.connect(&config).await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "XMPP connect failed");
                self.state_tx.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        *self.jid.lock().expect("jid poisoned") = Some(session.jid.clone());

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        *self.outbound.lock().expect("outbound poisoned") = Some(outbound_tx.clone());

        // The state flips to Connected before the driver exists, so a
        // session dying instantly still leaves the expected
        // Connected -> Disconnected transition behind.
        self.state_tx.send_replace(ConnectionState::Connected);
        let _ = self.events_tx.send(ConnectionEvent::Online);

        let presence = Presence {
            from: None,
            to: None,
            id: None,
            type_: PresenceType::None,
            show: None,
            statuses: Default::default(),
            priority,
            payloads: vec![],
        };
        let _ = outbound_tx.send(DriverCommand::Send(presence.into()));

        let handle = tokio::spawn(drive(
            session.transport,
            outbound_rx,
            Arc::clone(&self.pending),
            Arc::clone(&self.pubsub),
            self.events_tx.clone(),
            Arc::clone(&self.state_tx),
        ));
        *driver = Some(handle);

        Ok(())
    }

    /// Closes the session.  The pub/sub coordinator is torn down first so
    /// its best-effort cleanup stanzas still go out; the driver then
    /// flushes the queue, closes the socket and wakes all pending
    /// requests.
    pub async fn disconnect(&self) {
        let detached = self.pubsub.lock().expect("pubsub slot poisoned").take();
        if let Some(pubsub) = detached {
            pubsub.send_cleanup();
        }

        if let Some(tx) = self.outbound.lock().expect("outbound poisoned").take() {
            let _ = tx.send(DriverCommand::Shutdown);
        }

        if let Some(handle) = self.driver.lock().await.take() {
            let _ = handle.await;
        }

        *self.jid.lock().expect("jid poisoned") = None;
    }

    /// A send/request handle for the current session.
    pub fn sender(&self) -> Result<StanzaSender, ConnectionError> {
        let outbound = self
            .outbound
            .lock()
            .expect("outbound poisoned")
            .clone()
            .ok_or(ConnectionError::Closed)?;
        Ok(StanzaSender {
            outbound,
            pending: Arc::clone(&self.pending),
            counter: Arc::clone(&self.counter),
            prefix: self.id_prefix,
        })
    }

    /// Enqueues a stanza on the current session.
    pub fn send_stanza(&self, element: Element) -> Result<(), ConnectionError> {
        self.sender()?.send(element)
    }

    /// Attaches a pub/sub coordinator for the given service on the
    /// current session.  Replaces any previous coordinator.
    pub fn attach_pubsub(
        &self,
        service: Jid,
        timeout: Duration,
    ) -> Result<Arc<PubSub>, ConnectionError> {
        let sender = self.sender()?;
        let jid = self.jid().ok_or(ConnectionError::Closed)?;
        let pubsub = Arc::new(PubSub::new(sender, service, jid, timeout));
        *self.pubsub.lock().expect("pubsub slot poisoned") = Some(Arc::clone(&pubsub));
        Ok(pubsub)
    }

    /// The currently attached pub/sub coordinator, if any.
    pub fn pubsub(&self) -> Option<Arc<PubSub>> {
        self.pubsub.lock().expect("pubsub slot poisoned").clone()
    }
}

/* ************************************************************************ */

async fn drive<T: StanzaTransport>(
    mut transport: T,
    mut outbound: mpsc::UnboundedReceiver<DriverCommand>,
    pending: PendingMap,
    pubsub: PubSubSlot,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
) {
    enum Next {
        Cmd(Option<DriverCommand>),
        Inbound(Result<Option<Element>, ConnectionError>),
    }

    loop {
        let next = tokio::select! {
            cmd = outbound.recv() => Next::Cmd(cmd),
            res = transport.recv() => Next::Inbound(res),
        };

        match next {
            Next::Cmd(Some(DriverCommand::Send(element))) => {
                if let Err(e) = transport.send(element).await {
                    warn!(error = %e, "failed sending stanza");
                    break;
                }
            }
            Next::Cmd(Some(DriverCommand::Shutdown)) | Next::Cmd(None) => {
                // Flush whatever is still queued (e.g. pub/sub cleanup)
                // before closing the stream.
                while let Ok(cmd) = outbound.try_recv() {
                    if let DriverCommand::Send(element) = cmd {
                        let _ = transport.send(element).await;
                    }
                }
                let _ = transport.close().await;
                break;
            }
            Next::Inbound(Ok(Some(element))) => dispatch(element, &pending, &pubsub, &events_tx),
            Next::Inbound(Ok(None)) => {
                info!("stream closed by the server");
                break;
            }
            Next::Inbound(Err(e)) => {
                warn!(error = %e, "receive error, terminating session");
                break;
            }
        }
    }

    state_tx.send_replace(ConnectionState::Disconnected);
    // Waking everyone still blocked on a reply: dropping the senders
    // resolves their receivers with an error.
    pending.lock().expect("pending registry poisoned").clear();
    pubsub.lock().expect("pubsub slot poisoned").take();
    let _ = events_tx.send(ConnectionEvent::Disconnected);
}

fn dispatch(
    element: Element,
    pending: &PendingMap,
    pubsub: &PubSubSlot,
    events_tx: &mpsc::UnboundedSender<ConnectionEvent>,
) {
    match element.name() {
        "iq" => {
            let iq = match Iq::try_from(element) {
                Ok(iq) => iq,
                Err(e) => {
                    warn!(error = %e, "dropping malformed iq stanza");
                    return;
                }
            };

            let is_reply = matches!(
                iq.payload,
                xmpp_parsers::iq::IqType::Result(_) | xmpp_parsers::iq::IqType::Error(_)
            );
            if is_reply {
                let waiter = pending
                    .lock()
                    .expect("pending registry poisoned")
                    .get(&iq.id)
                    .cloned();
                if let Some(waiter) = waiter {
                    if waiter.send(iq).is_err() {
                        debug!("reply for an abandoned request");
                    }
                    return;
                }
            }

            let _ = events_tx.send(ConnectionEvent::Stanza(Stanza::Iq(Box::new(iq))));
        }
        "message" => {
            let message = match Message::try_from(element) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "dropping malformed message stanza");
                    return;
                }
            };

            let is_pubsub_event = message
                .payloads
                .iter()
                .any(|p| p.is("event", NS_PUBSUB_EVENT));
            if is_pubsub_event {
                let attached = pubsub.lock().expect("pubsub slot poisoned").clone();
                if let Some(coordinator) = attached {
                    coordinator.handle_event(&message);
                } else {
                    debug!("pubsub event without attached coordinator");
                }
                return;
            }

            let _ = events_tx.send(ConnectionEvent::Stanza(Stanza::Message(Box::new(message))));
        }
        "presence" => match Presence::try_from(element) {
            Ok(presence) => {
                let _ =
                    events_tx.send(ConnectionEvent::Stanza(Stanza::Presence(Box::new(presence))));
            }
            Err(e) => warn!(error = %e, "dropping malformed presence stanza"),
        },
        other => debug!(name = other, "ignoring unknown top-level element"),
    }
}
