//! The pub/sub coordinator used for Charon notifications.
//!
//! A thin XEP-0060 layer over the connection: instant node creation,
//! publishing with service acknowledgement, subscribing with an item
//! callback, and best-effort cleanup when the session goes away.  The
//! coordinator is created per session by the connection and dropped with
//! it; blocking calls ride on the connection's pending-IQ registry, whose
//! teardown wakes them with a failure.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use jid::Jid;
use minidom::Element;
use tracing::{debug, info, warn};
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::message::Message;

use crate::connection::{make_iq, StanzaSender};

pub const NS_PUBSUB: &str = "http://jabber.org/protocol/pubsub";
pub const NS_PUBSUB_OWNER: &str = "http://jabber.org/protocol/pubsub#owner";
pub const NS_PUBSUB_EVENT: &str = "http://jabber.org/protocol/pubsub#event";

/// Callback invoked with the payload of each received item.
pub type ItemCallback = Box<dyn Fn(&Element) + Send + Sync>;

pub struct PubSub {
    sender: StanzaSender,
    service: Jid,
    /// Our bare JID, as used in subscription requests.
    subscriber: Jid,
    timeout: Duration,
    /// Nodes created by this instance; they are deleted on cleanup, and
    /// only they may be published to.  Disjoint from the subscriptions.
    owned: StdMutex<HashSet<String>>,
    subscriptions: StdMutex<HashMap<String, ItemCallback>>,
}

impl PubSub {
    pub(crate) fn new(
        sender: StanzaSender,
        service: Jid,
        our_jid: jid::FullJid,
        timeout: Duration,
    ) -> Self {
        Self {
            sender,
            service,
            subscriber: Jid::from(our_jid.to_bare()),
            timeout,
            owned: StdMutex::new(HashSet::new()),
            subscriptions: StdMutex::new(HashMap::new()),
        }
    }

    pub fn service(&self) -> &Jid {
        &self.service
    }

    /// Requests an instant-named node from the service and waits for the
    /// assigned name.  Returns None on failure.
    pub async fn create_node(&self) -> Option<String> {
        let payload = Element::builder("pubsub", NS_PUBSUB)
            .append(Element::builder("create", NS_PUBSUB).build())
            .build();

        let id = self.sender.next_id();
        let iq = make_iq(&self.service, "set", &id, payload);
        let reply = match self.sender.request(iq, &id, self.timeout).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "node creation got no reply");
                return None;
            }
        };

        let node = match reply.payload {
            IqType::Result(Some(payload)) => payload
                .get_child("create", NS_PUBSUB)
                .and_then(|c| c.attr("node"))
                .map(str::to_string),
            _ => None,
        };

        match node {
            Some(node) => {
                debug!(%node, "created pubsub node");
                self.owned.lock().expect("owned set poisoned").insert(node.clone());
                Some(node)
            }
            None => {
                warn!("failed to create pubsub node");
                None
            }
        }
    }

    /// Publishes an item to one of our own nodes and waits for the
    /// service acknowledgement.
    pub async fn publish(&self, node: &str, payload: Element) -> bool {
        assert!(
            self.owned.lock().expect("owned set poisoned").contains(node),
            "publishing to non-owned node {node}"
        );

        let item = Element::builder("item", NS_PUBSUB).append(payload).build();
        let publish = Element::builder("publish", NS_PUBSUB)
            .attr("node", node)
            .append(item)
            .build();
        let pubsub = Element::builder("pubsub", NS_PUBSUB).append(publish).build();

        let id = self.sender.next_id();
        let iq = make_iq(&self.service, "set", &id, pubsub);
        match self.sender.request(iq, &id, self.timeout).await {
            Ok(reply) => match reply.payload {
                IqType::Result(_) => true,
                IqType::Error(e) => {
                    warn!(node, error = ?e.defined_condition, "publish rejected");
                    false
                }
                _ => false,
            },
            Err(e) => {
                warn!(node, error = %e, "publish got no reply");
                false
            }
        }
    }

    /// Subscribes to a node and installs the item callback on success.
    pub async fn subscribe_to_node(&self, node: &str, callback: ItemCallback) -> bool {
        let subscribe = Element::builder("subscribe", NS_PUBSUB)
            .attr("node", node)
            .attr("jid", self.subscriber.to_string())
            .build();
        let pubsub = Element::builder("pubsub", NS_PUBSUB).append(subscribe).build();

        let id = self.sender.next_id();
        let iq = make_iq(&self.service, "set", &id, pubsub);
        let reply = match self.sender.request(iq, &id, self.timeout).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(node, error = %e, "subscription got no reply");
                return false;
            }
        };

        let subscribed = match reply.payload {
            IqType::Result(Some(payload)) => payload
                .get_child("subscription", NS_PUBSUB)
                .and_then(|s| s.attr("subscription"))
                .map(|s| s == "subscribed")
                .unwrap_or(false),
            _ => false,
        };

        if subscribed {
            debug!(node, "subscribed to pubsub node");
            self.subscriptions
                .lock()
                .expect("subscriptions poisoned")
                .insert(node.to_string(), callback);
        } else {
            warn!(node, "subscription was not granted");
        }
        subscribed
    }

    /// Demuxes an incoming pub/sub event message: each non-retracted item
    /// of a subscribed node is handed to the node's callback.
    pub(crate) fn handle_event(&self, message: &Message) {
        for payload in &message.payloads {
            if !payload.is("event", NS_PUBSUB_EVENT) {
                continue;
            }
            let Some(items) = payload.get_child("items", NS_PUBSUB_EVENT) else {
                continue;
            };
            let Some(node) = items.attr("node") else {
                continue;
            };

            let subscriptions = self.subscriptions.lock().expect("subscriptions poisoned");
            let Some(callback) = subscriptions.get(node) else {
                warn!(node, "ignoring item for non-subscribed node");
                continue;
            };

            for item in items.children() {
                if item.name() != "item" {
                    // Retractions and other markers carry no payload.
                    continue;
                }
                match item.children().next() {
                    Some(item_payload) => callback(item_payload),
                    None => debug!(node, "pubsub item without payload"),
                }
            }
        }
    }

    /// Issues best-effort unsubscribe and delete-node requests without
    /// waiting for replies.  Called while the session's outbound queue is
    /// still flushing, right before the stream closes.
    pub(crate) fn send_cleanup(&self) {
        let subscriptions: Vec<String> = self
            .subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .keys()
            .cloned()
            .collect();
        info!(count = subscriptions.len(), "unsubscribing from nodes");
        for node in subscriptions {
            let unsubscribe = Element::builder("unsubscribe", NS_PUBSUB)
                .attr("node", node.as_str())
                .attr("jid", self.subscriber.to_string())
                .build();
            let pubsub = Element::builder("pubsub", NS_PUBSUB).append(unsubscribe).build();
            let id = self.sender.next_id();
            let _ = self.sender.send(make_iq(&self.service, "set", &id, pubsub));
        }

        let owned: Vec<String> = self
            .owned
            .lock()
            .expect("owned set poisoned")
            .iter()
            .cloned()
            .collect();
        info!(count = owned.len(), "deleting owned nodes");
        for node in owned {
            let delete = Element::builder("delete", NS_PUBSUB_OWNER)
                .attr("node", node.as_str())
                .build();
            let pubsub = Element::builder("pubsub", NS_PUBSUB_OWNER).append(delete).build();
            let id = self.sender.next_id();
            let _ = self.sender.send(make_iq(&self.service, "set", &id, pubsub));
        }
    }

    #[cfg(test)]
    pub(crate) fn install_subscription(&self, node: &str, callback: ItemCallback) {
        self.subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .insert(node.to_string(), callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn event_message(node: &str, items: &[&str], retract: Option<&str>) -> Message {
        let mut xml = format!(
            "<message xmlns='jabber:client' from='pubsub.example.com'>\
             <event xmlns='{NS_PUBSUB_EVENT}'><items node='{node}'>"
        );
        for payload in items {
            xml.push_str(&format!("<item>{payload}</item>"));
        }
        if let Some(id) = retract {
            xml.push_str(&format!("<retract id='{id}'/>"));
        }
        xml.push_str("</items></event></message>");

        let element: Element = xml.parse().unwrap();
        Message::try_from(element).unwrap()
    }

    async fn test_pubsub() -> PubSub {
        let broker = crate::testutil::Broker::new();
        let (connection, _events) = crate::connection::Connection::new(
            broker.connector(),
            crate::transport::ConnectionConfig::new(
                Jid::from_str("tester@example.com").unwrap(),
                "password",
            ),
        );
        // The coordinator under test never touches the network; it only
        // needs a sender, which requires a live session.
        connection.connect(0).await.unwrap();
        PubSub::new(
            connection.sender().unwrap(),
            Jid::from_str("pubsub.example.com").unwrap(),
            connection.jid().unwrap(),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn event_demux_invokes_matching_callback() {
        let pubsub = test_pubsub().await;
        let hits = Arc::new(AtomicUsize::new(0));

        let counted = Arc::clone(&hits);
        pubsub.install_subscription(
            "node-a",
            Box::new(move |payload| {
                assert_eq!(payload.name(), "update");
                counted.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let message = event_message(
            "node-a",
            &["<update xmlns='https://xaya.io/charon/' type='state'><raw>\"x\"</raw></update>"],
            None,
        );
        pubsub.handle_event(&message);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Items for unknown nodes are ignored.
        let other = event_message(
            "node-b",
            &["<update xmlns='https://xaya.io/charon/' type='state'><raw>\"x\"</raw></update>"],
            None,
        );
        pubsub.handle_event(&other);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retractions_are_skipped() {
        let pubsub = test_pubsub().await;
        let hits = Arc::new(AtomicUsize::new(0));

        let counted = Arc::clone(&hits);
        pubsub.install_subscription(
            "node-a",
            Box::new(move |_| {
                counted.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let message = event_message("node-a", &[], Some("gone"));
        pubsub.handle_event(&message);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
