//! Typed wire objects for the Charon protocol.
//!
//! Every stanza payload can be built from semantic fields (in which case it
//! is valid by construction) or parsed from a wire element.  Parse failures
//! never abort processing; they yield an instance with the valid flag
//! cleared, which downstream handlers check before use.  Serialization is
//! only defined for valid instances.

use std::collections::BTreeMap;

use minidom::Element;
use serde_json::Value;
use tracing::warn;

use crate::xmldata;

/// XML namespace of all Charon stanza payloads.
pub const NS_CHARON: &str = "https://xaya.io/charon/";

/// A JSON-RPC method call as carried inside an IQ stanza:
///
/// ```xml
/// <request xmlns="https://xaya.io/charon/">
///   <method>mymethod</method>
///   <params>...payload...</params>
/// </request>
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    valid: bool,
    method: String,
    params: Value,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            valid: true,
            method: method.into(),
            params,
        }
    }

    fn invalid() -> Self {
        Self {
            valid: false,
            method: String::new(),
            params: Value::Null,
        }
    }

    pub fn from_element(elem: &Element) -> Self {
        let Some(method_child) = elem.get_child("method", NS_CHARON) else {
            warn!("request element has no method child");
            return Self::invalid();
        };
        let method = method_child.text();
        if method.is_empty() {
            warn!("request element has empty method");
            return Self::invalid();
        }

        let Some(params_child) = elem.get_child("params", NS_CHARON) else {
            warn!("request element has no params child");
            return Self::invalid();
        };
        let params = match xmldata::decode_json(params_child) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "failed decoding request params");
                return Self::invalid();
            }
        };
        if !matches!(params, Value::Object(_) | Value::Array(_) | Value::Null) {
            warn!("request params is neither object, array nor null");
            return Self::invalid();
        }

        Self {
            valid: true,
            method,
            params,
        }
    }

    pub fn to_element(&self) -> Element {
        assert!(self.valid, "trying to serialize an invalid RpcRequest");

        let method = Element::builder("method", NS_CHARON)
            .append(self.method.as_str())
            .build();

        Element::builder("request", NS_CHARON)
            .append(method)
            .append(xmldata::encode_json("params", NS_CHARON, &self.params))
            .build()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> &Value {
        &self.params
    }
}

/// The two terminal outcomes of a JSON-RPC call.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseKind {
    Success(Value),
    Error {
        code: i64,
        message: String,
        data: Value,
    },
}

/// A JSON-RPC call response (success or error) inside an IQ stanza:
///
/// ```xml
/// <response xmlns="https://xaya.io/charon/">
///   <result>...payload...</result>
/// </response>
///
/// <response xmlns="https://xaya.io/charon/">
///   <error code="42">
///     <message>error message</message>
///     <data>...payload...</data>
///   </error>
/// </response>
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    kind: Option<ResponseKind>,
}

impl RpcResponse {
    pub fn success(result: Value) -> Self {
        Self {
            kind: Some(ResponseKind::Success(result)),
        }
    }

    pub fn error(code: i64, message: impl Into<String>, data: Value) -> Self {
        Self {
            kind: Some(ResponseKind::Error {
                code,
                message: message.into(),
                data,
            }),
        }
    }

    fn invalid() -> Self {
        Self { kind: None }
    }

    pub fn from_element(elem: &Element) -> Self {
        let result_child = elem.get_child("result", NS_CHARON);
        let error_child = elem.get_child("error", NS_CHARON);

        match (result_child, error_child) {
            (Some(_), Some(_)) => {
                warn!("response element has both result and error children");
                Self::invalid()
            }
            (Some(result), None) => match xmldata::decode_json(result) {
                Ok(value) => Self::success(value),
                Err(e) => {
                    warn!(error = %e, "failed decoding response result");
                    Self::invalid()
                }
            },
            (None, Some(error)) => Self::parse_error(error),
            (None, None) => {
                warn!("response element has neither result nor error");
                Self::invalid()
            }
        }
    }

    fn parse_error(error: &Element) -> Self {
        let Some(code) = error.attr("code").and_then(|c| c.parse::<i64>().ok()) else {
            warn!("error element has no valid code attribute");
            return Self::invalid();
        };

        let message = error
            .get_child("message", NS_CHARON)
            .map(|c| c.text())
            .unwrap_or_default();

        let data = match error.get_child("data", NS_CHARON) {
            None => Value::Null,
            Some(data) => match xmldata::decode_json(data) {
                Ok(value) => value,
                Err(e) => {
                    warn!(error = %e, "failed decoding error data");
                    return Self::invalid();
                }
            },
        };

        Self::error(code, message, data)
    }

    pub fn to_element(&self) -> Element {
        let kind = self
            .kind
            .as_ref()
            .expect("trying to serialize an invalid RpcResponse");

        let mut elem = Element::builder("response", NS_CHARON).build();
        match kind {
            ResponseKind::Success(result) => {
                elem.append_child(xmldata::encode_json("result", NS_CHARON, result));
            }
            ResponseKind::Error {
                code,
                message,
                data,
            } => {
                let mut error = Element::builder("error", NS_CHARON)
                    .attr("code", code.to_string())
                    .build();
                if !message.is_empty() {
                    error.append_child(
                        Element::builder("message", NS_CHARON)
                            .append(message.as_str())
                            .build(),
                    );
                }
                if !data.is_null() {
                    error.append_child(xmldata::encode_json("data", NS_CHARON, data));
                }
                elem.append_child(error);
            }
        }
        elem
    }

    pub fn is_valid(&self) -> bool {
        self.kind.is_some()
    }

    pub fn is_success(&self) -> bool {
        matches!(self.kind, Some(ResponseKind::Success(_)))
    }

    /// Returns the outcome, or None for an invalid instance.
    pub fn kind(&self) -> Option<&ResponseKind> {
        self.kind.as_ref()
    }
}

/// The discovery ping, sent as a message to the server's bare JID:
/// `<ping xmlns="https://xaya.io/charon/"/>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ping;

impl Ping {
    pub fn from_element(_elem: &Element) -> Self {
        Self
    }

    pub fn to_element(&self) -> Element {
        Element::builder("ping", NS_CHARON).build()
    }
}

/// The discovery pong, carried in a directed presence:
/// `<pong xmlns="https://xaya.io/charon/" version="..."/>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pong {
    version: Option<String>,
}

impl Pong {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: Some(version.into()),
        }
    }

    pub fn from_element(elem: &Element) -> Self {
        Self {
            version: elem.attr("version").map(str::to_string),
        }
    }

    pub fn to_element(&self) -> Element {
        let mut builder = Element::builder("pong", NS_CHARON);
        if let Some(version) = &self.version {
            builder = builder.attr("version", version.as_str());
        }
        builder.build()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }
}

/// The notification capabilities a server announces with its pong:
///
/// ```xml
/// <notifications xmlns="https://xaya.io/charon/" service="pubsub.example.com">
///   <notification type="state">node-name</notification>
/// </notifications>
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedNotifications {
    valid: bool,
    service: String,
    notifications: BTreeMap<String, String>,
}

impl SupportedNotifications {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            valid: true,
            service: service.into(),
            notifications: BTreeMap::new(),
        }
    }

    fn invalid() -> Self {
        Self {
            valid: false,
            service: String::new(),
            notifications: BTreeMap::new(),
        }
    }

    /// Adds a notification type served on the given node.  Each type may
    /// only be declared once.
    pub fn add_notification(&mut self, type_: impl Into<String>, node: impl Into<String>) {
        let previous = self.notifications.insert(type_.into(), node.into());
        assert!(previous.is_none(), "duplicate notification type");
    }

    pub fn from_element(elem: &Element) -> Self {
        let service = elem.attr("service").unwrap_or_default().to_string();
        if service.is_empty() {
            warn!("notifications element has no service attribute");
            return Self::invalid();
        }

        let mut notifications = BTreeMap::new();
        for child in elem.children() {
            if child.name() != "notification" {
                warn!(child = child.name(), "unexpected notifications child");
                return Self::invalid();
            }

            let type_ = child.attr("type").unwrap_or_default().to_string();
            let node = child.text();
            if type_.is_empty() || node.is_empty() {
                warn!("notification entry with empty type or node");
                return Self::invalid();
            }
            if notifications.insert(type_, node).is_some() {
                warn!("duplicate notification type in notifications element");
                return Self::invalid();
            }
        }

        Self {
            valid: true,
            service,
            notifications,
        }
    }

    pub fn to_element(&self) -> Element {
        assert!(
            self.valid,
            "trying to serialize invalid SupportedNotifications"
        );

        let mut elem = Element::builder("notifications", NS_CHARON)
            .attr("service", self.service.as_str())
            .build();
        for (type_, node) in &self.notifications {
            elem.append_child(
                Element::builder("notification", NS_CHARON)
                    .attr("type", type_.as_str())
                    .append(node.as_str())
                    .build(),
            );
        }
        elem
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn notifications(&self) -> &BTreeMap<String, String> {
        &self.notifications
    }
}

/// A published state update for one notification type:
/// `<update xmlns="https://xaya.io/charon/" type="state">...payload...</update>`.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationUpdate {
    valid: bool,
    type_: String,
    state: Value,
}

impl NotificationUpdate {
    pub fn new(type_: impl Into<String>, state: Value) -> Self {
        Self {
            valid: true,
            type_: type_.into(),
            state,
        }
    }

    fn invalid() -> Self {
        Self {
            valid: false,
            type_: String::new(),
            state: Value::Null,
        }
    }

    pub fn from_element(elem: &Element) -> Self {
        let type_ = elem.attr("type").unwrap_or_default().to_string();
        if type_.is_empty() {
            warn!("update element has no type attribute");
            return Self::invalid();
        }

        match xmldata::decode_json(elem) {
            Ok(state) => Self {
                valid: true,
                type_,
                state,
            },
            Err(e) => {
                warn!(error = %e, "failed decoding update state");
                Self::invalid()
            }
        }
    }

    pub fn to_element(&self) -> Element {
        assert!(self.valid, "trying to serialize invalid NotificationUpdate");

        let mut elem = xmldata::encode_json("update", NS_CHARON, &self.state);
        elem.set_attr("type", self.type_.as_str());
        elem
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn type_name(&self) -> &str {
        &self.type_
    }

    pub fn state(&self) -> &Value {
        &self.state
    }
}

/// The tagged sum of all Charon payloads, dispatched on (local name,
/// namespace) of an incoming element.
#[derive(Debug, Clone)]
pub enum CharonPayload {
    Request(RpcRequest),
    Response(RpcResponse),
    Ping(Ping),
    Pong(Pong),
    Notifications(SupportedNotifications),
    Update(NotificationUpdate),
}

/// Parses a wire element into the matching Charon payload, or None if the
/// element is not from the Charon namespace.
pub fn parse_payload(elem: &Element) -> Option<CharonPayload> {
    if elem.ns() != NS_CHARON {
        return None;
    }

    match elem.name() {
        "request" => Some(CharonPayload::Request(RpcRequest::from_element(elem))),
        "response" => Some(CharonPayload::Response(RpcResponse::from_element(elem))),
        "ping" => Some(CharonPayload::Ping(Ping::from_element(elem))),
        "pong" => Some(CharonPayload::Pong(Pong::from_element(elem))),
        "notifications" => Some(CharonPayload::Notifications(
            SupportedNotifications::from_element(elem),
        )),
        "update" => Some(CharonPayload::Update(NotificationUpdate::from_element(
            elem,
        ))),
        _ => None,
    }
}

/// Looks up a Charon child element of the given name among stanza
/// payloads.
pub fn find_payload<'a, I>(payloads: I, name: &str) -> Option<&'a Element>
where
    I: IntoIterator<Item = &'a Element>,
{
    payloads.into_iter().find(|p| p.is(name, NS_CHARON))
}
