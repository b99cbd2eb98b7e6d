//! The stanza transport abstraction and its TCP implementation.
//!
//! `StanzaTransport` is the seam between the connection logic and the
//! network: it delivers and accepts complete stanza elements.  The TCP
//! implementation speaks the client-to-server stream directly: stream
//! header, mandatory STARTTLS, SASL authentication and resource binding.
//! Tests substitute an in-process transport through the same trait.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use jid::{FullJid, Jid};
use minidom::Element;
use sasl::client::mechanisms::{Plain, Scram};
use sasl::client::Mechanism;
use sasl::common::scram::{Sha1, Sha256};
use sasl::common::{ChannelBinding, Credentials};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::error::ConnectionError;
use crate::stream::{self, ns, Frame, XmlFramer};

const DEFAULT_XMPP_PORT: u16 = 5222;
const RECV_BUFFER_SIZE: usize = 16 * 1024;

/// Everything needed to establish and authenticate one XMPP session.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Our own JID; the resource, if present, is requested at bind time.
    pub jid: Jid,
    pub password: String,
    /// Overrides the host derived from the JID's domain.
    pub server_host: Option<String>,
    pub port: Option<u16>,
    /// Explicit trust root; the platform store is used when unset.
    pub root_ca: Option<PathBuf>,
    /// Timeout applied to each step of connection establishment.
    pub timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(jid: Jid, password: impl Into<String>) -> Self {
        Self {
            jid,
            password: password.into(),
            server_host: None,
            port: None,
            root_ca: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// An established, authenticated session: the transport plus the JID the
/// server bound us to.
pub struct Session<T> {
    pub transport: T,
    pub jid: FullJid,
}

/// Bidirectional stanza stream.  `recv` returning `Ok(None)` means the
/// peer closed the stream.
pub trait StanzaTransport: Send + 'static {
    fn send(&mut self, element: Element)
        -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn recv(&mut self) -> impl Future<Output = Result<Option<Element>, ConnectionError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}

/// Factory for sessions; the seam at which tests plug in the in-process
/// broker.
pub trait Connector: Send + Sync + 'static {
    type Transport: StanzaTransport;

    fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> impl Future<Output = Result<Session<Self::Transport>, ConnectionError>> + Send;
}

/* ************************************************************************ */

/// Production connector: TCP, STARTTLS with verified certificates, SASL.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector;

pub struct TcpTransport {
    stream: tokio_rustls::client::TlsStream<TcpStream>,
    framer: XmlFramer,
    io_timeout: Duration,
}

impl Connector for TcpConnector {
    type Transport = TcpTransport;

    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Session<TcpTransport>, ConnectionError> {
        let domain = config.jid.domain().to_string();
        let host = config.server_host.clone().unwrap_or_else(|| domain.clone());
        let port = config.port.unwrap_or(DEFAULT_XMPP_PORT);

        debug!(%host, port, "connecting TCP");
        let tcp = timeout(config.timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| ConnectionError::Timeout)?
            .map_err(|e| ConnectionError::DnsResolutionFailed(e.to_string()))?;

        let mut framer = XmlFramer::new();

        // Pre-TLS stream: negotiate up to the STARTTLS proceed.
        let mut tcp = tcp;
        negotiate_starttls(&mut tcp, &mut framer, &domain, config.timeout).await?;

        // TLS handshake with the configured trust.  Verification is never
        // skipped; a bad certificate fails the connect.
        let connector = build_tls_connector(config)?;
        let server_name = ServerName::try_from(domain.clone())
            .map_err(|e| ConnectionError::TlsHandshakeFailed(format!("invalid server name: {e}")))?;
        let mut stream = timeout(config.timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| ConnectionError::Timeout)?
            .map_err(|e| ConnectionError::TlsHandshakeFailed(e.to_string()))?;
        info!(%host, "TLS established");

        framer.reset();

        // Post-TLS stream: authenticate and bind.
        let features = restart_stream(&mut stream, &mut framer, &domain, config.timeout).await?;
        authenticate(&mut stream, &mut framer, &features, config, config.timeout).await?;

        framer.reset();
        let features = restart_stream(&mut stream, &mut framer, &domain, config.timeout).await?;
        let jid = bind_resource(&mut stream, &mut framer, &features, config, config.timeout).await?;
        info!(jid = %jid, "XMPP session established");

        Ok(Session {
            transport: TcpTransport {
                stream,
                framer,
                io_timeout: config.timeout,
            },
            jid,
        })
    }
}

impl StanzaTransport for TcpTransport {
    async fn send(&mut self, element: Element) -> Result<(), ConnectionError> {
        let bytes = stream::element_to_bytes(&element)?;
        timeout(self.io_timeout, self.stream.write_all(&bytes))
            .await
            .map_err(|_| ConnectionError::Timeout)?
            .map_err(|e| ConnectionError::TransportError(e.to_string()))?;
        timeout(self.io_timeout, self.stream.flush())
            .await
            .map_err(|_| ConnectionError::Timeout)?
            .map_err(|e| ConnectionError::TransportError(e.to_string()))?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Element>, ConnectionError> {
        loop {
            match self.framer.next_frame()? {
                Some(Frame::Element(element)) => return Ok(Some(element)),
                Some(Frame::StreamClose) => return Ok(None),
                None => (),
            }

            let mut chunk = vec![0_u8; RECV_BUFFER_SIZE];
            let n = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(|e| ConnectionError::TransportError(e.to_string()))?;
            if n == 0 {
                return Ok(None);
            }
            self.framer.feed(&chunk[..n]);
        }
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        let _ = timeout(
            self.io_timeout,
            self.stream.write_all(b"</stream:stream>"),
        )
        .await;
        timeout(self.io_timeout, self.stream.shutdown())
            .await
            .map_err(|_| ConnectionError::Timeout)?
            .map_err(|e| ConnectionError::TransportError(e.to_string()))?;
        Ok(())
    }
}

/* ************************************************************************ */

fn build_tls_connector(config: &ConnectionConfig) -> Result<TlsConnector, ConnectionError> {
    let mut roots = RootCertStore::empty();

    match &config.root_ca {
        Some(path) => {
            let pem = std::fs::read(path).map_err(|e| {
                ConnectionError::TlsHandshakeFailed(format!(
                    "failed to read CA file {}: {e}",
                    path.display()
                ))
            })?;
            for cert in rustls_pemfile::certs(&mut &pem[..]) {
                let cert = cert.map_err(|e| {
                    ConnectionError::TlsHandshakeFailed(format!("invalid CA certificate: {e}"))
                })?;
                roots.add(cert).map_err(|e| {
                    ConnectionError::TlsHandshakeFailed(format!("rejected CA certificate: {e}"))
                })?;
            }
            if roots.is_empty() {
                return Err(ConnectionError::TlsHandshakeFailed(format!(
                    "no certificates found in {}",
                    path.display()
                )));
            }
        }
        None => {
            let loaded = rustls_native_certs::load_native_certs();
            for error in &loaded.errors {
                warn!(%error, "skipping unreadable platform trust anchor");
            }
            for cert in loaded.certs {
                let _ = roots.add(cert);
            }
        }
    }

    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(tls_config)))
}

async fn write_raw<S>(stream: &mut S, data: &[u8], limit: Duration) -> Result<(), ConnectionError>
where
    S: AsyncWrite + Unpin,
{
    timeout(limit, stream.write_all(data))
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(|e| ConnectionError::TransportError(e.to_string()))?;
    timeout(limit, stream.flush())
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(|e| ConnectionError::TransportError(e.to_string()))?;
    Ok(())
}

async fn fill<S>(
    stream: &mut S,
    framer: &mut XmlFramer,
    limit: Duration,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = vec![0_u8; RECV_BUFFER_SIZE];
    let n = timeout(limit, stream.read(&mut chunk))
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(|e| ConnectionError::TransportError(e.to_string()))?;
    if n == 0 {
        return Err(ConnectionError::Closed);
    }
    framer.feed(&chunk[..n]);
    Ok(())
}

async fn read_element<S>(
    stream: &mut S,
    framer: &mut XmlFramer,
    limit: Duration,
) -> Result<Element, ConnectionError>
where
    S: AsyncRead + Unpin,
{
    loop {
        match framer.next_frame()? {
            Some(Frame::Element(element)) => return Ok(element),
            Some(Frame::StreamClose) => return Err(ConnectionError::Closed),
            None => fill(stream, framer, limit).await?,
        }
    }
}

async fn read_stream_header<S>(
    stream: &mut S,
    framer: &mut XmlFramer,
    limit: Duration,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + Unpin,
{
    while !framer.take_stream_header()? {
        fill(stream, framer, limit).await?;
    }
    Ok(())
}

/// Sends a fresh stream header and reads the reply header plus the
/// announced features.
async fn restart_stream<S>(
    stream: &mut S,
    framer: &mut XmlFramer,
    domain: &str,
    limit: Duration,
) -> Result<Element, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_raw(stream, stream::stream_header(domain).as_bytes(), limit).await?;
    read_stream_header(stream, framer, limit).await?;

    let features = read_element(stream, framer, limit).await?;
    if !features.is("features", ns::STREAM) {
        return Err(ConnectionError::StreamError(format!(
            "expected stream features, got <{}/>",
            features.name()
        )));
    }
    Ok(features)
}

/// Pre-TLS negotiation: the server must offer STARTTLS and accept it.
async fn negotiate_starttls(
    stream: &mut TcpStream,
    framer: &mut XmlFramer,
    domain: &str,
    limit: Duration,
) -> Result<(), ConnectionError> {
    let features = restart_stream(stream, framer, domain, limit).await?;

    if features.get_child("starttls", ns::TLS).is_none() {
        return Err(ConnectionError::TlsHandshakeFailed(
            "server does not offer STARTTLS".to_string(),
        ));
    }

    let starttls = Element::builder("starttls", ns::TLS).build();
    write_raw(stream, &stream::element_to_bytes(&starttls)?, limit).await?;

    let reply = read_element(stream, framer, limit).await?;
    if reply.is("proceed", ns::TLS) {
        Ok(())
    } else {
        Err(ConnectionError::TlsHandshakeFailed(format!(
            "server rejected STARTTLS with <{}/>",
            reply.name()
        )))
    }
}

fn select_mechanism(
    offered: &HashSet<String>,
    credentials: Credentials,
) -> Result<Box<dyn Mechanism + Send>, ConnectionError> {
    if offered.contains("SCRAM-SHA-256") {
        return Scram::<Sha256>::from_credentials(credentials)
            .map(|m| Box::new(m) as Box<dyn Mechanism + Send>)
            .map_err(|e| {
                ConnectionError::AuthenticationFailed(format!(
                    "failed to initialize SCRAM-SHA-256: {e:?}"
                ))
            });
    }
    if offered.contains("SCRAM-SHA-1") {
        return Scram::<Sha1>::from_credentials(credentials)
            .map(|m| Box::new(m) as Box<dyn Mechanism + Send>)
            .map_err(|e| {
                ConnectionError::AuthenticationFailed(format!(
                    "failed to initialize SCRAM-SHA-1: {e:?}"
                ))
            });
    }
    if offered.contains("PLAIN") {
        return Plain::from_credentials(credentials)
            .map(|m| Box::new(m) as Box<dyn Mechanism + Send>)
            .map_err(|e| {
                ConnectionError::AuthenticationFailed(format!("failed to initialize PLAIN: {e}"))
            });
    }

    Err(ConnectionError::AuthenticationFailed(format!(
        "no supported SASL mechanism; server offers: {}",
        offered.iter().cloned().collect::<Vec<_>>().join(", ")
    )))
}

async fn authenticate<S>(
    stream: &mut S,
    framer: &mut XmlFramer,
    features: &Element,
    config: &ConnectionConfig,
    limit: Duration,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let offered: HashSet<String> = features
        .get_child("mechanisms", ns::SASL)
        .map(|m| {
            m.children()
                .filter(|c| c.name() == "mechanism")
                .map(|c| c.text())
                .collect()
        })
        .unwrap_or_default();
    debug!(?offered, "server advertised SASL mechanisms");

    let username = config.jid.node().map(|n| n.to_string()).ok_or_else(|| {
        ConnectionError::AuthenticationFailed(format!(
            "JID '{}' has no local part for SASL authentication",
            config.jid
        ))
    })?;

    let credentials = Credentials::default()
        .with_username(username)
        .with_password(config.password.clone())
        .with_channel_binding(ChannelBinding::Unsupported);
    let mut mechanism = select_mechanism(&offered, credentials)?;
    debug!(mechanism = mechanism.name(), "selected SASL mechanism");

    let initial = mechanism.initial();
    let encoded = if initial.is_empty() {
        "=".to_string()
    } else {
        BASE64_STANDARD.encode(&initial)
    };
    let auth = Element::builder("auth", ns::SASL)
        .attr("mechanism", mechanism.name())
        .append(encoded)
        .build();
    write_raw(stream, &stream::element_to_bytes(&auth)?, limit).await?;

    loop {
        let reply = read_element(stream, framer, limit).await?;
        if reply.is("challenge", ns::SASL) {
            let challenge = BASE64_STANDARD
                .decode(reply.text().trim().as_bytes())
                .map_err(|e| {
                    ConnectionError::AuthenticationFailed(format!("invalid SASL challenge: {e}"))
                })?;
            let response = mechanism.response(&challenge).map_err(|e| {
                ConnectionError::AuthenticationFailed(format!(
                    "SASL challenge-response failed: {e:?}"
                ))
            })?;
            let elem = Element::builder("response", ns::SASL)
                .append(BASE64_STANDARD.encode(&response))
                .build();
            write_raw(stream, &stream::element_to_bytes(&elem)?, limit).await?;
        } else if reply.is("success", ns::SASL) {
            let text = reply.text();
            let trimmed = text.trim();
            // A lone "=" is the empty-data placeholder.
            let data = if trimmed == "=" {
                Vec::new()
            } else {
                BASE64_STANDARD.decode(trimmed.as_bytes()).unwrap_or_default()
            };
            mechanism.success(&data).map_err(|e| {
                ConnectionError::AuthenticationFailed(format!(
                    "server signature verification failed: {e:?}"
                ))
            })?;
            debug!("SASL authentication succeeded");
            return Ok(());
        } else if reply.is("failure", ns::SASL) {
            let condition = reply
                .children()
                .next()
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(ConnectionError::AuthenticationFailed(condition));
        } else {
            return Err(ConnectionError::StreamError(format!(
                "unexpected element <{}/> during SASL negotiation",
                reply.name()
            )));
        }
    }
}

async fn bind_resource<S>(
    stream: &mut S,
    framer: &mut XmlFramer,
    features: &Element,
    config: &ConnectionConfig,
    limit: Duration,
) -> Result<FullJid, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if features.get_child("bind", ns::BIND).is_none() {
        return Err(ConnectionError::StreamError(
            "server does not support resource binding".to_string(),
        ));
    }

    let mut bind = Element::builder("bind", ns::BIND).build();
    if let Some(resource) = config.jid.resource() {
        bind.append_child(
            Element::builder("resource", ns::BIND)
                .append(resource.as_str())
                .build(),
        );
    }
    let iq = Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", "set")
        .attr("id", "bind-1")
        .append(bind)
        .build();
    write_raw(stream, &stream::element_to_bytes(&iq)?, limit).await?;

    let jid = loop {
        let reply = read_element(stream, framer, limit).await?;
        if reply.name() != "iq" || reply.attr("id") != Some("bind-1") {
            debug!(name = reply.name(), "skipping element while binding");
            continue;
        }
        if reply.attr("type") != Some("result") {
            return Err(ConnectionError::StreamError(
                "resource binding failed".to_string(),
            ));
        }

        let text = reply
            .get_child("bind", ns::BIND)
            .and_then(|b| b.get_child("jid", ns::BIND))
            .map(|j| j.text())
            .ok_or_else(|| {
                ConnectionError::StreamError("bind result carries no JID".to_string())
            })?;
        break text.parse::<FullJid>().map_err(|e| {
            ConnectionError::StreamError(format!("server bound an invalid JID '{text}': {e}"))
        })?;
    };

    // Legacy session establishment, still required by some servers.
    if features.get_child("session", ns::SESSION).is_some() {
        let iq = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", "set")
            .attr("id", "session-1")
            .append(Element::builder("session", ns::SESSION).build())
            .build();
        write_raw(stream, &stream::element_to_bytes(&iq)?, limit).await?;
        loop {
            let reply = read_element(stream, framer, limit).await?;
            if reply.name() == "iq" && reply.attr("id") == Some("session-1") {
                break;
            }
        }
    }

    Ok(jid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mechanism_preference_order() {
        let credentials = || {
            Credentials::default()
                .with_username("alice")
                .with_password("secret")
                .with_channel_binding(ChannelBinding::Unsupported)
        };

        let all: HashSet<String> = ["PLAIN", "SCRAM-SHA-1", "SCRAM-SHA-256"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(
            select_mechanism(&all, credentials()).unwrap().name(),
            "SCRAM-SHA-256"
        );

        let no_sha256: HashSet<String> = ["PLAIN", "SCRAM-SHA-1"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(
            select_mechanism(&no_sha256, credentials()).unwrap().name(),
            "SCRAM-SHA-1"
        );

        let plain_only: HashSet<String> = ["PLAIN"].into_iter().map(String::from).collect();
        assert_eq!(
            select_mechanism(&plain_only, credentials()).unwrap().name(),
            "PLAIN"
        );

        let unsupported: HashSet<String> = ["EXTERNAL"].into_iter().map(String::from).collect();
        assert!(matches!(
            select_mechanism(&unsupported, credentials()),
            Err(ConnectionError::AuthenticationFailed(_))
        ));
    }
}
