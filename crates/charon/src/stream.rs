//! Incremental XML framing for XMPP streams.
//!
//! An XMPP session is one long-lived XML document, so stanzas have to be
//! extracted incrementally from whatever bytes the socket delivers.  The
//! framer keeps a byte buffer and a resumable scan state (element depth,
//! inside-tag flag, quoting) and yields complete top-level elements as they
//! become available.

use minidom::Element;

use crate::error::ConnectionError;

/// Namespace URIs used during stream negotiation.
pub mod ns {
    pub const JABBER_CLIENT: &str = "jabber:client";
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
}

/// One complete frame extracted from the stream.
#[derive(Debug)]
pub enum Frame {
    /// A top-level element (stanza or negotiation element).
    Element(Element),
    /// The peer closed its side with `</stream:stream>`.
    StreamClose,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TagKind {
    Open,
    Close,
    Declaration,
}

/// Resumable scanner over the accumulated bytes.
#[derive(Debug, Default)]
struct ScanState {
    pos: usize,
    depth: usize,
    in_tag: bool,
    tag_kind: Option<TagKind>,
    quote: Option<u8>,
    element_start: Option<usize>,
}

#[derive(Debug, Default)]
pub struct XmlFramer {
    buffer: Vec<u8>,
    scan: ScanState,
}

impl XmlFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes received from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Discards all buffered data and parser state (used when the
    /// underlying stream restarts, e.g. after STARTTLS).
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.scan = ScanState::default();
    }

    /// Consumes the opening `<stream:stream ...>` tag.  Returns true once
    /// the complete tag has been seen and removed from the buffer.
    pub fn take_stream_header(&mut self) -> Result<bool, ConnectionError> {
        let text = String::from_utf8_lossy(&self.buffer);

        let Some(start) = text.find("<stream") else {
            // Nothing but the XML prolog or partial data so far.
            if text.trim_start().starts_with("<?") || text.trim().is_empty() {
                return Ok(false);
            }
            if text.len() < "<stream".len() {
                return Ok(false);
            }
            return Err(ConnectionError::StreamError(format!(
                "expected stream header, got: {}",
                text.chars().take(64).collect::<String>()
            )));
        };

        let Some(end) = text[start..].find('>') else {
            return Ok(false);
        };

        self.buffer.drain(..start + end + 1);
        self.scan = ScanState::default();
        Ok(true)
    }

    /// Extracts the next complete frame, or None if more data is needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ConnectionError> {
        while self.scan.pos < self.buffer.len() {
            let i = self.scan.pos;
            let b = self.buffer[i];

            if self.scan.in_tag {
                if let Some(q) = self.scan.quote {
                    if b == q {
                        self.scan.quote = None;
                    }
                } else {
                    match b {
                        b'"' | b'\'' => self.scan.quote = Some(b),
                        b'>' => {
                            self.scan.in_tag = false;
                            let self_closing = i > 0 && self.buffer[i - 1] == b'/';
                            match self.scan.tag_kind {
                                Some(TagKind::Open) if !self_closing => self.scan.depth += 1,
                                Some(TagKind::Close) => {
                                    if self.scan.depth == 0 {
                                        return Err(ConnectionError::StreamError(
                                            "unbalanced closing tag".to_string(),
                                        ));
                                    }
                                    self.scan.depth -= 1;
                                }
                                _ => (),
                            }

                            if self.scan.depth == 0 {
                                if let Some(start) = self.scan.element_start {
                                    let frame = self.extract(start, i + 1)?;
                                    return Ok(Some(frame));
                                }
                                // A declaration or prolog at the top level
                                // carries no content; drop it.
                                self.buffer.drain(..i + 1);
                                self.scan = ScanState::default();
                                continue;
                            }
                        }
                        _ => (),
                    }
                }
            } else if b == b'<' {
                // The kind marker is the next byte; wait for it.
                if i + 1 >= self.buffer.len() {
                    return Ok(None);
                }

                let kind = match self.buffer[i + 1] {
                    b'/' => TagKind::Close,
                    b'?' | b'!' => TagKind::Declaration,
                    _ => TagKind::Open,
                };

                if self.scan.depth == 0 && kind == TagKind::Close {
                    // Only the stream close appears as a top-level closing
                    // tag from the peer.
                    return Ok(Some(Frame::StreamClose));
                }

                if self.scan.depth == 0
                    && kind == TagKind::Open
                    && self.scan.element_start.is_none()
                {
                    self.scan.element_start = Some(i);
                }

                self.scan.in_tag = true;
                self.scan.tag_kind = Some(kind);
            }

            self.scan.pos = i + 1;
        }

        Ok(None)
    }

    fn extract(&mut self, start: usize, end: usize) -> Result<Frame, ConnectionError> {
        let slice = String::from_utf8_lossy(&self.buffer[start..end]).into_owned();
        self.buffer.drain(..end);
        self.scan = ScanState::default();

        let element = parse_top_level(&slice)?;
        Ok(Frame::Element(element))
    }
}

/// Parses an extracted top-level slice into an element.  Stanzas on the
/// wire inherit the stream's default namespace and the `stream:` prefix
/// from the stream header, neither of which is part of the slice, so the
/// missing declarations are injected before parsing.
pub fn parse_top_level(slice: &str) -> Result<Element, ConnectionError> {
    let patched = inject_namespaces(slice);
    patched
        .parse::<Element>()
        .map_err(|e| ConnectionError::StreamError(format!("failed to parse stanza: {e}")))
}

fn inject_namespaces(slice: &str) -> String {
    let tag_end = slice.find('>').unwrap_or(slice.len());
    let first_tag = &slice[..tag_end];

    let mut insert = String::new();
    if slice.starts_with("<stream:") && !first_tag.contains("xmlns:stream=") {
        insert.push_str(" xmlns:stream='http://etherx.jabber.org/streams'");
    }
    if !first_tag.contains("xmlns=") {
        insert.push_str(" xmlns='jabber:client'");
    }

    if insert.is_empty() {
        return slice.to_string();
    }

    // Insert right after the tag name.
    let name_end = slice[1..]
        .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .map(|i| i + 1)
        .unwrap_or(slice.len());

    let mut patched = String::with_capacity(slice.len() + insert.len());
    patched.push_str(&slice[..name_end]);
    patched.push_str(&insert);
    patched.push_str(&slice[name_end..]);
    patched
}

/// Serializes an element for the wire.
pub fn element_to_bytes(element: &Element) -> Result<Vec<u8>, ConnectionError> {
    let mut out = Vec::new();
    element
        .write_to(&mut out)
        .map_err(|e| ConnectionError::StreamError(format!("failed to serialize stanza: {e}")))?;
    Ok(out)
}

/// The opening bytes of a client-to-server stream.
pub fn stream_header(domain: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream to='{domain}' version='1.0' \
         xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_element(framer: &mut XmlFramer) -> Element {
        match framer.next_frame().unwrap() {
            Some(Frame::Element(e)) => e,
            other => panic!("expected element, got {other:?}"),
        }
    }

    #[test]
    fn parses_complete_stanza() {
        let mut framer = XmlFramer::new();
        framer.feed(b"<message to='a@x'><body>hi</body></message>");

        let elem = frame_element(&mut framer);
        assert_eq!(elem.name(), "message");
        assert_eq!(elem.attr("to"), Some("a@x"));
    }

    #[test]
    fn waits_for_partial_data() {
        let mut framer = XmlFramer::new();
        framer.feed(b"<message><bo");
        assert!(framer.next_frame().unwrap().is_none());

        framer.feed(b"dy>hi</body></mess");
        assert!(framer.next_frame().unwrap().is_none());

        framer.feed(b"age>");
        let elem = frame_element(&mut framer);
        assert_eq!(elem.name(), "message");
    }

    #[test]
    fn parses_self_closing_stanza() {
        let mut framer = XmlFramer::new();
        framer.feed(b"<presence type='unavailable'/>");
        let elem = frame_element(&mut framer);
        assert_eq!(elem.name(), "presence");
    }

    #[test]
    fn parses_consecutive_stanzas() {
        let mut framer = XmlFramer::new();
        framer.feed(b"<presence/><iq type='get' id='1'><x/></iq>");

        assert_eq!(frame_element(&mut framer).name(), "presence");
        assert_eq!(frame_element(&mut framer).name(), "iq");
        assert!(framer.next_frame().unwrap().is_none());
    }

    #[test]
    fn gt_inside_attribute_value_does_not_split() {
        let mut framer = XmlFramer::new();
        framer.feed(b"<message note='a > b'><body>x</body></message>");
        let elem = frame_element(&mut framer);
        assert_eq!(elem.attr("note"), Some("a > b"));
    }

    #[test]
    fn stream_close_is_reported() {
        let mut framer = XmlFramer::new();
        framer.feed(b"</stream:stream>");
        assert!(matches!(
            framer.next_frame().unwrap(),
            Some(Frame::StreamClose)
        ));
    }

    #[test]
    fn stream_header_is_consumed() {
        let mut framer = XmlFramer::new();
        framer.feed(b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' id='x1' ");
        assert!(!framer.take_stream_header().unwrap());

        framer.feed(b"version='1.0'><stream:features/>");
        assert!(framer.take_stream_header().unwrap());

        let elem = frame_element(&mut framer);
        assert_eq!(elem.name(), "features");
        assert_eq!(elem.ns(), ns::STREAM);
    }

    #[test]
    fn stream_prefixed_elements_parse() {
        let mut framer = XmlFramer::new();
        framer.feed(
            b"<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>\
              </stream:features>",
        );
        let elem = frame_element(&mut framer);
        assert_eq!(elem.name(), "features");
        assert!(elem.get_child("starttls", ns::TLS).is_some());
    }

    #[test]
    fn default_namespace_is_injected() {
        let mut framer = XmlFramer::new();
        framer.feed(b"<iq type='result' id='7'/>");
        let elem = frame_element(&mut framer);
        assert_eq!(elem.ns(), ns::JABBER_CLIENT);
    }

    #[test]
    fn explicit_namespace_is_kept() {
        let mut framer = XmlFramer::new();
        framer.feed(b"<open xmlns='urn:example:other'/>");
        let elem = frame_element(&mut framer);
        assert_eq!(elem.ns(), "urn:example:other");
    }

    #[test]
    fn prolog_is_skipped() {
        let mut framer = XmlFramer::new();
        framer.feed(b"<?xml version='1.0'?><presence/>");
        let elem = frame_element(&mut framer);
        assert_eq!(elem.name(), "presence");
    }
}
