//! Incremental XML reader/writer scoped to the `<stream:stream>` root
//! element (§4.2).
//!
//! Grounded on `tokio-xmpp::xmlstream`, which drives `rxml`'s event parser
//! directly to stream partial tokens without buffering a whole element.
//! That machinery (~900 lines in `xmlstream/common.rs`) earns its keep there
//! because `tokio-xmpp` must interleave stream-feature negotiation with
//! arbitrary nonzas mid-parse; this crate's contract is narrower (§4.2 only
//! asks for whole-element boundaries), so the codec here buffers bytes until
//! a complete top-level child is seen, then parses that child in one shot
//! with `minidom::Element`'s `FromStr` impl — the same `Element` type
//! `tokio-xmpp` converts its typed stanzas to/from (`xso::minidom_compat`).

use std::str::FromStr;

use minidom::Element;

use crate::error::{Error, ProtocolError};
use crate::stanza::Node;

/// Event produced while reading the stream (§4.2).
#[derive(Debug, Clone)]
pub enum CodecEvent {
    /// `<stream:stream …>` was seen; carries its attributes.
    StreamStart(Vec<(String, String)>),
    /// A complete stanza/control child element was parsed.
    Element(Node, String),
    /// `</stream:stream>` was seen.
    StreamEnd,
}

/// Default XML namespace assumed for top-level children that don't declare
/// their own (ordinary client stanzas inherit the stream's namespace on the
/// wire; see module docs for why we don't track inherited namespaces fully).
const DEFAULT_NS: &str = "jabber:client";

/// Scans a byte buffer for stream-level structure and emits [`CodecEvent`]s,
/// consuming bytes as complete tokens are recognized.
#[derive(Default)]
pub struct StreamCodec {
    buf: Vec<u8>,
    stream_open: bool,
    stream_ns: Option<String>,
}

impl StreamCodec {
    pub fn new() -> Self {
        StreamCodec::default()
    }

    /// `resetStream()`: reinitialize the parser (§4.2), called after
    /// STARTTLS and after a successful SASL negotiation, both of which
    /// require a fresh `<stream:stream>` header in each direction.
    pub fn reset_stream(&mut self) {
        self.buf.clear();
        self.stream_open = false;
    }

    /// Feed newly-read bytes into the buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pull as many complete events as the buffered bytes allow.
    pub fn poll_events(&mut self) -> Result<Vec<CodecEvent>, Error> {
        let mut events = Vec::new();
        loop {
            if !self.stream_open {
                match self.try_take_stream_start()? {
                    Some(ev) => events.push(ev),
                    None => break,
                }
            } else if let Some(pos) = find_stream_end(&self.buf) {
                self.buf.drain(..pos + STREAM_END_TAG.len());
                self.stream_open = false;
                events.push(CodecEvent::StreamEnd);
            } else {
                match self.try_take_element()? {
                    Some(ev) => events.push(ev),
                    None => break,
                }
            }
        }
        Ok(events)
    }

    fn try_take_stream_start(&mut self) -> Result<Option<CodecEvent>, Error> {
        let text = String::from_utf8_lossy(&self.buf);
        let Some(start) = text.find("<stream:stream") else {
            return Ok(None);
        };
        let Some(rel_end) = text[start..].find('>') else {
            return Ok(None);
        };
        let end = start + rel_end;
        let header = &text[start..=end];
        let attrs = parse_attrs(header);
        let ns = attrs
            .iter()
            .find(|(k, _)| k == "xmlns")
            .map(|(_, v)| v.clone());
        let consumed = end + 1;
        self.buf.drain(..consumed);
        self.stream_open = true;
        self.stream_ns = ns;
        Ok(Some(CodecEvent::StreamStart(attrs)))
    }

    fn try_take_element(&mut self) -> Result<Option<CodecEvent>, Error> {
        let text = String::from_utf8_lossy(&self.buf).into_owned();
        let Some((start, end)) = find_complete_element(&text) else {
            return Ok(None);
        };
        let mut snippet = text[start..end].to_string();
        if let Some(ns) = &self.stream_ns {
            snippet = ensure_default_ns(&snippet, ns);
        } else {
            snippet = ensure_default_ns(&snippet, DEFAULT_NS);
        }
        let el = Element::from_str(&snippet)
            .map_err(|e| Error::Protocol(ProtocolError::Parser(e.to_string())))?;
        let node = crate::stanza::element_to_node(&el);
        self.buf.drain(..end);
        Ok(Some(CodecEvent::Element(node, el.name().to_owned())))
    }
}

const STREAM_END_TAG: &str = "</stream:stream>";

fn find_stream_end(buf: &[u8]) -> Option<usize> {
    let text = String::from_utf8_lossy(buf);
    text.find(STREAM_END_TAG)
}

/// Find the byte range `[start, end)` of the first complete top-level
/// element in `text`, tracking nesting depth by counting open/close/self-
/// closing tags. Ignores markup inside comments/CDATA for simplicity (not
/// used by CoopFox payloads).
fn find_complete_element(text: &str) -> Option<(usize, usize)> {
    let bytes = text.as_bytes();
    let start = text.find('<')?;
    if text[start..].starts_with(STREAM_END_TAG) {
        return None;
    }
    let mut i = start;
    let mut depth = 0i32;
    while i < bytes.len() {
        if bytes[i] != b'<' {
            i += 1;
            continue;
        }
        let Some(gt) = text[i..].find('>') else {
            return None;
        };
        let tag = &text[i..i + gt + 1];
        if tag.starts_with("<!") || tag.starts_with("<?") {
            i += gt + 1;
            continue;
        }
        if tag.ends_with("/>") {
            // self-closing: doesn't change depth
        } else if tag.starts_with("</") {
            depth -= 1;
        } else {
            depth += 1;
        }
        let tag_end = i + gt + 1;
        if depth == 0 {
            return Some((start, tag_end));
        }
        i = tag_end;
    }
    None
}

fn parse_attrs(header: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let inner = header.trim_start_matches('<').trim_end_matches('>').trim_end_matches('/');
    let mut rest = inner;
    // skip the tag name
    if let Some(space) = rest.find(char::is_whitespace) {
        rest = &rest[space..];
    } else {
        return attrs;
    }
    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim();
        if key.is_empty() {
            break;
        }
        rest = &rest[eq + 1..].trim_start();
        let quote = rest.chars().next();
        let Some(q) = quote.filter(|c| *c == '"' || *c == '\'') else {
            break;
        };
        let Some(close) = rest[1..].find(q) else {
            break;
        };
        let value = &rest[1..1 + close];
        attrs.push((key.to_owned(), unescape(value)));
        rest = &rest[1 + close + 1..];
    }
    attrs
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Ensure the snippet's root element declares a default namespace, so a
/// bare (inherited-namespace) stanza still parses standalone.
fn ensure_default_ns(snippet: &str, ns: &str) -> String {
    if snippet.contains("xmlns") {
        return snippet.to_owned();
    }
    if let Some(space_or_close) = snippet.find(|c: char| c.is_whitespace() || c == '>' || c == '/') {
        let (head, tail) = snippet.split_at(space_or_close);
        format!("{head} xmlns=\"{ns}\"{tail}")
    } else {
        snippet.to_owned()
    }
}

/// `writeElement(name, tree)`: serialize a [`Node`] to XML bytes (§4.2).
pub fn write_element(node: &Node) -> Vec<u8> {
    let el = crate::stanza::node_to_element(node);
    el.to_string().into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_stream_start_and_two_children() {
        let mut codec = StreamCodec::new();
        codec.feed(
            b"<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='h' id='1'>\
              <message id='m1'><body>hi</body></message>\
              <presence/>",
        );
        let events = codec.poll_events().unwrap();
        assert!(matches!(events[0], CodecEvent::StreamStart(_)));
        match &events[1] {
            CodecEvent::Element(node, name) => {
                assert_eq!(name, "message");
                assert_eq!(node.child("body").unwrap().text.as_deref(), Some("hi"));
            }
            _ => panic!("expected element"),
        }
        match &events[2] {
            CodecEvent::Element(_, name) => assert_eq!(name, "presence"),
            _ => panic!("expected element"),
        }
    }

    #[test]
    fn partial_element_waits_for_more_bytes() {
        let mut codec = StreamCodec::new();
        codec.feed(b"<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>");
        codec.feed(b"<message id='m1'><body>partial");
        let events = codec.poll_events().unwrap();
        assert_eq!(events.len(), 1);
        codec.feed(b"</body></message>");
        let events = codec.poll_events().unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn recognizes_stream_end() {
        let mut codec = StreamCodec::new();
        codec.feed(b"<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'></stream:stream>");
        let events = codec.poll_events().unwrap();
        assert!(matches!(events.last().unwrap(), CodecEvent::StreamEnd));
    }
}
