//! The ESL frame parser (C1): turns a byte stream into framed messages.
//!
//! A [`FrameParser`] is a one-shot state machine — `Headers` → optional
//! `Body` → `Complete` — consumed exactly once via [`FrameParser::extract`].
//! [`Framer`] owns the chaining spec.md assigns to "the framer": it starts a
//! fresh [`FrameParser`] for every new message so callers never have to
//! manage that bookkeeping themselves.

use crate::error::{EslError, Result};
use bytes::Bytes;
use std::collections::HashMap;

/// A single ESL message: headers plus an optional body of exactly
/// `Content-Length` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    headers: HashMap<String, String>,
    body: Option<Bytes>,
}

impl Frame {
    /// Look up a header by its exact (case-sensitive) name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// The body decoded as UTF-8, lossily. Most ESL bodies are ASCII/UTF-8
    /// plain text or another header block; lossily decoding never panics.
    pub fn body_str(&self) -> Option<std::borrow::Cow<'_, str>> {
        self.body.as_ref().map(|b| String::from_utf8_lossy(b))
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }
}

enum ParserState {
    Headers { pending: Vec<u8>, lines: Vec<Vec<u8>> },
    Body { headers: HashMap<String, String>, buf: Vec<u8>, needed: usize },
    Complete(Frame),
}

/// One-shot header/body state machine for a single ESL message.
pub struct FrameParser {
    state: ParserState,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            state: ParserState::Headers { pending: Vec::new(), lines: Vec::new() },
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, ParserState::Complete(_))
    }

    /// Feed a single byte. Returns `Ok(())` unless the message is
    /// malformed beyond recovery (only possible while parsing
    /// `Content-Length`), in which case this is a fatal framing error.
    pub fn feed_byte(&mut self, byte: u8) -> Result<()> {
        match &mut self.state {
            ParserState::Headers { pending, lines } => {
                if byte == b'\n' {
                    if pending.is_empty() {
                        // Blank line: headers are complete.
                        let headers = parse_headers(lines);
                        self.state = start_body_or_complete(headers)?;
                    } else {
                        let line = std::mem::take(pending);
                        lines.push(line);
                    }
                } else {
                    pending.push(byte);
                }
                Ok(())
            }
            ParserState::Body { buf, needed, .. } => {
                buf.push(byte);
                if buf.len() >= *needed {
                    let placeholder = ParserState::Headers { pending: Vec::new(), lines: Vec::new() };
                    if let ParserState::Body { headers, buf, .. } =
                        std::mem::replace(&mut self.state, placeholder)
                    {
                        self.state = ParserState::Complete(Frame {
                            headers,
                            body: Some(Bytes::from(buf)),
                        });
                    }
                }
                Ok(())
            }
            ParserState::Complete(_) => {
                // The framer is responsible for starting a fresh parser
                // after `Complete`; feeding a finished parser is a bug in
                // the caller, not a protocol error.
                Ok(())
            }
        }
    }

    /// Consume this parser and take its completed frame. Only meaningful
    /// once [`FrameParser::is_complete`] is true.
    pub fn extract(self) -> Frame {
        match self.state {
            ParserState::Complete(frame) => frame,
            _ => Frame { headers: HashMap::new(), body: None },
        }
    }
}

fn start_body_or_complete(headers: HashMap<String, String>) -> Result<ParserState> {
    match headers.get("Content-Length") {
        Some(raw) => {
            let len: usize = raw
                .trim()
                .parse()
                .map_err(|_| EslError::ProtocolViolation(format!("bad Content-Length: {raw:?}")))?;
            if len == 0 {
                Ok(ParserState::Complete(Frame { headers, body: None }))
            } else {
                Ok(ParserState::Body { headers, buf: Vec::with_capacity(len), needed: len })
            }
        }
        None => Ok(ParserState::Complete(Frame { headers, body: None })),
    }
}

/// Parse a single `Key: Value` header line, splitting on the first `": "`
/// so values containing their own colons (URLs, times) survive intact.
/// Tolerates a bare colon with no following space rather than dropping the
/// header outright.
fn parse_header_line(line: &[u8]) -> Option<(String, String)> {
    let line = String::from_utf8_lossy(line);
    if let Some(idx) = line.find(": ") {
        Some((line[..idx].to_string(), line[idx + 2..].to_string()))
    } else if let Some(idx) = line.find(':') {
        Some((line[..idx].trim().to_string(), line[idx + 1..].trim().to_string()))
    } else {
        None
    }
}

/// Parse accumulated header lines as `Key: Value` pairs.
fn parse_headers(lines: &[Vec<u8>]) -> HashMap<String, String> {
    let mut headers = HashMap::with_capacity(lines.len());
    for line in lines {
        if let Some((key, value)) = parse_header_line(line) {
            headers.insert(key, value);
        }
    }
    headers
}

/// Parse a raw `\n`-separated header block, the same shape a
/// `text/event-plain` message's body carries (spec.md §3: "whose body is
/// itself a key/value block in the ESL header syntax"). Shares the
/// first-`": "` splitting rule with the outer frame's own headers so a
/// value embedding a colon parses identically in both places.
pub(crate) fn parse_header_block(bytes: &[u8]) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for line in bytes.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = parse_header_line(line) {
            headers.insert(key, value);
        }
    }
    headers
}

/// Consumes bytes and emits a sequence of completed [`Frame`]s, chaining a
/// fresh [`FrameParser`] after each one completes.
pub struct Framer {
    parser: FrameParser,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    pub fn new() -> Self {
        Self { parser: FrameParser::new() }
    }

    /// Feed a chunk of bytes (already CRLF-normalized to LF by the
    /// transport) and return every [`Frame`] that became complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        for &byte in bytes {
            self.parser.feed_byte(byte)?;
            if self.parser.is_complete() {
                let finished = std::mem::replace(&mut self.parser, FrameParser::new());
                frames.push(finished.extract());
            }
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_of(input: &[u8]) -> Vec<Frame> {
        let mut framer = Framer::new();
        framer.feed(input).expect("well-formed input")
    }

    #[test]
    fn parses_headers_only_message() {
        let frames = frame_of(b"Content-Type: command/reply\nReply-Text: +OK accepted\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].content_type(), Some("command/reply"));
        assert_eq!(frames[0].header("Reply-Text"), Some("+OK accepted"));
        assert!(frames[0].body().is_none());
    }

    #[test]
    fn parses_exact_length_body() {
        let raw = b"Content-Type: api/response\nContent-Length: 5\n\nhello";
        let frames = frame_of(raw);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].body_str().unwrap(), "hello");
    }

    #[test]
    fn content_length_zero_has_no_body() {
        let raw = b"Content-Type: command/reply\nContent-Length: 0\n\n";
        let frames = frame_of(raw);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].body().is_none());
    }

    #[test]
    fn splits_header_value_on_first_colon_space_only() {
        let raw = b"X-Url: http://host/path?a=b: c\n\n";
        let frames = frame_of(raw);
        assert_eq!(frames[0].header("X-Url"), Some("http://host/path?a=b: c"));
    }

    #[test]
    fn parse_header_block_matches_frame_header_splitting_rules() {
        let headers = parse_header_block(b"Event-Name: CHANNEL_ANSWER\nX-Url: http://host/path?a=b: c\n");
        assert_eq!(headers.get("Event-Name").map(String::as_str), Some("CHANNEL_ANSWER"));
        assert_eq!(headers.get("X-Url").map(String::as_str), Some("http://host/path?a=b: c"));
    }

    #[test]
    fn malformed_content_length_is_fatal() {
        let mut framer = Framer::new();
        let err = framer
            .feed(b"Content-Length: not-a-number\n\n")
            .unwrap_err();
        assert!(matches!(err, EslError::ProtocolViolation(_)));
    }

    #[test]
    fn chains_two_messages_from_one_feed() {
        let raw = b"Content-Type: command/reply\nReply-Text: +OK\n\nContent-Type: command/reply\nReply-Text: -ERR x\n\n";
        let frames = frame_of(raw);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].header("Reply-Text"), Some("+OK"));
        assert_eq!(frames[1].header("Reply-Text"), Some("-ERR x"));
    }

    #[test]
    fn byte_by_byte_feed_reconstructs_frame() {
        let raw = b"Content-Type: api/response\nContent-Length: 3\n\nabc";
        let mut framer = Framer::new();
        let mut frames = Vec::new();
        for &b in raw {
            frames.extend(framer.feed(&[b]).unwrap());
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].body_str().unwrap(), "abc");
    }
}
