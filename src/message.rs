//! Lifts framed [`Frame`]s into typed views (C3's content-type taxonomy).
//!
//! Every `Content-Type` ESL defines gets its own variant; anything else is
//! passed through opaque so the pipeline never has to special-case a
//! FreeSWITCH version that adds a content type this crate doesn't know
//! about yet (spec.md §3: "Unknown content types... MUST NOT crash the
//! pipeline").

use crate::frame::{parse_header_block, Frame};
use std::collections::HashMap;

/// `Event-Name`, converted between FreeSWITCH's `UPPER_UNDERSCORE` wire
/// form and an internal closed enum with an `Unknown` fallback so that an
/// event name this crate doesn't recognize still round-trips losslessly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventName {
    ChannelCreate,
    ChannelAnswer,
    ChannelExecuteComplete,
    ChannelBridge,
    ChannelUnbridge,
    ChannelHangup,
    ChannelHangupComplete,
    ChannelState,
    ChannelData,
    BackgroundJob,
    Heartbeat,
    Custom,
    /// Any event name not enumerated above, kept verbatim.
    Unknown(String),
}

impl EventName {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "CHANNEL_CREATE" => EventName::ChannelCreate,
            "CHANNEL_ANSWER" => EventName::ChannelAnswer,
            "CHANNEL_EXECUTE_COMPLETE" => EventName::ChannelExecuteComplete,
            "CHANNEL_BRIDGE" => EventName::ChannelBridge,
            "CHANNEL_UNBRIDGE" => EventName::ChannelUnbridge,
            "CHANNEL_HANGUP" => EventName::ChannelHangup,
            "CHANNEL_HANGUP_COMPLETE" => EventName::ChannelHangupComplete,
            "CHANNEL_STATE" => EventName::ChannelState,
            "CHANNEL_DATA" => EventName::ChannelData,
            "BACKGROUND_JOB" => EventName::BackgroundJob,
            "HEARTBEAT" => EventName::Heartbeat,
            "CUSTOM" => EventName::Custom,
            other => EventName::Unknown(other.to_string()),
        }
    }

    /// The `UPPER_UNDERSCORE` wire form, as used in `event plain ...`.
    pub fn as_wire(&self) -> &str {
        match self {
            EventName::ChannelCreate => "CHANNEL_CREATE",
            EventName::ChannelAnswer => "CHANNEL_ANSWER",
            EventName::ChannelExecuteComplete => "CHANNEL_EXECUTE_COMPLETE",
            EventName::ChannelBridge => "CHANNEL_BRIDGE",
            EventName::ChannelUnbridge => "CHANNEL_UNBRIDGE",
            EventName::ChannelHangup => "CHANNEL_HANGUP",
            EventName::ChannelHangupComplete => "CHANNEL_HANGUP_COMPLETE",
            EventName::ChannelState => "CHANNEL_STATE",
            EventName::ChannelData => "CHANNEL_DATA",
            EventName::BackgroundJob => "BACKGROUND_JOB",
            EventName::Heartbeat => "HEARTBEAT",
            EventName::Custom => "CUSTOM",
            EventName::Unknown(raw) => raw,
        }
    }
}

/// A `text/event-plain` message: a framed message whose body is itself a
/// header block. The frame's own headers carry only `Content-Type` and
/// `Content-Length`; every event field (`Event-Name`, `Unique-ID`, …) lives
/// in the body, per spec.md §3.
#[derive(Debug, Clone)]
pub struct EventMessage {
    frame: Frame,
    body_headers: HashMap<String, String>,
    /// Free text following a blank line inside the event body, if any
    /// (e.g. a `BACKGROUND_JOB` event's own nested `+OK .../-ERR ...`
    /// result, itself introduced by a second, inner `Content-Length`).
    inner_body: Option<String>,
}

impl EventMessage {
    pub fn from_frame(frame: Frame) -> Self {
        let (body_headers, inner_body) = match frame.body() {
            Some(raw) => split_event_body(raw),
            None => (HashMap::new(), None),
        };
        Self { frame, body_headers, inner_body }
    }

    /// Look up an event field by name, parsed out of the body's header
    /// block (not the wrapping frame's own headers).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.body_headers.get(name).map(String::as_str)
    }

    /// The free text following the event's header block, if the body
    /// carried one (e.g. a `BACKGROUND_JOB` event's job result).
    pub fn body(&self) -> Option<&str> {
        self.inner_body.as_deref()
    }

    pub fn event_name(&self) -> EventName {
        self.header("Event-Name").map(EventName::parse).unwrap_or(EventName::Unknown(String::new()))
    }

    pub fn event_subclass(&self) -> Option<&str> {
        self.header("Event-Subclass")
    }

    pub fn unique_id(&self) -> Option<&str> {
        self.header("Unique-ID")
    }

    pub fn job_uuid(&self) -> Option<&str> {
        self.header("Job-UUID")
    }

    pub fn application_uuid(&self) -> Option<&str> {
        self.header("Application-UUID")
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }
}

/// Splits an event body into its header block and, if a blank line
/// follows, the free text after it — the same header-block-then-body
/// shape the outer frame itself has, one level down.
fn split_event_body(raw: &[u8]) -> (HashMap<String, String>, Option<String>) {
    match raw.windows(2).position(|pair| pair == b"\n\n") {
        Some(pos) => {
            let headers = parse_header_block(&raw[..pos]);
            let body = String::from_utf8_lossy(&raw[pos + 2..]).to_string();
            (headers, Some(body))
        }
        None => (parse_header_block(raw), None),
    }
}

/// `api/response`: success iff the body is non-empty and either starts
/// with `-ERR no reply` (FreeSWITCH's "legitimately nothing to say" case)
/// or doesn't start with `-` at all.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    body: String,
}

impl ApiResponse {
    pub fn from_frame(frame: &Frame) -> Self {
        let body = frame
            .body_str()
            .map(|b| b.trim_end_matches('\n').to_string())
            .unwrap_or_default();
        Self { body }
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn success(&self) -> bool {
        !self.body.is_empty() && (self.body.starts_with("-ERR no reply") || !self.body.starts_with('-'))
    }

    pub fn error_message(&self) -> Option<String> {
        self.body.strip_prefix("-ERR ").map(str::to_string)
    }
}

/// `command/reply`: success iff `Reply-Text` starts with `+OK`.
#[derive(Debug, Clone)]
pub struct CommandReply {
    frame: Frame,
    reply_text: String,
}

impl CommandReply {
    pub fn from_frame(frame: Frame) -> Self {
        let reply_text = frame.header("Reply-Text").unwrap_or("").to_string();
        Self { frame, reply_text }
    }

    pub fn reply_text(&self) -> &str {
        &self.reply_text
    }

    pub fn success(&self) -> bool {
        self.reply_text.starts_with("+OK")
    }

    pub fn error_message(&self) -> Option<String> {
        self.reply_text.strip_prefix("-ERR ").map(str::to_string)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.frame.header(name)
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }
}

/// A `BACKGROUND_JOB` event's result, derived identically to
/// [`CommandReply`]: the event body carries `+OK <payload>` or
/// `-ERR <reason>`.
#[derive(Debug, Clone)]
pub struct BackgroundJobResult {
    pub job_uuid: String,
    body: String,
}

impl BackgroundJobResult {
    /// Returns `None` if `event` isn't a `BACKGROUND_JOB` event or carries
    /// no `Job-UUID`.
    pub fn from_event(event: &EventMessage) -> Option<Self> {
        if event.event_name() != EventName::BackgroundJob {
            return None;
        }
        let job_uuid = event.job_uuid()?.to_string();
        let body = event.body().map(|b| b.trim_end_matches('\n').to_string()).unwrap_or_default();
        Some(Self { job_uuid, body })
    }

    pub fn success(&self) -> bool {
        self.body.starts_with("+OK")
    }

    pub fn error_message(&self) -> Option<String> {
        self.body.strip_prefix("-ERR ").map(str::to_string)
    }

    pub fn body(&self) -> &str {
        &self.body
    }
}

/// A framed message, classified by `Content-Type`.
#[derive(Debug, Clone)]
pub enum Message {
    AuthRequest(Frame),
    CommandReply(CommandReply),
    ApiResponse(ApiResponse),
    Event(EventMessage),
    DisconnectNotice(Frame),
    /// An unrecognized `Content-Type` (or none at all), passed through
    /// opaque.
    Other(Frame),
}

impl Message {
    pub fn classify(frame: Frame) -> Self {
        match frame.content_type() {
            Some("auth/request") => Message::AuthRequest(frame),
            Some("command/reply") => Message::CommandReply(CommandReply::from_frame(frame)),
            Some("api/response") => Message::ApiResponse(ApiResponse::from_frame(&frame)),
            Some("text/event-plain") => Message::Event(EventMessage::from_frame(frame)),
            Some("text/disconnect-notice") => Message::DisconnectNotice(frame),
            _ => Message::Other(frame),
        }
    }

    /// Header lookup that works regardless of which variant this is —
    /// needed because some FreeSWITCH versions deliver outbound channel
    /// data as a `command/reply` and others as an event (spec.md §9).
    pub fn header(&self, name: &str) -> Option<&str> {
        match self {
            Message::AuthRequest(f) | Message::DisconnectNotice(f) | Message::Other(f) => f.header(name),
            Message::CommandReply(r) => r.header(name),
            Message::ApiResponse(_) => None,
            Message::Event(e) => e.header(name),
        }
    }

    pub fn is_event(&self) -> bool {
        matches!(self, Message::Event(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Framer;

    fn classify(raw: &[u8]) -> Message {
        let mut framer = Framer::new();
        let mut frames = framer.feed(raw).unwrap();
        Message::classify(frames.remove(0))
    }

    #[test]
    fn api_response_plus_ok_is_success() {
        let msg = classify(b"Content-Type: api/response\nContent-Length: 3\n\n+OK");
        match msg {
            Message::ApiResponse(r) => assert!(r.success()),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn api_response_no_reply_is_success_with_preserved_message() {
        let body = b"-ERR no reply";
        let raw = format!("Content-Type: api/response\nContent-Length: {}\n\n", body.len());
        let mut full = raw.into_bytes();
        full.extend_from_slice(body);
        let msg = classify(&full);
        match msg {
            Message::ApiResponse(r) => {
                assert!(r.success());
                assert_eq!(r.error_message().as_deref(), Some("no reply"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn api_response_real_error_is_failure() {
        let body = b"-ERR Error";
        let raw = format!("Content-Type: api/response\nContent-Length: {}\n\n", body.len());
        let mut full = raw.into_bytes();
        full.extend_from_slice(body);
        let msg = classify(&full);
        match msg {
            Message::ApiResponse(r) => {
                assert!(!r.success());
                assert_eq!(r.error_message().as_deref(), Some("Error"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn command_reply_success_and_failure() {
        match classify(b"Content-Type: command/reply\nReply-Text: +OK accepted\n\n") {
            Message::CommandReply(r) => assert!(r.success()),
            _ => panic!("wrong variant"),
        }
        match classify(b"Content-Type: command/reply\nReply-Text: -ERR Invalid Password\n\n") {
            Message::CommandReply(r) => {
                assert!(!r.success());
                assert_eq!(r.error_message().as_deref(), Some("Invalid Password"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_content_type_passes_through() {
        match classify(b"Content-Type: text/made-up\n\n") {
            Message::Other(_) => {}
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn event_name_round_trips_unknown() {
        assert_eq!(EventName::parse("SOME_FUTURE_EVENT").as_wire(), "SOME_FUTURE_EVENT");
        assert_eq!(EventName::parse("CHANNEL_ANSWER"), EventName::ChannelAnswer);
    }

    /// Builds the wire shape FreeSWITCH actually sends for `text/event-plain`:
    /// event fields live in the `Content-Length`-framed body, not the
    /// wrapping frame's own headers (spec.md §3).
    fn event_frame(body: &str) -> Vec<u8> {
        format!("Content-Type: text/event-plain\nContent-Length: {}\n\n{}", body.len(), body).into_bytes()
    }

    #[test]
    fn event_fields_are_read_from_the_body_not_the_frame_headers() {
        let body = "Event-Name: CHANNEL_EXECUTE_COMPLETE\nApplication-UUID: app-1\nUnique-ID: call-1\nJob-UUID: job-1\n";
        match classify(&event_frame(body)) {
            Message::Event(event) => {
                assert_eq!(event.event_name(), EventName::ChannelExecuteComplete);
                assert_eq!(event.application_uuid(), Some("app-1"));
                assert_eq!(event.unique_id(), Some("call-1"));
                assert_eq!(event.job_uuid(), Some("job-1"));
                // The wrapping frame's own headers carry only framing info,
                // never the event fields themselves.
                assert_eq!(event.frame().header("Event-Name"), None);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn background_job_result_parses_body_from_event_fields_in_body() {
        let body = "Event-Name: BACKGROUND_JOB\nJob-UUID: job-42\n\n+OK 1234\n";
        match classify(&event_frame(body)) {
            Message::Event(event) => {
                let result = BackgroundJobResult::from_event(&event).expect("should parse");
                assert_eq!(result.job_uuid, "job-42");
                assert!(result.success());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
