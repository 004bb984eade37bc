use crate::normalize;
use crate::protocol::{AttributeCode, ParsedCommand, Verb};
use serde_json::Value;

/// A classified line received from the device
///
/// Everything except notifications carries the command it answers.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `+OK`
    Acknowledged { command: ParsedCommand },

    /// `+OK <payload>`
    AcknowledgedWithPayload { command: ParsedCommand, payload: String },

    /// `-ERR <message>`
    ErrorResponse { command: ParsedCommand, message: String },

    /// `! <publishToken> <payload>`
    Notification { publish_token: String, payload: String },
}

impl Message {
    /// Instance tag of the answered command (empty for notifications)
    pub fn instance_tag(&self) -> &str {
        self.command().map(|c| c.instance_tag.as_str()).unwrap_or("")
    }

    /// The command this message answers
    pub fn command(&self) -> Option<&ParsedCommand> {
        match self {
            Message::Acknowledged { command }
            | Message::AcknowledgedWithPayload { command, .. }
            | Message::ErrorResponse { command, .. } => Some(command),
            Message::Notification { .. } => None,
        }
    }

    pub fn verb(&self) -> Option<Verb> {
        self.command().and_then(|c| c.verb)
    }

    pub fn attribute(&self) -> Option<AttributeCode> {
        self.command().and_then(|c| c.attribute)
    }

    /// Raw payload or error text
    pub fn payload(&self) -> Option<&str> {
        match self {
            Message::Acknowledged { .. } => None,
            Message::AcknowledgedWithPayload { payload, .. }
            | Message::Notification { payload, .. } => Some(payload),
            Message::ErrorResponse { message, .. } => Some(message),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Message::ErrorResponse { .. })
    }

    /// Payload repaired into structured data
    ///
    /// A payload that cannot be repaired is logged and treated as absent.
    pub fn parse_payload(&self) -> Option<Value> {
        let raw = match self {
            Message::AcknowledgedWithPayload { payload, .. }
            | Message::Notification { payload, .. } => payload,
            _ => return None,
        };
        match normalize::parse_payload(raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!("{}: \"{}\"", e, raw);
                None
            }
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Acknowledged { command } => write!(f, "{}", command),
            Message::AcknowledgedWithPayload { command, payload } => {
                write!(f, "{}: {}", command, payload)
            }
            Message::ErrorResponse { command, message } => {
                write!(f, "{}: -ERR {}", command, message)
            }
            Message::Notification {
                publish_token,
                payload,
            } => write!(f, "! {}: {}", publish_token, payload),
        }
    }
}

/// First-pass classification of a raw line, before echo correlation
#[derive(Debug, Clone, PartialEq)]
pub enum LineKind {
    Ok,
    OkWithPayload(String),
    Error(String),
    Notification { publish_token: String, payload: String },
    /// Anything else: echoes, banners, prompts
    Other,
}

/// Classify one received line
pub fn classify(line: &str) -> LineKind {
    if line == "+OK" {
        LineKind::Ok
    } else if let Some(payload) = line.strip_prefix("+OK ") {
        LineKind::OkWithPayload(payload.to_string())
    } else if let Some(message) = line.strip_prefix("-ERR ") {
        LineKind::Error(message.to_string())
    } else if let Some(rest) = line.strip_prefix("! ") {
        let (publish_token, payload) = split_notification(rest);
        LineKind::Notification {
            publish_token,
            payload,
        }
    } else {
        LineKind::Other
    }
}

/// Split a notification body into token and payload
///
/// Accepts `<token> <payload>` as well as the verbose
/// `"publishToken":"<token>" <payload>` form.
fn split_notification(rest: &str) -> (String, String) {
    let rest = rest.trim_start();

    if let Some(after) = rest.strip_prefix("\"publishToken\":") {
        let after = after.trim_start();
        if let Some(quoted) = after.strip_prefix('"') {
            if let Some(end) = quoted.find('"') {
                let token = quoted[..end].to_string();
                let payload = quoted[end + 1..].trim_start().to_string();
                return (token, payload);
            }
        }
    }

    match rest.split_once(char::is_whitespace) {
        Some((token, payload)) => (token.trim_matches('"').to_string(), payload.trim_start().to_string()),
        None => (rest.trim_matches('"').to_string(), String::new()),
    }
}
