//! Event decoding for distributor frame payloads.
//!
//! Turns the JSON payload of one frame into a typed [`Event`]. Payload bytes
//! are decoded ASCII-permissively: any non-ASCII byte becomes U+FFFD instead
//! of failing the frame, so a corrupted payload cannot desynchronize framing.

use std::borrow::Cow;

use serde_json::{Map, Value};
use thiserror::Error;

use super::event::{
    Category, DaemonEventName, Event, EventKind, FlowEventName, FlowFields,
};

/// Errors that can occur while decoding a payload.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("payload carries no packet/flow/daemon/error event id")]
    UnknownCategory,

    #[error("missing required field {field}")]
    MissingField { field: &'static str },

    #[error("field {field} has an unexpected type or value")]
    InvalidField { field: &'static str },
}

impl DecodeError {
    /// True when the payload is valid JSON but cannot be attributed to a
    /// daemon instance or event category.
    pub fn is_unattributable(&self) -> bool {
        matches!(
            self,
            Self::UnknownCategory
                | Self::MissingField {
                    field: "alias" | "source"
                }
        )
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidJson(_) => "invalid_json",
            Self::NotAnObject => "not_an_object",
            Self::UnknownCategory => "unknown_category",
            Self::MissingField { .. } => "missing_field",
            Self::InvalidField { .. } => "invalid_field",
        }
    }
}

/// Decode a frame payload into an [`Event`].
pub fn decode_event(payload: &[u8]) -> Result<Event, DecodeError> {
    let text = ascii_lossy(payload);
    let value: Value = serde_json::from_str(&text)?;
    let Value::Object(raw) = value else {
        return Err(DecodeError::NotAnObject);
    };
    event_from_object(raw)
}

/// Build an [`Event`] from an already parsed JSON object.
pub fn event_from_object(raw: Map<String, Value>) -> Result<Event, DecodeError> {
    let category = classify(&raw).ok_or(DecodeError::UnknownCategory)?;

    let alias = read_identity(&raw, "alias")?;
    let source = read_identity(&raw, "source")?;

    let event_id = read_u64(&raw, category.id_field())?.ok_or(DecodeError::InvalidField {
        field: category.id_field(),
    })?;
    let name = raw
        .get(category.name_field())
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingField {
            field: category.name_field(),
        })?
        .to_string();

    let kind = match category {
        Category::Packet => EventKind::Packet,
        Category::Flow => EventKind::Flow(FlowEventName::parse(&name)),
        Category::Daemon => EventKind::Daemon(DaemonEventName::parse(&name)),
        Category::Error => EventKind::Error,
    };

    let flow = FlowFields {
        flow_id: read_u64(&raw, "flow_id")?,
        src_last_pkt_time: read_u64(&raw, "flow_src_last_pkt_time")?,
        dst_last_pkt_time: read_u64(&raw, "flow_dst_last_pkt_time")?,
        idle_time: read_u64(&raw, "flow_idle_time")?,
        last_seen: read_u64(&raw, "flow_last_seen")?,
    };

    Ok(Event {
        kind,
        event_id,
        name,
        alias,
        source,
        thread_id: read_u64(&raw, "thread_id")?,
        thread_ts_usec: read_u64(&raw, "thread_ts_usec")?,
        flow,
        raw,
    })
}

/// Determine the category by which event id field is present.
pub fn classify(raw: &Map<String, Value>) -> Option<Category> {
    Category::all()
        .iter()
        .copied()
        .find(|c| raw.contains_key(c.id_field()))
}

/// Decode bytes as ASCII, replacing every non-ASCII byte with U+FFFD.
pub fn ascii_lossy(data: &[u8]) -> Cow<'_, str> {
    if data.is_ascii() {
        if let Ok(s) = std::str::from_utf8(data) {
            return Cow::Borrowed(s);
        }
    }

    Cow::Owned(
        data.iter()
            .map(|&b| {
                if b.is_ascii() {
                    char::from(b)
                } else {
                    char::REPLACEMENT_CHARACTER
                }
            })
            .collect(),
    )
}

fn read_identity(raw: &Map<String, Value>, field: &'static str) -> Result<String, DecodeError> {
    match raw.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Null) | None => Err(DecodeError::MissingField { field }),
        Some(_) => Err(DecodeError::InvalidField { field }),
    }
}

/// Read an unsigned integer field that may be encoded as a number or a
/// decimal string.
fn read_u64(raw: &Map<String, Value>, field: &'static str) -> Result<Option<u64>, DecodeError> {
    match raw.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or(DecodeError::InvalidField { field }),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| DecodeError::InvalidField { field }),
        Some(_) => Err(DecodeError::InvalidField { field }),
    }
}
