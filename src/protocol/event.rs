use std::fmt;

use serde_json::{Map, Value};

/// Category identifies which class of distributor event a record belongs to.
///
/// The discriminant doubles as an index into per-category arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Category {
    Packet = 0,
    Flow = 1,
    Daemon = 2,
    Error = 3,
}

/// Number of event categories, used for array sizing.
pub const CATEGORY_COUNT: usize = 4;

impl Category {
    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Packet => "packet",
            Self::Flow => "flow",
            Self::Daemon => "daemon",
            Self::Error => "error",
        }
    }

    /// JSON key whose presence marks a record of this category.
    pub const fn id_field(self) -> &'static str {
        match self {
            Self::Packet => "packet_event_id",
            Self::Flow => "flow_event_id",
            Self::Daemon => "daemon_event_id",
            Self::Error => "error_event_id",
        }
    }

    /// JSON key carrying the event name for this category.
    pub const fn name_field(self) -> &'static str {
        match self {
            Self::Packet => "packet_event_name",
            Self::Flow => "flow_event_name",
            Self::Daemon => "daemon_event_name",
            Self::Error => "error_event_name",
        }
    }

    /// Return all categories in classification order.
    pub fn all() -> &'static [Self] {
        &[Self::Packet, Self::Flow, Self::Daemon, Self::Error]
    }

    /// Array index for per-category tables.
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flow event names emitted by the daemon. Matching is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEventName {
    New,
    End,
    Idle,
    Update,
    Analyse,
    Guessed,
    Detected,
    DetectionUpdate,
    NotDetected,
    Other(String),
}

impl FlowEventName {
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "new" => Self::New,
            "end" => Self::End,
            "idle" => Self::Idle,
            "update" => Self::Update,
            "analyse" => Self::Analyse,
            "guessed" => Self::Guessed,
            "detected" => Self::Detected,
            "detection-update" => Self::DetectionUpdate,
            "not-detected" => Self::NotDetected,
            _ => Self::Other(name.to_string()),
        }
    }

    /// True for the names that drive the flow lifecycle directly
    /// (`end`, `idle`, `guessed`, `not-detected`, `detected`).
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::End | Self::Idle | Self::Guessed | Self::NotDetected | Self::Detected
        )
    }
}

/// Daemon lifecycle event names. Matching is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEventName {
    Init,
    Reconnect,
    Shutdown,
    Status,
    Other(String),
}

impl DaemonEventName {
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "init" => Self::Init,
            "reconnect" => Self::Reconnect,
            "shutdown" => Self::Shutdown,
            "status" => Self::Status,
            _ => Self::Other(name.to_string()),
        }
    }
}

/// Typed view of the event name, one variant per category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Packet,
    Flow(FlowEventName),
    Daemon(DaemonEventName),
    Error,
}

impl EventKind {
    pub const fn category(&self) -> Category {
        match self {
            Self::Packet => Category::Packet,
            Self::Flow(_) => Category::Flow,
            Self::Daemon(_) => Category::Daemon,
            Self::Error => Category::Error,
        }
    }
}

/// Flow-related numeric fields. All optional; which ones are required
/// depends on the lifecycle rule an event triggers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowFields {
    pub flow_id: Option<u64>,
    pub src_last_pkt_time: Option<u64>,
    pub dst_last_pkt_time: Option<u64>,
    pub idle_time: Option<u64>,
    pub last_seen: Option<u64>,
}

/// A decoded distributor record.
///
/// Identity and lifecycle fields are validated once at decode time; the
/// original JSON object is kept in `raw` for downstream sinks.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    /// Value of the `*_event_id` field.
    pub event_id: u64,
    /// Value of the `*_event_name` field, as received.
    pub name: String,
    pub alias: String,
    pub source: String,
    pub thread_id: Option<u64>,
    pub thread_ts_usec: Option<u64>,
    pub flow: FlowFields,
    pub raw: Map<String, Value>,
}

impl Event {
    pub fn category(&self) -> Category {
        self.kind.category()
    }
}
