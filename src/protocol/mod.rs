//! Wire protocol of the distributor socket: framing, event model, decoding.

pub mod event;
pub mod frame;
pub mod parse;
pub mod stats;

pub use self::event::{
    Category, DaemonEventName, Event, EventKind, FlowEventName, FlowFields, CATEGORY_COUNT,
};
pub use self::frame::{
    encode_frame, Frame, FrameBuffer, FrameError, NETWORK_BUFFER_MAX_SIZE,
    NETWORK_BUFFER_MIN_SIZE,
};
pub use self::parse::{decode_event, DecodeError};
pub use self::stats::EventStats;
