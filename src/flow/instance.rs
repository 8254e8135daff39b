use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;

use crate::protocol::Event;

use super::{CleanupReason, FlowError};

/// Identity of one reporting daemon process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub alias: String,
    pub source: String,
}

impl InstanceKey {
    pub fn new(alias: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            source: source.into(),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.alias, self.source)
    }
}

/// One tracked network flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flow {
    pub flow_id: u64,
    /// Daemon worker thread owning the flow.
    pub thread_id: u64,
    /// Most recent packet time seen for this flow. Never decreases.
    pub last_seen: u64,
    /// Idle threshold reported by the daemon.
    pub idle_time: u64,
    pub cleanup_reason: CleanupReason,
}

impl Flow {
    fn new(flow_id: u64, thread_id: u64) -> Self {
        Self {
            flow_id,
            thread_id,
            last_seen: 0,
            idle_time: 0,
            cleanup_reason: CleanupReason::Invalid,
        }
    }

    /// Time after which the daemon should have reported the flow as idle.
    pub fn expires_at(&self) -> u64 {
        self.last_seen.saturating_add(self.idle_time)
    }

    /// True if the owning thread's clock has moved past the idle deadline.
    pub fn is_stale(&self, thread_high_water_mark: u64) -> bool {
        self.expires_at() < thread_high_water_mark
    }
}

/// Per-instance state: the flow table and per-thread timestamp high-water marks.
#[derive(Debug)]
pub struct Instance {
    key: InstanceKey,
    flows: HashMap<u64, Flow>,
    thread_ts: HashMap<u64, u64>,
}

impl Instance {
    pub fn new(key: InstanceKey) -> Self {
        Self {
            key,
            flows: HashMap::new(),
            thread_ts: HashMap::new(),
        }
    }

    pub fn key(&self) -> &InstanceKey {
        &self.key
    }

    pub fn flow(&self, flow_id: u64) -> Option<&Flow> {
        self.flows.get(&flow_id)
    }

    pub fn flows(&self) -> impl Iterator<Item = &Flow> {
        self.flows.values()
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Raise the high-water mark of `thread_id` to `ts` if it is newer.
    pub fn observe_thread_ts(&mut self, thread_id: u64, ts: u64) {
        let mark = self.thread_ts.entry(thread_id).or_insert(0);
        *mark = (*mark).max(ts);
    }

    /// Most recent timestamp observed for `thread_id`, 0 if never seen.
    pub fn most_recent_flow_time(&self, thread_id: u64) -> u64 {
        self.thread_ts.get(&thread_id).copied().unwrap_or(0)
    }

    /// Create or refresh the flow referenced by `event`.
    ///
    /// `last_seen` becomes the maximum of the source/destination last packet
    /// times and its previous value; `idle_time` is taken verbatim when the
    /// event carries one. Creating a flow requires `thread_id`.
    pub fn touch_flow(&mut self, flow_id: u64, event: &Event) -> Result<&mut Flow, FlowError> {
        let last_pkt = [event.flow.src_last_pkt_time, event.flow.dst_last_pkt_time]
            .into_iter()
            .flatten()
            .max();

        let flow = match self.flows.entry(flow_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let thread_id = event.thread_id.ok_or(FlowError::MissingField {
                    field: "thread_id",
                    flow_id: Some(flow_id),
                })?;
                entry.insert(Flow::new(flow_id, thread_id))
            }
        };

        if let Some(ts) = last_pkt {
            flow.last_seen = flow.last_seen.max(ts);
        }
        if let Some(idle_time) = event.flow.idle_time {
            flow.idle_time = idle_time;
        }

        Ok(flow)
    }

    /// Remove a flow and tag it with `reason`.
    pub fn take_flow(&mut self, flow_id: u64, reason: CleanupReason) -> Option<Flow> {
        let mut flow = self.flows.remove(&flow_id)?;
        flow.cleanup_reason = reason;
        Some(flow)
    }

    /// Remove every flow owned by `thread_id`.
    pub fn take_thread_flows(&mut self, thread_id: u64, reason: CleanupReason) -> Vec<Flow> {
        let ids: Vec<u64> = self
            .flows
            .values()
            .filter(|f| f.thread_id == thread_id)
            .map(|f| f.flow_id)
            .collect();

        let mut taken: Vec<Flow> = ids
            .into_iter()
            .filter_map(|id| self.take_flow(id, reason))
            .collect();
        taken.sort_by_key(|f| f.flow_id);
        taken
    }

    /// Remove every flow.
    pub fn take_all_flows(&mut self, reason: CleanupReason) -> Vec<Flow> {
        let mut taken: Vec<Flow> = self
            .flows
            .drain()
            .map(|(_, mut flow)| {
                flow.cleanup_reason = reason;
                flow
            })
            .collect();
        taken.sort_by_key(|f| f.flow_id);
        taken
    }

    /// Flows whose idle deadline is already behind their thread's high-water mark.
    pub fn stale_flows(&self) -> impl Iterator<Item = &Flow> {
        self.flows
            .values()
            .filter(|f| f.is_stale(self.most_recent_flow_time(f.thread_id)))
    }
}
