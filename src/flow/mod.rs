//! Flow lifecycle tracking.
//!
//! [`FlowManager`] keeps a registry of daemon instances keyed by
//! `(alias, source)`, each holding a table of active flows and a per-thread
//! timestamp high-water mark. Every decoded event is fed through
//! [`FlowManager::process`], which returns the flows evicted as a result.

pub mod instance;

use std::collections::HashMap;
use std::fmt;

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::protocol::{DaemonEventName, Event, EventKind, FlowEventName};

pub use instance::{Flow, Instance, InstanceKey};

/// Why a flow left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CleanupReason {
    Invalid = 0,
    DaemonInit = 1,
    DaemonShutdown = 2,
    FlowEnd = 3,
    FlowIdle = 4,
    FlowTimeout = 5,
    AppShutdown = 6,
}

impl CleanupReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::DaemonInit => "daemon_init",
            Self::DaemonShutdown => "daemon_shutdown",
            Self::FlowEnd => "flow_end",
            Self::FlowIdle => "flow_idle",
            Self::FlowTimeout => "flow_timeout",
            Self::AppShutdown => "app_shutdown",
        }
    }

    pub const fn code(self) -> u8 {
        self as u8
    }

    pub fn all() -> &'static [Self] {
        &[
            Self::Invalid,
            Self::DaemonInit,
            Self::DaemonShutdown,
            Self::FlowEnd,
            Self::FlowIdle,
            Self::FlowTimeout,
            Self::AppShutdown,
        ]
    }
}

impl fmt::Display for CleanupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while applying an event to the registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    #[error("missing lifecycle field {field} (flow_id {flow_id:?})")]
    MissingField {
        field: &'static str,
        flow_id: Option<u64>,
    },
}

/// A flow removed from the registry, tagged with its cleanup reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub instance: InstanceKey,
    pub flow: Flow,
}

impl Eviction {
    pub fn flow_id(&self) -> u64 {
        self.flow.flow_id
    }

    pub fn reason(&self) -> CleanupReason {
        self.flow.cleanup_reason
    }

    /// JSON summary attached to sink output.
    pub fn to_json(&self) -> Value {
        json!({
            "alias": self.instance.alias,
            "source": self.instance.source,
            "flow_id": self.flow.flow_id,
            "thread_id": self.flow.thread_id,
            "last_seen": self.flow.last_seen,
            "idle_time": self.flow.idle_time,
            "reason": self.reason().as_str(),
            "reason_code": self.reason().code(),
        })
    }

    /// Minimal record for evictions that have no triggering event.
    pub fn synthesized_record(&self) -> Map<String, Value> {
        let mut raw = Map::new();
        raw.insert("alias".into(), json!(self.instance.alias));
        raw.insert("source".into(), json!(self.instance.source));
        raw.insert("flow_id".into(), json!(self.flow.flow_id));
        raw.insert("thread_id".into(), json!(self.flow.thread_id));
        raw.insert("flow_last_seen".into(), json!(self.flow.last_seen));
        raw.insert("flow_idle_time".into(), json!(self.flow.idle_time));
        raw
    }
}

/// A flow the daemon should already have reported as idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleFlow {
    pub instance: InstanceKey,
    pub flow_id: u64,
    pub thread_id: u64,
    pub expires_at: u64,
    pub high_water_mark: u64,
}

/// Registry of instances and their flows.
#[derive(Debug, Default)]
pub struct FlowManager {
    instances: HashMap<InstanceKey, Instance>,
}

impl FlowManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event and return the evictions it caused.
    ///
    /// On error the registry may still have been updated (instance creation,
    /// high-water mark) but no flow has been evicted.
    pub fn process(&mut self, event: &Event) -> Result<Vec<Eviction>, FlowError> {
        let key = InstanceKey::new(event.alias.as_str(), event.source.as_str());
        let instance = self
            .instances
            .entry(key.clone())
            .or_insert_with(|| Instance::new(key.clone()));

        if let (Some(thread_id), Some(ts)) = (event.thread_id, event.thread_ts_usec) {
            instance.observe_thread_ts(thread_id, ts);
        }

        let flows = match &event.kind {
            EventKind::Daemon(name @ (DaemonEventName::Init | DaemonEventName::Shutdown)) => {
                let reason = if *name == DaemonEventName::Init {
                    CleanupReason::DaemonInit
                } else {
                    CleanupReason::DaemonShutdown
                };
                let thread_id = event.thread_id.ok_or(FlowError::MissingField {
                    field: "thread_id",
                    flow_id: None,
                })?;

                let flows = instance.take_thread_flows(thread_id, reason);
                if instance.flow_count() == 0 {
                    self.instances.remove(&key);
                }
                flows
            }

            EventKind::Flow(name) if name.is_lifecycle() => {
                let flow_id = event.flow.flow_id.ok_or(FlowError::MissingField {
                    field: "flow_id",
                    flow_id: None,
                })?;
                instance.touch_flow(flow_id, event)?;

                let reason = match name {
                    FlowEventName::End => Some(CleanupReason::FlowEnd),
                    FlowEventName::Idle => Some(CleanupReason::FlowIdle),
                    _ => None,
                };
                reason
                    .and_then(|r| instance.take_flow(flow_id, r))
                    .into_iter()
                    .collect()
            }

            _ => {
                let Some(flow_id) = event.flow.flow_id else {
                    return Ok(Vec::new());
                };
                instance.touch_flow(flow_id, event)?;

                match (event.flow.last_seen, event.flow.idle_time, event.thread_id) {
                    (Some(last_seen), Some(idle_time), Some(thread_id))
                        if last_seen.saturating_add(idle_time)
                            < instance.most_recent_flow_time(thread_id) =>
                    {
                        instance
                            .take_flow(flow_id, CleanupReason::FlowTimeout)
                            .into_iter()
                            .collect()
                    }
                    _ => Vec::new(),
                }
            }
        };

        Ok(flows
            .into_iter()
            .map(|flow| Eviction {
                instance: key.clone(),
                flow,
            })
            .collect())
    }

    /// Report every flow whose idle deadline is behind its thread's
    /// high-water mark. Read-only; sorted by instance then flow id.
    pub fn verify(&self) -> Vec<StaleFlow> {
        let mut stale: Vec<StaleFlow> = self
            .instances
            .values()
            .flat_map(|instance| {
                instance.stale_flows().map(move |flow| StaleFlow {
                    instance: instance.key().clone(),
                    flow_id: flow.flow_id,
                    thread_id: flow.thread_id,
                    expires_at: flow.expires_at(),
                    high_water_mark: instance.most_recent_flow_time(flow.thread_id),
                })
            })
            .collect();
        stale.sort_by(|a, b| (&a.instance, a.flow_id).cmp(&(&b.instance, b.flow_id)));
        stale
    }

    /// Evict every remaining flow with [`CleanupReason::AppShutdown`] and
    /// empty the registry.
    pub fn shutdown(&mut self) -> Vec<Eviction> {
        let mut keys: Vec<InstanceKey> = self.instances.keys().cloned().collect();
        keys.sort();

        let mut evictions = Vec::new();
        for key in keys {
            if let Some(mut instance) = self.instances.remove(&key) {
                evictions.extend(
                    instance
                        .take_all_flows(CleanupReason::AppShutdown)
                        .into_iter()
                        .map(|flow| Eviction {
                            instance: key.clone(),
                            flow,
                        }),
                );
            }
        }
        evictions
    }

    pub fn instance(&self, key: &InstanceKey) -> Option<&Instance> {
        self.instances.get(key)
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Total number of active flows across all instances.
    pub fn flow_count(&self) -> usize {
        self.instances.values().map(Instance::flow_count).sum()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::protocol::parse::event_from_object;

    fn event(v: Value) -> Event {
        event_from_object(v.as_object().cloned().unwrap()).unwrap()
    }

    fn flow_event(name: &str, flow_id: u64, thread_id: u64, ts: u64) -> Event {
        event(json!({
            "flow_event_id": 1,
            "flow_event_name": name,
            "alias": "sensor",
            "source": "eth0",
            "thread_id": thread_id,
            "thread_ts_usec": ts,
            "flow_id": flow_id,
            "flow_src_last_pkt_time": ts,
            "flow_dst_last_pkt_time": ts,
            "flow_idle_time": 100,
        }))
    }

    fn daemon_event(name: &str, thread_id: u64, ts: u64) -> Event {
        event(json!({
            "daemon_event_id": 1,
            "daemon_event_name": name,
            "alias": "sensor",
            "source": "eth0",
            "thread_id": thread_id,
            "thread_ts_usec": ts,
        }))
    }

    fn key() -> InstanceKey {
        InstanceKey::new("sensor", "eth0")
    }

    #[test]
    fn test_reason_codes() {
        let codes: Vec<u8> = CleanupReason::all().iter().map(|r| r.code()).collect();
        assert_eq!(codes, vec![0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(CleanupReason::FlowTimeout.to_string(), "flow_timeout");
    }

    #[test]
    fn test_new_flow_is_registered() {
        let mut manager = FlowManager::new();
        let evicted = manager.process(&flow_event("new", 1, 0, 10)).unwrap();
        assert!(evicted.is_empty());
        assert_eq!(manager.instance_count(), 1);
        assert_eq!(manager.flow_count(), 1);

        let flow = manager.instance(&key()).unwrap().flow(1).unwrap().clone();
        assert_eq!(flow.thread_id, 0);
        assert_eq!(flow.last_seen, 10);
        assert_eq!(flow.idle_time, 100);
    }

    #[test]
    fn test_end_for_unknown_flow_creates_then_evicts() {
        let mut manager = FlowManager::new();
        let evicted = manager.process(&flow_event("end", 9, 0, 10)).unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].flow_id(), 9);
        assert_eq!(evicted[0].reason(), CleanupReason::FlowEnd);
        assert_eq!(evicted[0].instance, key());
        assert_eq!(manager.flow_count(), 0);
    }

    #[test]
    fn test_detected_then_idle_is_flow_idle() {
        let mut manager = FlowManager::new();
        // Idle timestamp far ahead so a timeout check would fire if applied.
        assert!(manager
            .process(&flow_event("detected", 3, 0, 10))
            .unwrap()
            .is_empty());
        let evicted = manager.process(&flow_event("idle", 3, 0, 1_000_000)).unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].reason(), CleanupReason::FlowIdle);
    }

    #[test]
    fn test_lifecycle_without_flow_id_is_error() {
        let mut manager = FlowManager::new();
        let ev = event(json!({
            "flow_event_id": 1,
            "flow_event_name": "end",
            "alias": "sensor",
            "source": "eth0",
            "thread_id": 0,
        }));
        assert_eq!(
            manager.process(&ev).unwrap_err(),
            FlowError::MissingField {
                field: "flow_id",
                flow_id: None
            }
        );
    }

    #[test]
    fn test_daemon_init_evicts_only_its_thread() {
        let mut manager = FlowManager::new();
        manager.process(&flow_event("new", 1, 0, 10)).unwrap();
        manager.process(&flow_event("new", 2, 1, 10)).unwrap();
        manager.process(&flow_event("new", 3, 0, 10)).unwrap();

        let evicted = manager.process(&daemon_event("init", 0, 20)).unwrap();
        let ids: Vec<u64> = evicted.iter().map(Eviction::flow_id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert!(evicted
            .iter()
            .all(|e| e.reason() == CleanupReason::DaemonInit));
        assert_eq!(manager.flow_count(), 1);
        assert_eq!(manager.instance_count(), 1);
    }

    #[test]
    fn test_daemon_shutdown_removes_empty_instance() {
        let mut manager = FlowManager::new();
        manager.process(&flow_event("new", 1, 4, 10)).unwrap();

        let evicted = manager.process(&daemon_event("shutdown", 4, 20)).unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].reason(), CleanupReason::DaemonShutdown);
        assert_eq!(manager.instance_count(), 0);
    }

    #[test]
    fn test_daemon_status_is_not_lifecycle() {
        let mut manager = FlowManager::new();
        manager.process(&flow_event("new", 1, 0, 10)).unwrap();
        assert!(manager
            .process(&daemon_event("status", 0, 20))
            .unwrap()
            .is_empty());
        assert_eq!(manager.flow_count(), 1);
        assert_eq!(
            manager.instance(&key()).unwrap().most_recent_flow_time(0),
            20
        );
    }

    #[test]
    fn test_daemon_init_without_thread_is_error() {
        let mut manager = FlowManager::new();
        let ev = event(json!({
            "daemon_event_id": 1,
            "daemon_event_name": "init",
            "alias": "sensor",
            "source": "eth0",
        }));
        assert!(matches!(
            manager.process(&ev),
            Err(FlowError::MissingField {
                field: "thread_id",
                ..
            })
        ));
    }

    #[test]
    fn test_packet_event_times_out_stale_flow() {
        let mut manager = FlowManager::new();
        manager.process(&flow_event("new", 5, 0, 10)).unwrap();
        // Move the thread clock forward.
        manager.process(&daemon_event("status", 0, 500)).unwrap();

        let stale = event(json!({
            "packet_event_id": 1,
            "packet_event_name": "packet-flow",
            "alias": "sensor",
            "source": "eth0",
            "thread_id": 0,
            "flow_id": 5,
            "flow_last_seen": 10,
            "flow_idle_time": 100,
        }));
        let evicted = manager.process(&stale).unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].reason(), CleanupReason::FlowTimeout);
        assert_eq!(manager.flow_count(), 0);
    }

    #[test]
    fn test_packet_event_within_idle_window_is_kept() {
        let mut manager = FlowManager::new();
        manager.process(&flow_event("new", 5, 0, 10)).unwrap();

        let fresh = event(json!({
            "packet_event_id": 1,
            "packet_event_name": "packet-flow",
            "alias": "sensor",
            "source": "eth0",
            "thread_id": 0,
            "thread_ts_usec": 50,
            "flow_id": 5,
            "flow_last_seen": 40,
            "flow_idle_time": 100,
        }));
        assert!(manager.process(&fresh).unwrap().is_empty());
        assert_eq!(manager.flow_count(), 1);
    }

    #[test]
    fn test_event_without_flow_id_touches_nothing() {
        let mut manager = FlowManager::new();
        let ev = event(json!({
            "error_event_id": 1,
            "error_event_name": "Unknown datalink layer packet",
            "alias": "sensor",
            "source": "eth0",
            "thread_id": 2,
            "thread_ts_usec": 77,
        }));
        assert!(manager.process(&ev).unwrap().is_empty());
        assert_eq!(manager.flow_count(), 0);
        assert_eq!(
            manager.instance(&key()).unwrap().most_recent_flow_time(2),
            77
        );
    }

    #[test]
    fn test_verify_reports_stale_flows() {
        let mut manager = FlowManager::new();
        manager.process(&flow_event("new", 1, 0, 10)).unwrap();
        assert!(manager.verify().is_empty());

        manager.process(&flow_event("new", 2, 0, 400)).unwrap();
        let stale = manager.verify();
        // flow 1 expires at 110, flow 2 at 500; mark is 400 from flow 2's event.
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].flow_id, 1);
        assert_eq!(stale[0].expires_at, 110);
        assert_eq!(stale[0].high_water_mark, 400);
        assert_eq!(manager.flow_count(), 2);
    }

    #[test]
    fn test_shutdown_evicts_everything() {
        let mut manager = FlowManager::new();
        manager.process(&flow_event("new", 1, 0, 10)).unwrap();
        manager.process(&flow_event("new", 2, 1, 10)).unwrap();
        let other = event(json!({
            "flow_event_id": 1,
            "flow_event_name": "new",
            "alias": "sensor",
            "source": "eth1",
            "thread_id": 0,
            "flow_id": 1,
        }));
        manager.process(&other).unwrap();

        let evicted = manager.shutdown();
        assert_eq!(evicted.len(), 3);
        assert!(evicted
            .iter()
            .all(|e| e.reason() == CleanupReason::AppShutdown));
        assert_eq!(manager.instance_count(), 0);
        assert_eq!(manager.flow_count(), 0);
        assert!(manager.shutdown().is_empty());
    }

    #[test]
    fn test_eviction_record() {
        let mut manager = FlowManager::new();
        let evicted = manager.process(&flow_event("end", 9, 2, 10)).unwrap();
        let summary = evicted[0].to_json();
        assert_eq!(summary["reason"], "flow_end");
        assert_eq!(summary["reason_code"], 3);

        let record = evicted[0].synthesized_record();
        assert_eq!(record["flow_id"], 9);
        assert_eq!(record["thread_id"], 2);
        assert_eq!(record["alias"], "sensor");
    }
}
