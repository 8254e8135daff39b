use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::config::EventConfig;
use crate::protocol::Event;

/// Per-category admission and field stripping applied before a job is queued.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    enabled: bool,
    event_names: HashSet<String>,
    ignore_fields: Vec<String>,
    ignore_risks: Vec<String>,
}

impl EventFilter {
    pub fn from_config(cfg: &EventConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            event_names: cfg.event_names.iter().cloned().collect(),
            ignore_fields: cfg.ignore_fields.clone(),
            ignore_risks: cfg.ignore_risks.clone(),
        }
    }

    /// Whether `event` should be dispatched. An empty allow-list admits all.
    pub fn allows(&self, event: &Event) -> bool {
        self.enabled && (self.event_names.is_empty() || self.event_names.contains(&event.name))
    }

    /// Remove ignored fields and ignored `ndpi.flow_risk` entries in place.
    pub fn strip(&self, record: &mut Map<String, Value>) {
        for field in &self.ignore_fields {
            record.remove(field);
        }

        if self.ignore_risks.is_empty() {
            return;
        }

        let risks = record
            .get_mut("ndpi")
            .and_then(Value::as_object_mut)
            .and_then(|ndpi| ndpi.get_mut("flow_risk"))
            .and_then(Value::as_object_mut);

        if let Some(risks) = risks {
            for risk in &self.ignore_risks {
                risks.remove(risk);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::protocol::parse::event_from_object;

    fn config(enabled: bool, names: &[&str]) -> EventConfig {
        EventConfig {
            enabled,
            event_names: names.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn flow(name: &str) -> Event {
        let raw = json!({
            "flow_event_id": 1,
            "flow_event_name": name,
            "alias": "a",
            "source": "b",
        });
        event_from_object(raw.as_object().cloned().unwrap()).unwrap()
    }

    #[test]
    fn test_disabled_rejects_everything() {
        let filter = EventFilter::from_config(&config(false, &[]));
        assert!(!filter.allows(&flow("new")));
    }

    #[test]
    fn test_empty_allow_list_admits_all() {
        let filter = EventFilter::from_config(&config(true, &[]));
        assert!(filter.allows(&flow("new")));
        assert!(filter.allows(&flow("whatever")));
    }

    #[test]
    fn test_allow_list_exact_match() {
        let filter = EventFilter::from_config(&config(true, &["end", "idle"]));
        assert!(filter.allows(&flow("end")));
        assert!(filter.allows(&flow("idle")));
        assert!(!filter.allows(&flow("new")));
        assert!(!filter.allows(&flow("END")));
    }

    #[test]
    fn test_strip_fields_and_risks() {
        let filter = EventFilter::from_config(&EventConfig {
            enabled: true,
            ignore_fields: vec!["flow_state".into(), "missing".into()],
            ignore_risks: vec!["15".into()],
            ..Default::default()
        });

        let mut record = json!({
            "flow_id": 1,
            "flow_state": "info",
            "ndpi": {"flow_risk": {"15": {"risk": "x"}, "21": {"risk": "y"}}},
        })
        .as_object()
        .cloned()
        .unwrap();

        filter.strip(&mut record);
        assert!(!record.contains_key("flow_state"));
        assert_eq!(record["flow_id"], 1);
        let risks = record["ndpi"]["flow_risk"].as_object().unwrap();
        assert!(!risks.contains_key("15"));
        assert!(risks.contains_key("21"));
    }

    #[test]
    fn test_strip_tolerates_missing_ndpi() {
        let filter = EventFilter::from_config(&EventConfig {
            enabled: true,
            ignore_risks: vec!["15".into()],
            ..Default::default()
        });
        let mut record = json!({"ndpi": "not an object"})
            .as_object()
            .cloned()
            .unwrap();
        filter.strip(&mut record);
        assert_eq!(record["ndpi"], "not an object");
    }
}
