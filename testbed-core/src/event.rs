//! Append-only log of lifecycle events
//!
//! Every recorded event is also emitted through `tracing`, at the level matching its severity.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "topology.created")]
    TopologyCreated,
    #[serde(rename = "topology.deleted")]
    TopologyDeleted,
    #[serde(rename = "scenario.created")]
    ScenarioCreated,
    #[serde(rename = "scenario.started")]
    ScenarioStarted,
    #[serde(rename = "scenario.ended")]
    ScenarioEnded,
    #[serde(rename = "scenario.failed")]
    ScenarioFailed,
    #[serde(rename = "scenario.removed")]
    ScenarioRemoved,
    #[serde(rename = "impairment.applied")]
    ImpairmentApplied,
    #[serde(rename = "impairment.removed")]
    ImpairmentRemoved,
    #[serde(rename = "system.warning")]
    SystemWarning,
    #[serde(rename = "system.error")]
    SystemError,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TopologyCreated => "topology.created",
            EventKind::TopologyDeleted => "topology.deleted",
            EventKind::ScenarioCreated => "scenario.created",
            EventKind::ScenarioStarted => "scenario.started",
            EventKind::ScenarioEnded => "scenario.ended",
            EventKind::ScenarioFailed => "scenario.failed",
            EventKind::ScenarioRemoved => "scenario.removed",
            EventKind::ImpairmentApplied => "impairment.applied",
            EventKind::ImpairmentRemoved => "impairment.removed",
            EventKind::SystemWarning => "system.warning",
            EventKind::SystemError => "system.error",
        }
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub severity: Severity,
    pub topology: Option<String>,
    pub scenario: Option<String>,
    pub node: Option<String>,
    pub link: Option<String>,
    pub message: String,
    pub details: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            severity,
            topology: None,
            scenario: None,
            node: None,
            link: None,
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn scenario(mut self, scenario: &str) -> Self {
        self.scenario = Some(scenario.to_string());
        self
    }

    pub fn node(mut self, node: &str) -> Self {
        self.node = Some(node.to_string());
        self
    }

    pub fn link(mut self, link: &str) -> Self {
        self.link = Some(link.to_string());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Cloneable handle to the event log of one topology
#[derive(Clone)]
pub struct EventLog {
    topology: Arc<str>,
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    pub fn new(topology: impl Into<Arc<str>>) -> Self {
        Self {
            topology: topology.into(),
            events: Arc::default(),
        }
    }

    pub fn record(&self, mut event: Event) {
        if event.topology.is_none() {
            event.topology = Some(self.topology.to_string());
        }

        let kind = event.kind;
        let scenario = event.scenario.as_deref().unwrap_or("-");
        match event.severity {
            Severity::Debug => tracing::debug!(%kind, scenario, "{}", event.message),
            Severity::Info => tracing::info!(%kind, scenario, "{}", event.message),
            Severity::Warning => tracing::warn!(%kind, scenario, "{}", event.message),
            Severity::Error | Severity::Critical => {
                tracing::error!(%kind, scenario, "{}", event.message)
            }
        }

        self.events.lock().push(event);
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Events recorded at or after position `cursor`, plus the cursor to resume from
    pub fn since(&self, cursor: usize) -> (Vec<Event>, usize) {
        let events = self.events.lock();
        let start = cursor.min(events.len());
        (events[start..].to_vec(), events.len())
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
