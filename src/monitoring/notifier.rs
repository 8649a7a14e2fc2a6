use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Mutex;
use tracing::{info, warn};

/// Per-domain alert conditions raised by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    NoProgress,
    SlowMemsetReact,
}

impl Condition {
    pub fn message(&self) -> &'static str {
        match self {
            Condition::NoProgress => "VM refused to give back requested memory",
            Condition::SlowMemsetReact => "VM didn't give back all requested memory",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::NoProgress => write!(f, "no_progress"),
            Condition::SlowMemsetReact => write!(f, "slow_memset_react"),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn raise(&self, domain_name: &str, condition: Condition);

    fn clear(&self, domain_name: &str, condition: Condition);
}

/// Reports conditions through the log only.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn raise(&self, domain_name: &str, condition: Condition) {
        warn!(domain = domain_name, %condition, "{}", condition.message());
    }

    fn clear(&self, domain_name: &str, condition: Condition) {
        info!(domain = domain_name, %condition, "Condition cleared");
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NotifierEvent {
    pub domain: String,
    pub condition: Condition,
    pub raised: bool,
    pub at: DateTime<Utc>,
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<NotifierEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<NotifierEvent> {
        self.lock().clone()
    }

    /// Conditions currently raised and not yet cleared.
    pub fn active(&self) -> Vec<(String, Condition)> {
        let mut active: Vec<(String, Condition)> = Vec::new();
        for event in self.lock().iter() {
            let key = (event.domain.clone(), event.condition);
            if event.raised {
                if !active.contains(&key) {
                    active.push(key);
                }
            } else {
                active.retain(|k| *k != key);
            }
        }
        active
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<NotifierEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, domain_name: &str, condition: Condition, raised: bool) {
        self.lock().push(NotifierEvent {
            domain: domain_name.to_string(),
            condition,
            raised,
            at: Utc::now(),
        });
    }
}

impl Notifier for RecordingNotifier {
    fn raise(&self, domain_name: &str, condition: Condition) {
        self.record(domain_name, condition, true);
    }

    fn clear(&self, domain_name: &str, condition: Condition) {
        self.record(domain_name, condition, false);
    }
}
