//! Sensor input contract.
//!
//! The host platform owns the entity registry. The engine only needs the
//! current raw state of an entity and when it was last polled.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    /// Numeric text, a low/high sentinel, or unavailable/unknown.
    pub state: String,
    /// Last time the source polled the entity, changed or not.
    pub last_updated: DateTime<Utc>,
}

pub trait SensorSource: Send + Sync {
    /// `None` when the entity does not exist.
    fn get(&self, entity_id: &str) -> Option<SensorSample>;
}

/// In-memory entity states. Writers announce changed entity ids to
/// subscribers.
pub struct StateRegistry {
    states: RwLock<HashMap<String, SensorSample>>,
    changes: broadcast::Sender<String>,
}

impl Default for StateRegistry {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            states: RwLock::new(HashMap::new()),
            changes,
        }
    }
}

impl StateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, entity_id: &str, state: &str, last_updated: DateTime<Utc>) {
        self.states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                entity_id.to_string(),
                SensorSample {
                    state: state.to_string(),
                    last_updated,
                },
            );
        // No subscribers is fine.
        let _ = self.changes.send(entity_id.to_string());
    }

    pub fn remove(&self, entity_id: &str) {
        self.states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(entity_id);
        let _ = self.changes.send(entity_id.to_string());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}

impl SensorSource for StateRegistry {
    fn get(&self, entity_id: &str) -> Option<SensorSample> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_is_visible_and_announced() {
        let registry = StateRegistry::new();
        let mut changes = registry.subscribe();

        let now = Utc::now();
        registry.set("sensor.bella_glucose", "123", now);

        assert_eq!(
            registry.get("sensor.bella_glucose"),
            Some(SensorSample {
                state: "123".into(),
                last_updated: now
            })
        );
        assert_eq!(changes.recv().await.unwrap(), "sensor.bella_glucose");

        registry.remove("sensor.bella_glucose");
        assert!(registry.get("sensor.bella_glucose").is_none());
    }
}
