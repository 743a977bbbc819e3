//! Simulation trail persistence.
//!
//! A trail is the append-only history of one simulation: an environment
//! snapshot per step, the events dispatched during the step, the agent
//! decisions recorded during it, and the running step count.

use async_trait::async_trait;
use colony_core::{DecisionRecord, EventEnvelope};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;

use crate::error::{EnvError, EnvResult};

#[async_trait]
pub trait TrailStore: Send + Sync + 'static {
    async fn save_state(&self, trail_id: &str, step: u64, state: &Value) -> EnvResult<()>;

    async fn create_event(&self, trail_id: &str, step: u64, event: &EventEnvelope)
    -> EnvResult<()>;

    async fn record_decision(
        &self,
        trail_id: &str,
        step: u64,
        decision: &DecisionRecord,
    ) -> EnvResult<()>;

    /// Bump and return the number of completed steps
    async fn update_step_count(&self, trail_id: &str) -> EnvResult<u64>;
}

/// One persisted trail line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum TrailRecord {
    State {
        trail_id: String,
        step: u64,
        state: Value,
    },
    Event {
        trail_id: String,
        step: u64,
        event: EventEnvelope,
    },
    Decision {
        trail_id: String,
        step: u64,
        decision: DecisionRecord,
    },
    StepCount {
        trail_id: String,
        steps: u64,
    },
}

impl TrailRecord {
    pub fn trail_id(&self) -> &str {
        match self {
            Self::State { trail_id, .. }
            | Self::Event { trail_id, .. }
            | Self::Decision { trail_id, .. }
            | Self::StepCount { trail_id, .. } => trail_id,
        }
    }
}

fn poisoned() -> EnvError {
    EnvError::Trail("trail store lock poisoned".to_string())
}

/// Keeps every record in memory. Used by tests and the CLI demo.
#[derive(Debug, Default)]
pub struct InMemoryTrailStore {
    records: Mutex<Vec<TrailRecord>>,
    steps: Mutex<HashMap<String, u64>>,
}

impl InMemoryTrailStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, record: TrailRecord) -> EnvResult<()> {
        self.records.lock().map_err(|_| poisoned())?.push(record);
        Ok(())
    }

    pub fn records(&self) -> Vec<TrailRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn states(&self) -> Vec<(u64, Value)> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                TrailRecord::State { step, state, .. } => Some((step, state)),
                _ => None,
            })
            .collect()
    }

    pub fn decisions(&self) -> Vec<(u64, DecisionRecord)> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                TrailRecord::Decision { step, decision, .. } => Some((step, decision)),
                _ => None,
            })
            .collect()
    }

    pub fn step_count(&self, trail_id: &str) -> u64 {
        self.steps
            .lock()
            .ok()
            .and_then(|steps| steps.get(trail_id).copied())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TrailStore for InMemoryTrailStore {
    async fn save_state(&self, trail_id: &str, step: u64, state: &Value) -> EnvResult<()> {
        self.push(TrailRecord::State {
            trail_id: trail_id.to_string(),
            step,
            state: state.clone(),
        })
    }

    async fn create_event(
        &self,
        trail_id: &str,
        step: u64,
        event: &EventEnvelope,
    ) -> EnvResult<()> {
        self.push(TrailRecord::Event {
            trail_id: trail_id.to_string(),
            step,
            event: event.clone(),
        })
    }

    async fn record_decision(
        &self,
        trail_id: &str,
        step: u64,
        decision: &DecisionRecord,
    ) -> EnvResult<()> {
        self.push(TrailRecord::Decision {
            trail_id: trail_id.to_string(),
            step,
            decision: decision.clone(),
        })
    }

    async fn update_step_count(&self, trail_id: &str) -> EnvResult<u64> {
        let mut steps = self.steps.lock().map_err(|_| poisoned())?;
        let count = steps.entry(trail_id.to_string()).or_default();
        *count += 1;
        Ok(*count)
    }
}

/// Appends one JSON object per line to a file
#[derive(Debug)]
pub struct JsonlTrailStore {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
    steps: Mutex<HashMap<String, u64>>,
}

impl JsonlTrailStore {
    /// Open `path` for appending, creating it if missing
    pub async fn open(path: impl AsRef<Path>) -> EnvResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
            steps: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, record: &TrailRecord) -> EnvResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read every record back from a trail file
    pub async fn read_all(path: impl AsRef<Path>) -> EnvResult<Vec<TrailRecord>> {
        let contents = tokio::fs::read_to_string(path).await?;
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(EnvError::from))
            .collect()
    }
}

#[async_trait]
impl TrailStore for JsonlTrailStore {
    async fn save_state(&self, trail_id: &str, step: u64, state: &Value) -> EnvResult<()> {
        self.append(&TrailRecord::State {
            trail_id: trail_id.to_string(),
            step,
            state: state.clone(),
        })
        .await
    }

    async fn create_event(
        &self,
        trail_id: &str,
        step: u64,
        event: &EventEnvelope,
    ) -> EnvResult<()> {
        self.append(&TrailRecord::Event {
            trail_id: trail_id.to_string(),
            step,
            event: event.clone(),
        })
        .await
    }

    async fn record_decision(
        &self,
        trail_id: &str,
        step: u64,
        decision: &DecisionRecord,
    ) -> EnvResult<()> {
        self.append(&TrailRecord::Decision {
            trail_id: trail_id.to_string(),
            step,
            decision: decision.clone(),
        })
        .await
    }

    async fn update_step_count(&self, trail_id: &str) -> EnvResult<u64> {
        let steps = {
            let mut counts = self.steps.lock().map_err(|_| poisoned())?;
            let count = counts.entry(trail_id.to_string()).or_default();
            *count += 1;
            *count
        };
        self.append(&TrailRecord::StepCount {
            trail_id: trail_id.to_string(),
            steps,
        })
        .await?;
        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colony_core::{Address, AgentId, Event};
    use serde_json::json;

    fn decision() -> DecisionRecord {
        DecisionRecord {
            agent_id: AgentId::parse("a1").unwrap(),
            trigger: "StartEvent".into(),
            decision: json!({"bid": 4}),
        }
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryTrailStore::new();
        store.save_state("t", 1, &json!({"score": 1})).await.unwrap();
        store.record_decision("t", 1, &decision()).await.unwrap();
        assert_eq!(store.update_step_count("t").await.unwrap(), 1);
        assert_eq!(store.update_step_count("t").await.unwrap(), 2);

        assert_eq!(store.states(), vec![(1, json!({"score": 1}))]);
        assert_eq!(store.decisions().len(), 1);
        assert_eq!(store.step_count("t"), 2);
        assert_eq!(store.step_count("other"), 0);
    }

    #[tokio::test]
    async fn test_jsonl_store_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trail.jsonl");
        let store = JsonlTrailStore::open(&path).await.unwrap();

        let event = Event::new("Bid", Address::Env, Address::All);
        store.save_state("t", 1, &json!({"k": "v"})).await.unwrap();
        store
            .create_event("t", 1, &EventEnvelope::from(&event))
            .await
            .unwrap();
        store.record_decision("t", 1, &decision()).await.unwrap();
        store.update_step_count("t").await.unwrap();

        let records = JsonlTrailStore::read_all(&path).await.unwrap();
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.trail_id() == "t"));
        assert!(matches!(records[3], TrailRecord::StepCount { steps: 1, .. }));

        // reopening appends rather than truncating
        let reopened = JsonlTrailStore::open(&path).await.unwrap();
        reopened.save_state("t", 2, &json!({})).await.unwrap();
        assert_eq!(JsonlTrailStore::read_all(&path).await.unwrap().len(), 5);
    }
}
