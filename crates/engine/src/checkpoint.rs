//! Session checkpointing.
//!
//! A checkpoint is a JSON document capturing messages, budget, resources,
//! and the plan. The engine emits `checkpoint` events on its configured
//! interval; where the document lands is the store's business. Loading a
//! checkpoint computes a staleness report first, and a critical report
//! refuses to resume.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ta_domain::awareness::StateSnapshot;
use ta_domain::budget::TokenBudget;
use ta_domain::error::{Error, Result};
use ta_domain::message::ContextMessage;
use ta_domain::state::{AgentResources, PlanTask};
use ta_domain::tier::Tier;

use crate::monitor::{staleness_report, StalenessReport};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_state_snapshot: Option<StateSnapshot>,
    #[serde(default)]
    pub iteration: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointDocument {
    pub session_id: String,
    pub updated_at: DateTime<Utc>,
    /// Messages with their tier placement, in sequence order.
    pub messages: Vec<(Tier, ContextMessage)>,
    pub budget: TokenBudget,
    pub resources: AgentResources,
    pub task_state: Vec<PlanTask>,
    #[serde(default)]
    pub metadata: CheckpointMetadata,
}

/// Where checkpoint documents live. The engine only knows this trait;
/// durable storage is external.
pub trait CheckpointStore: Send + Sync {
    fn save(&self, doc: &CheckpointDocument) -> Result<()>;
    fn load(&self, session_id: &str) -> Result<Option<CheckpointDocument>>;
}

/// Load a checkpoint and gate it behind a staleness report. A critical
/// report returns the report alone; the document is withheld.
pub fn load_for_resume(
    store: &dyn CheckpointStore,
    session_id: &str,
    current_state: Option<&StateSnapshot>,
) -> Result<(Option<CheckpointDocument>, StalenessReport)> {
    let Some(doc) = store.load(session_id)? else {
        return Err(Error::Other(format!("no checkpoint for session {session_id}")));
    };

    let age = Utc::now().signed_duration_since(doc.updated_at);
    let mut contradictions = Vec::new();
    if let (Some(saved), Some(current)) = (&doc.metadata.last_state_snapshot, current_state) {
        if saved.element_count != current.element_count {
            contradictions.push(format!(
                "element count changed: {} at checkpoint, {} now",
                saved.element_count, current.element_count
            ));
        }
        for id in &saved.element_ids {
            if !current.contains_id(id) {
                contradictions.push(format!("element '{id}' no longer exists"));
            }
        }
    }

    let report = staleness_report(age, contradictions);
    if report.can_resume {
        Ok((Some(doc), report))
    } else {
        Ok((None, report))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stores
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-memory store for tests and default wiring.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    docs: parking_lot::Mutex<BTreeMap<String, CheckpointDocument>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, doc: &CheckpointDocument) -> Result<()> {
        self.docs
            .lock()
            .insert(doc.session_id.clone(), doc.clone());
        Ok(())
    }

    fn load(&self, session_id: &str) -> Result<Option<CheckpointDocument>> {
        Ok(self.docs.lock().get(session_id).cloned())
    }
}

/// One JSON file per session under `dir`, written atomically
/// (write-then-rename).
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        // Session ids are UUIDs; guard against path characters anyway.
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, doc: &CheckpointDocument) -> Result<()> {
        let path = self.path_for(&doc.session_id);
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(doc)?;
        std::fs::write(&tmp, payload)?;
        std::fs::rename(&tmp, &path)?;
        tracing::debug!(session_id = %doc.session_id, path = %path.display(), "checkpoint saved");
        Ok(())
    }

    fn load(&self, session_id: &str) -> Result<Option<CheckpointDocument>> {
        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let payload = std::fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&payload)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn doc(session_id: &str, age: Duration) -> CheckpointDocument {
        CheckpointDocument {
            session_id: session_id.into(),
            updated_at: Utc::now() - age,
            messages: vec![(Tier::Recent, ContextMessage::user("hello"))],
            budget: TokenBudget::new(1000),
            resources: AgentResources::new("board", "task"),
            task_state: vec![],
            metadata: CheckpointMetadata::default(),
        }
    }

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryCheckpointStore::new();
        store.save(&doc("s1", Duration::zero())).unwrap();
        let loaded = store.load("s1").unwrap().unwrap();
        assert_eq!(loaded.session_id, "s1");
        assert!(store.load("other").unwrap().is_none());
    }

    #[test]
    fn file_store_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(tmp.path()).unwrap();
        store.save(&doc("s1", Duration::zero())).unwrap();
        let loaded = store.load("s1").unwrap().unwrap();
        assert_eq!(loaded.session_id, "s1");
        assert_eq!(loaded.messages.len(), 1);
    }

    #[test]
    fn fresh_checkpoint_resumes() {
        let store = MemoryCheckpointStore::new();
        store.save(&doc("s1", Duration::minutes(5))).unwrap();
        let (loaded, report) = load_for_resume(&store, "s1", None).unwrap();
        assert!(loaded.is_some());
        assert!(report.can_resume);
    }

    #[test]
    fn ancient_checkpoint_is_withheld() {
        let store = MemoryCheckpointStore::new();
        store.save(&doc("s1", Duration::days(10))).unwrap();
        let (loaded, report) = load_for_resume(&store, "s1", None).unwrap();
        assert!(loaded.is_none());
        assert!(!report.can_resume);
    }

    #[test]
    fn contradictions_are_reported() {
        let store = MemoryCheckpointStore::new();
        let mut d = doc("s1", Duration::minutes(5));
        let mut saved_snapshot = StateSnapshot::empty();
        saved_snapshot.element_ids = vec!["el-1".into(), "el-2".into()];
        saved_snapshot.element_count = 2;
        d.metadata.last_state_snapshot = Some(saved_snapshot);
        store.save(&d).unwrap();

        let mut current = StateSnapshot::empty();
        current.element_ids = vec!["el-1".into()];
        current.element_count = 1;

        let (_, report) = load_for_resume(&store, "s1", Some(&current)).unwrap();
        assert_eq!(report.contradictions.len(), 2);
        assert!(report.contradictions.iter().any(|c| c.contains("el-2")));
    }

    #[test]
    fn missing_checkpoint_is_an_error() {
        let store = MemoryCheckpointStore::new();
        assert!(load_for_resume(&store, "ghost", None).is_err());
    }

    #[test]
    fn restored_messages_rebuild_context() {
        use crate::context::compressor::Compressor;
        use crate::context::estimator::TokenEstimator;
        use crate::context::manager::ContextManager;

        let mut original = ContextManager::new(4000, Compressor::new(TokenEstimator::default()));
        original.add_system_message("identity");
        original.add_user_message("build the header");
        original.add_assistant_message("working on it");

        let store = MemoryCheckpointStore::new();
        store
            .save(&CheckpointDocument {
                session_id: "s1".into(),
                updated_at: Utc::now(),
                messages: original.export_messages(),
                budget: original.budget().clone(),
                resources: AgentResources::new("board", "build the header"),
                task_state: vec![],
                metadata: CheckpointMetadata::default(),
            })
            .unwrap();

        let (doc, report) = load_for_resume(&store, "s1", None).unwrap();
        assert!(report.can_resume);
        let mut restored = ContextManager::new(4000, Compressor::new(TokenEstimator::default()));
        restored.import_messages(doc.unwrap().messages);

        assert_eq!(restored.message_count(), 3);
        assert_eq!(restored.tier_messages(Tier::System).len(), 1);
        let hits = restored.search("header", 10);
        assert_eq!(hits.len(), 1);
    }
}
