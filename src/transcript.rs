use std::sync::Mutex;

use chrono::Utc;
use uuid::Uuid;

use crate::models::{SpeakerRole, TranscriptEntry, TranscriptSource};

/// Destination for a finished session transcript. The relational store
/// behind it is an external collaborator; the default deployment logs
/// the hand-off and discards.
pub trait TranscriptStore: Send + Sync {
    fn persist(&self, session_id: Uuid, entries: Vec<TranscriptEntry>);
}

/// Append-only transcript for one orchestrator session.
///
/// Owned by the orchestrator task; readers get cloned snapshots.
pub struct TranscriptLog {
    session_id: Uuid,
    entries: Mutex<Vec<TranscriptEntry>>,
}

impl TranscriptLog {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Append an entry and return a copy for broadcasting.
    pub fn append(
        &self,
        role: SpeakerRole,
        text: impl Into<String>,
        source: TranscriptSource,
        is_final: bool,
    ) -> TranscriptEntry {
        let entry = TranscriptEntry {
            session_id: self.session_id,
            role,
            text: text.into(),
            ts: Utc::now(),
            source,
            is_final,
        };
        self.entries.lock().unwrap().push(entry.clone());
        entry
    }

    pub fn snapshot(&self) -> Vec<TranscriptEntry> {
        self.entries.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain the log into `store` at session end.
    pub fn hand_off(&self, store: Option<&dyn TranscriptStore>) {
        let entries = std::mem::take(&mut *self.entries.lock().unwrap());
        match store {
            Some(store) if !entries.is_empty() => store.persist(self.session_id, entries),
            _ => {
                tracing::debug!(
                    session = %self.session_id,
                    entries = entries.len(),
                    "transcript discarded (no store configured)"
                );
            }
        }
    }
}
