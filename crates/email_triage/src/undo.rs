//! Undo records for executed actions

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tracing::debug;
use uuid::Uuid;

use crate::config::UndoConfig;
use crate::types::AIActionType;

/// Everything needed to reverse one executed action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoEntry {
    pub id: String,
    pub action_type: AIActionType,
    pub email_id: String,
    pub account_id: String,
    pub description: String,
    /// Opaque reversal data returned by the mailbox when the action ran
    pub undo_data: serde_json::Value,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    /// Ran without the user approving it first
    #[serde(default)]
    pub auto_executed: bool,
}

impl UndoEntry {
    pub fn new(
        action_type: AIActionType,
        email_id: impl Into<String>,
        account_id: impl Into<String>,
        user_id: impl Into<String>,
        undo_data: serde_json::Value,
    ) -> Self {
        let email_id = email_id.into();
        Self {
            id: Uuid::new_v4().to_string(),
            action_type,
            description: format!("{} email {}", action_type, email_id),
            email_id,
            account_id: account_id.into(),
            undo_data,
            user_id: user_id.into(),
            created_at: Utc::now(),
            auto_executed: false,
        }
    }

    pub fn auto_executed(mut self, auto: bool) -> Self {
        self.auto_executed = auto;
        self
    }
}

/// Where undo records go. Implemented by the host application.
pub trait UndoSink: Send + Sync {
    fn push(&self, entry: UndoEntry);

    /// Remove and return the newest entry still inside the retention window
    fn undo_latest(&self) -> Option<UndoEntry>;

    /// Whether an action on `email_id` is still undoable
    fn contains_email(&self, email_id: &str) -> bool;
}

/// Bounded stack that forgets entries older than the retention window
pub struct InMemoryUndoStack {
    retention: Duration,
    capacity: usize,
    /// Newest at the back
    entries: Mutex<VecDeque<UndoEntry>>,
}

impl InMemoryUndoStack {
    pub fn new(config: &UndoConfig) -> Self {
        Self {
            retention: Duration::days(config.retention_days),
            capacity: config.capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    fn prune(&self, entries: &mut VecDeque<UndoEntry>, now: DateTime<Utc>) {
        let cutoff = now - self.retention;
        let before = entries.len();
        entries.retain(|e| e.created_at >= cutoff);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        if entries.len() < before {
            debug!("Pruned {} undo entries", before - entries.len());
        }
    }

    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        self.prune(&mut entries, Utc::now());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<UndoEntry> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        self.prune(&mut entries, Utc::now());
        entries.iter().cloned().collect()
    }
}

impl UndoSink for InMemoryUndoStack {
    fn push(&self, entry: UndoEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.push_back(entry);
        self.prune(&mut entries, Utc::now());
    }

    fn undo_latest(&self) -> Option<UndoEntry> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        self.prune(&mut entries, Utc::now());
        entries.pop_back()
    }

    fn contains_email(&self, email_id: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        self.prune(&mut entries, Utc::now());
        entries.iter().any(|e| e.email_id == email_id)
    }
}
