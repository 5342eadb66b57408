//! Action Queue
//!
//! Holds recommendations that need a human decision, and remembers what
//! happened to them afterwards.
//!
//! ```text
//! pending ──► approved ──► completed   (mutation executed)
//!    │
//!    └──────► rejected
//! ```
//!
//! Every transition happens under one lock, so two racing dispositions of
//! the same item resolve to exactly one winner. Running the mutation of an
//! approved item additionally takes an [`ExecutionClaim`], so only one caller
//! executes it at a time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{Result, TriageError};
use crate::types::{AIActionType, PredictionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Approved,
    Rejected,
    /// Approved and the mailbox mutation succeeded
    Completed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionQueueItem {
    pub id: String,
    pub email_id: String,
    pub email_subject: String,
    pub sender_email: String,
    pub account_id: String,
    pub prediction: PredictionResult,
    pub status: QueueStatus,
    pub created_at: DateTime<Utc>,
    /// Set when the item leaves `pending`, kept through `completed`
    pub resolved_at: Option<DateTime<Utc>>,
    /// Set only once the mailbox mutation succeeded
    pub executed_at: Option<DateTime<Utc>>,
    /// Action chosen by the user instead of the predicted one
    #[serde(default)]
    pub modified_action: Option<AIActionType>,
    #[serde(default)]
    pub reason: QueueReason,
}

/// Why a recommendation ended up in front of the user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueReason {
    /// Confidence below the user's auto-approve threshold
    #[default]
    NeedsApproval,
    /// Confident enough, but the stage's auto-execution cap was used up
    BatchCapReached,
    /// Snooze and reply are never executed without the user
    NotExecutable,
    /// Auto-execution was attempted and the mailbox refused it
    ExecutionFailed,
}

impl ActionQueueItem {
    pub fn new(
        email_id: impl Into<String>,
        email_subject: impl Into<String>,
        sender_email: impl Into<String>,
        account_id: impl Into<String>,
        prediction: PredictionResult,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            email_id: email_id.into(),
            email_subject: email_subject.into(),
            sender_email: sender_email.into(),
            account_id: account_id.into(),
            prediction,
            status: QueueStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
            executed_at: None,
            modified_action: None,
            reason: QueueReason::NeedsApproval,
        }
    }

    pub fn with_reason(mut self, reason: QueueReason) -> Self {
        self.reason = reason;
        self
    }

    /// The action that should be executed: the user's override if any
    pub fn effective_action(&self) -> AIActionType {
        self.modified_action
            .unwrap_or(self.prediction.final_prediction.action)
    }

    pub fn is_pending(&self) -> bool {
        self.status == QueueStatus::Pending
    }

    /// Approved but the mutation has not (yet) succeeded
    pub fn awaits_execution(&self) -> bool {
        self.status == QueueStatus::Approved
    }
}

/// Outcome of a status change request
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// This call moved the item
    Applied(ActionQueueItem),
    /// The item was already in the requested state
    NoOp(ActionQueueItem),
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }

    pub fn item(&self) -> &ActionQueueItem {
        match self {
            Transition::Applied(item) | Transition::NoOp(item) => item,
        }
    }

    pub fn into_item(self) -> ActionQueueItem {
        match self {
            Transition::Applied(item) | Transition::NoOp(item) => item,
        }
    }
}

/// Exclusive right to run the mutation of one approved item.
/// Released on drop, whether or not the mutation succeeded.
pub struct ExecutionClaim<'a> {
    queue: &'a ActionQueue,
    item: ActionQueueItem,
}

impl ExecutionClaim<'_> {
    pub fn item(&self) -> &ActionQueueItem {
        &self.item
    }
}

impl Drop for ExecutionClaim<'_> {
    fn drop(&mut self) {
        self.queue.lock_executing().remove(&self.item.id);
    }
}

pub struct ActionQueue {
    config: QueueConfig,
    /// Newest first
    items: Mutex<VecDeque<ActionQueueItem>>,
    /// Ids whose mutation is running. Always locked after `items`.
    executing: Mutex<HashSet<String>>,
}

impl ActionQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            items: Mutex::new(VecDeque::new()),
            executing: Mutex::new(HashSet::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ActionQueueItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_executing(&self) -> MutexGuard<'_, HashSet<String>> {
        self.executing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the execution of an approved item.
    ///
    /// Returns `Ok(None)` when the item is already completed. A second claim
    /// while the first is held, or a claim on an item that was never
    /// approved, is a conflict.
    pub fn claim_execution(&self, id: &str) -> Result<Option<ExecutionClaim<'_>>> {
        let items = self.lock();
        let item = items
            .iter()
            .find(|i| i.id == id)
            .ok_or_else(|| TriageError::NotFound(format!("Queue item {}", id)))?;

        match item.status {
            QueueStatus::Completed => return Ok(None),
            QueueStatus::Approved => {}
            status => {
                return Err(TriageError::Conflict(format!(
                    "Queue item {} is {}, nothing to execute",
                    id, status
                )))
            }
        }

        if !self.lock_executing().insert(id.to_string()) {
            return Err(TriageError::Conflict(format!(
                "Queue item {} is already being executed",
                id
            )));
        }
        Ok(Some(ExecutionClaim {
            queue: self,
            item: item.clone(),
        }))
    }

    pub fn is_executing(&self, id: &str) -> bool {
        self.lock_executing().contains(id)
    }

    /// Insert at the head. Returns `false` when the email already has a
    /// pending item.
    pub fn add_item(&self, item: ActionQueueItem) -> bool {
        let mut items = self.lock();
        let inserted = Self::insert(&mut items, item);
        self.evict(&mut items);
        inserted
    }

    /// Insert several items, keeping their relative order at the head.
    /// Returns how many were inserted.
    pub fn add_items(&self, new_items: Vec<ActionQueueItem>) -> usize {
        let mut items = self.lock();
        let mut inserted = 0;
        for item in new_items.into_iter().rev() {
            if Self::insert(&mut items, item) {
                inserted += 1;
            }
        }
        self.evict(&mut items);
        inserted
    }

    fn insert(items: &mut VecDeque<ActionQueueItem>, item: ActionQueueItem) -> bool {
        if items
            .iter()
            .any(|i| i.is_pending() && i.email_id == item.email_id)
        {
            debug!("Email {} already has a pending queue item", item.email_id);
            return false;
        }
        items.push_front(item);
        true
    }

    /// Evict from the tail: completed items first, then rejected ones.
    /// Pending and approved-but-unexecuted items are never evicted.
    fn evict(&self, items: &mut VecDeque<ActionQueueItem>) {
        for victim in [QueueStatus::Completed, QueueStatus::Rejected] {
            while items.len() > self.config.capacity {
                match items.iter().rposition(|i| i.status == victim) {
                    Some(pos) => {
                        items.remove(pos);
                    }
                    None => break,
                }
            }
        }
    }

    /// Move an item to `status`.
    ///
    /// - `pending` → `approved` | `rejected` sets `resolved_at`
    /// - `approved` → `completed` requires `executed_at`
    /// - asking for the state the item is already in is a no-op
    /// - any other move is a conflict
    pub fn update_status(
        &self,
        id: &str,
        status: QueueStatus,
        executed_at: Option<DateTime<Utc>>,
    ) -> Result<Transition> {
        let mut items = self.lock();
        let item = items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| TriageError::NotFound(format!("Queue item {}", id)))?;

        let transition = Self::apply(item, status, executed_at, None)?;
        if let Transition::Applied(item) = &transition {
            info!(
                "Queue item {} for email {} -> {}",
                item.id, item.email_id, item.status
            );
        }
        Ok(transition)
    }

    /// Approve with a different action than the predicted one
    pub fn modify(&self, id: &str, action: AIActionType) -> Result<Transition> {
        let mut items = self.lock();
        let item = items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| TriageError::NotFound(format!("Queue item {}", id)))?;

        let transition = Self::apply(item, QueueStatus::Approved, None, Some(action))?;
        if let Transition::Applied(item) = &transition {
            info!(
                "Queue item {} for email {} modified to {}",
                item.id, item.email_id, action
            );
        }
        Ok(transition)
    }

    fn apply(
        item: &mut ActionQueueItem,
        status: QueueStatus,
        executed_at: Option<DateTime<Utc>>,
        modified_action: Option<AIActionType>,
    ) -> Result<Transition> {
        use QueueStatus::*;

        let conflict = |item: &ActionQueueItem| {
            TriageError::Conflict(format!(
                "Queue item {} is {}, cannot move to {}",
                item.id, item.status, status
            ))
        };

        match (item.status, status) {
            (_, Pending) => Err(TriageError::InvalidInput(
                "Queue items cannot return to pending".into(),
            )),

            (Pending, Approved) | (Pending, Rejected) => {
                item.status = status;
                item.resolved_at = Some(Utc::now());
                item.modified_action = modified_action;
                Ok(Transition::Applied(item.clone()))
            }
            (Pending, Completed) => Err(conflict(&*item)),

            (Approved, Completed) => {
                let Some(at) = executed_at else {
                    return Err(TriageError::InvalidInput(
                        "Completing a queue item requires executed_at".into(),
                    ));
                };
                item.status = Completed;
                item.executed_at = Some(at);
                Ok(Transition::Applied(item.clone()))
            }

            // An approval that lost the race, or a repeated call
            (Approved, Approved) | (Completed, Approved) | (Completed, Completed)
                if modified_action.is_none() || modified_action == item.modified_action =>
            {
                Ok(Transition::NoOp(item.clone()))
            }
            (Rejected, Rejected) => Ok(Transition::NoOp(item.clone())),

            _ => Err(conflict(&*item)),
        }
    }

    /// Approve every pending item matching `predicate` in one atomic step.
    /// Returns the approved items.
    pub fn approve_all<F>(&self, predicate: F) -> Vec<ActionQueueItem>
    where
        F: Fn(&ActionQueueItem) -> bool,
    {
        let mut items = self.lock();
        let now = Utc::now();
        let mut approved = Vec::new();
        for item in items.iter_mut() {
            if item.is_pending() && predicate(&*item) {
                item.status = QueueStatus::Approved;
                item.resolved_at = Some(now);
                approved.push(item.clone());
            }
        }

        if !approved.is_empty() {
            info!("Bulk-approved {} queue items", approved.len());
        }
        approved
    }

    pub fn get(&self, id: &str) -> Option<ActionQueueItem> {
        self.lock().iter().find(|i| i.id == id).cloned()
    }

    pub fn find_by_email(&self, email_id: &str) -> Option<ActionQueueItem> {
        self.lock().iter().find(|i| i.email_id == email_id).cloned()
    }

    /// Pending items, newest first
    pub fn pending(&self) -> Vec<ActionQueueItem> {
        self.lock().iter().filter(|i| i.is_pending()).cloned().collect()
    }

    /// Approved items whose mutation has not succeeded yet
    pub fn awaiting_execution(&self) -> Vec<ActionQueueItem> {
        self.lock()
            .iter()
            .filter(|i| i.awaits_execution())
            .cloned()
            .collect()
    }

    pub fn items(&self) -> Vec<ActionQueueItem> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Items worth persisting: every unresolved or unexecuted item, plus the
    /// newest resolved ones up to the configured limit.
    pub fn snapshot(&self) -> Vec<ActionQueueItem> {
        let items = self.lock();
        let mut resolved = 0;
        items
            .iter()
            .filter(|i| match i.status {
                QueueStatus::Pending | QueueStatus::Approved => true,
                QueueStatus::Rejected | QueueStatus::Completed => {
                    resolved += 1;
                    resolved <= self.config.persisted_resolved_limit
                }
            })
            .cloned()
            .collect()
    }

    /// Replace the queue contents. Items are expected newest first.
    pub fn restore(&self, snapshot: Vec<ActionQueueItem>) {
        let mut items = self.lock();
        *items = snapshot.into_iter().collect();
        self.evict(&mut items);
        debug!("Restored {} queue items", items.len());
    }
}
