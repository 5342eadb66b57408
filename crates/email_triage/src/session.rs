//! Per-user triage session
//!
//! Owns every piece of mutable engine state for one user and sequences the
//! full loop: predict, then execute or queue, then feed the user's decision
//! back into the trust profile.
//!
//! Mailbox mutations always run before the queue records `completed`, so a
//! failed mutation leaves the item approved and retryable.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TriageConfig;
use crate::ensemble::{create_action_queue_item, EnsemblePredictor};
use crate::error::{Result, TriageError};
use crate::mailbox::{execute_action, MailboxActions};
use crate::queue::{ActionQueue, ActionQueueItem, QueueReason, QueueStatus, Transition};
use crate::semantic::{OllamaSemanticClassifier, SemanticClassifier};
use crate::sender_model::{SenderModel, SenderModelStore};
use crate::snapshot::{SnapshotKind, SnapshotStore};
use crate::tier1::StatisticalPredictor;
use crate::trust::{TrustController, TrustOutcome, TrustProfile, TrustStage};
use crate::types::{AIActionType, EmailInput, PredictionResult, SenderObservation};
use crate::undo::{UndoEntry, UndoSink};

/// Events are dropped rather than blocking when nobody drains the channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Event emitted by a triage session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TriageEvent {
    PredictionMade {
        email_id: String,
        action: AIActionType,
        confidence: f64,
        requires_approval: bool,
    },
    AutoExecuted {
        email_id: String,
        action: AIActionType,
        undo_id: String,
    },
    Queued {
        item_id: String,
        email_id: String,
        action: AIActionType,
    },
    QueueItemResolved {
        item_id: String,
        status: QueueStatus,
    },
    ExecutionFailed {
        email_id: String,
        item_id: Option<String>,
        error: TriageError,
    },
    TrustStageChanged {
        from: TrustStage,
        to: TrustStage,
    },
    SenderReset {
        sender_id: String,
    },
    Undone {
        email_id: String,
        action: AIActionType,
    },
}

/// What happened to one processed email
#[derive(Debug, Clone)]
pub enum Disposition {
    AutoExecuted { undo_id: String },
    Queued { item_id: String },
    /// Auto-execution failed; the recommendation went to the queue instead
    QueuedAfterFailure { item_id: String, error: TriageError },
    /// `keep`: nothing to do
    NoAction,
    /// The email was already executed or resolved; nothing was touched
    AlreadyHandled,
}

#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub email_id: String,
    pub prediction: PredictionResult,
    pub disposition: Disposition,
}

/// Result of a bulk approval
#[derive(Debug, Default)]
pub struct BulkApproval {
    pub completed: Vec<ActionQueueItem>,
    /// Approved but the mutation failed; retry with `retry_execution`
    pub failed: Vec<(ActionQueueItem, TriageError)>,
}

pub struct TriageSession {
    user_id: String,
    senders: SenderModelStore,
    trust: Arc<TrustController>,
    predictor: Arc<EnsemblePredictor>,
    queue: ActionQueue,
    mailbox: Arc<dyn MailboxActions>,
    undo: Arc<dyn UndoSink>,
    event_tx: flume::Sender<TriageEvent>,
    event_rx: flume::Receiver<TriageEvent>,
}

impl TriageSession {
    /// Build a session with an injected (or no) semantic classifier.
    /// The configuration is validated first.
    pub fn new(
        user_id: impl Into<String>,
        config: TriageConfig,
        classifier: Option<Arc<dyn SemanticClassifier>>,
        mailbox: Arc<dyn MailboxActions>,
        undo: Arc<dyn UndoSink>,
    ) -> Result<Self> {
        config.validate()?;
        let user_id = user_id.into();

        let trust = Arc::new(TrustController::new(config.trust.clone()));
        let tier1 = StatisticalPredictor::new(config.sender_model.clone(), config.tier1.clone());
        let predictor = Arc::new(EnsemblePredictor::new(
            config.ensemble.clone(),
            tier1,
            classifier,
            Arc::clone(&trust),
        ));
        let (event_tx, event_rx) = flume::bounded(EVENT_CHANNEL_CAPACITY);

        info!(
            "Triage session for {} ready (semantic classifier: {})",
            user_id,
            predictor.has_classifier()
        );

        Ok(Self {
            user_id,
            senders: SenderModelStore::new(config.sender_model),
            trust,
            predictor,
            queue: ActionQueue::new(config.queue),
            mailbox,
            undo,
            event_tx,
            event_rx,
        })
    }

    /// Build a session whose semantic classifier comes from `[semantic]`
    pub fn from_config(
        user_id: impl Into<String>,
        config: TriageConfig,
        mailbox: Arc<dyn MailboxActions>,
        undo: Arc<dyn UndoSink>,
    ) -> Result<Self> {
        let classifier: Option<Arc<dyn SemanticClassifier>> = if config.semantic.enabled {
            let timeout = Duration::from_millis(config.ensemble.llm_timeout_ms);
            Some(Arc::new(OllamaSemanticClassifier::new(
                &config.semantic,
                timeout,
            )?))
        } else {
            None
        };
        Self::new(user_id, config, classifier, mailbox, undo)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn senders(&self) -> &SenderModelStore {
        &self.senders
    }

    pub fn queue(&self) -> &ActionQueue {
        &self.queue
    }

    pub fn predictor(&self) -> &Arc<EnsemblePredictor> {
        &self.predictor
    }

    pub fn trust_profile(&self) -> TrustProfile {
        self.trust.profile(&self.user_id)
    }

    /// Receiver for session events
    pub fn events(&self) -> flume::Receiver<TriageEvent> {
        self.event_rx.clone()
    }

    fn emit(&self, event: TriageEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            debug!("Dropping triage event: {}", e);
        }
    }

    // ========== Processing ==========

    pub async fn process_email(
        &self,
        email: &EmailInput,
        account_id: &str,
    ) -> Result<ProcessOutcome> {
        let model = email.from.as_deref().and_then(|f| self.senders.get(f));
        let prediction = self
            .predictor
            .predict(email, &self.user_id, model.as_ref())
            .await;

        let mut budget = self.trust.batch_cap(&self.user_id);
        Ok(self.dispatch(email, account_id, prediction, &mut budget).await)
    }

    /// Predict a batch concurrently, then execute or queue each email in
    /// input order. At most the stage's batch cap runs without review.
    pub async fn process_batch(
        &self,
        emails: &[EmailInput],
        account_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ProcessOutcome>> {
        let models = self.senders.lookup_for(emails);
        let mut predictions = self
            .predictor
            .predict_batch(emails, &self.user_id, &models, cancel)
            .await?;

        let mut budget = self.trust.batch_cap(&self.user_id);
        let mut seen = HashSet::new();
        let mut outcomes = Vec::with_capacity(predictions.len());

        for email in emails {
            if !seen.insert(email.id.as_str()) {
                continue;
            }
            let Some(prediction) = predictions.remove(&email.id) else {
                continue;
            };
            outcomes.push(self.dispatch(email, account_id, prediction, &mut budget).await);
        }

        let auto = outcomes
            .iter()
            .filter(|o| matches!(o.disposition, Disposition::AutoExecuted { .. }))
            .count();
        info!(
            "Processed batch of {} emails for {}: {} auto-executed",
            outcomes.len(),
            self.user_id,
            auto
        );
        Ok(outcomes)
    }

    async fn dispatch(
        &self,
        email: &EmailInput,
        account_id: &str,
        prediction: PredictionResult,
        budget: &mut usize,
    ) -> ProcessOutcome {
        if self.already_handled(&email.id) {
            debug!("Email {} was already handled, skipping dispatch", email.id);
            return ProcessOutcome {
                email_id: email.id.clone(),
                prediction,
                disposition: Disposition::AlreadyHandled,
            };
        }

        let action = prediction.final_prediction.action;
        self.emit(TriageEvent::PredictionMade {
            email_id: email.id.clone(),
            action,
            confidence: prediction.final_prediction.confidence,
            requires_approval: prediction.final_prediction.requires_approval,
        });

        if action == AIActionType::Keep {
            return ProcessOutcome {
                email_id: email.id.clone(),
                prediction,
                disposition: Disposition::NoAction,
            };
        }

        let mut failure = None;
        if !prediction.final_prediction.requires_approval
            && action.is_mailbox_mutation()
            && *budget > 0
        {
            *budget -= 1;
            match execute_action(self.mailbox.as_ref(), action, account_id, &email.id).await {
                Ok(undo_data) => {
                    let entry = UndoEntry::new(action, &email.id, account_id, &self.user_id, undo_data)
                        .auto_executed(true);
                    let undo_id = entry.id.clone();
                    self.undo.push(entry);
                    self.trust.record_auto_execution(&self.user_id);

                    info!(
                        "Auto-executed {} on {} (confidence {:.2})",
                        action, email.id, prediction.final_prediction.confidence
                    );
                    self.emit(TriageEvent::AutoExecuted {
                        email_id: email.id.clone(),
                        action,
                        undo_id: undo_id.clone(),
                    });
                    return ProcessOutcome {
                        email_id: email.id.clone(),
                        prediction,
                        disposition: Disposition::AutoExecuted { undo_id },
                    };
                }
                Err(e) => {
                    warn!(
                        "Auto-execution of {} on {} failed, queueing for approval: {}",
                        action, email.id, e
                    );
                    self.emit(TriageEvent::ExecutionFailed {
                        email_id: email.id.clone(),
                        item_id: None,
                        error: e.clone(),
                    });
                    failure = Some(e);
                }
            }
        }

        let reason = if failure.is_some() {
            QueueReason::ExecutionFailed
        } else if prediction.final_prediction.requires_approval {
            QueueReason::NeedsApproval
        } else if !action.is_mailbox_mutation() {
            QueueReason::NotExecutable
        } else {
            QueueReason::BatchCapReached
        };
        let item_id = self.enqueue(&prediction, email, account_id, reason);
        let disposition = match failure {
            Some(error) => Disposition::QueuedAfterFailure { item_id, error },
            None => Disposition::Queued { item_id },
        };
        ProcessOutcome {
            email_id: email.id.clone(),
            prediction,
            disposition,
        }
    }

    /// An undoable action on the email exists, or its newest queue item has
    /// left `pending`
    fn already_handled(&self, email_id: &str) -> bool {
        self.undo.contains_email(email_id)
            || self
                .queue
                .find_by_email(email_id)
                .map_or(false, |item| !item.is_pending())
    }

    /// Queue a recommendation; returns the id of the new or already pending item
    fn enqueue(
        &self,
        prediction: &PredictionResult,
        email: &EmailInput,
        account_id: &str,
        reason: QueueReason,
    ) -> String {
        let item = create_action_queue_item(prediction, email, account_id).with_reason(reason);
        let item_id = item.id.clone();
        let action = item.effective_action();

        if self.queue.add_item(item) {
            self.emit(TriageEvent::Queued {
                item_id: item_id.clone(),
                email_id: email.id.clone(),
                action,
            });
            return item_id;
        }

        self.queue
            .pending()
            .into_iter()
            .find(|i| i.email_id == email.id)
            .map(|i| i.id)
            .unwrap_or(item_id)
    }

    // ========== Dispositions ==========

    /// Approve a pending item and execute it. A repeated approval is a no-op.
    pub async fn approve(&self, item_id: &str) -> Result<ActionQueueItem> {
        let transition = self
            .queue
            .update_status(item_id, QueueStatus::Approved, None)?;
        let item = match transition {
            Transition::Applied(item) => item,
            noop => return Ok(noop.into_item()),
        };

        self.resolved(&item, TrustOutcome::Approved);
        self.execute_item(&item.id).await
    }

    /// Reject a pending item. Nothing is executed.
    pub fn reject(&self, item_id: &str) -> Result<ActionQueueItem> {
        let transition = self
            .queue
            .update_status(item_id, QueueStatus::Rejected, None)?;
        let item = match transition {
            Transition::Applied(item) => item,
            noop => return Ok(noop.into_item()),
        };

        self.resolved(&item, TrustOutcome::Rejected);
        Ok(item)
    }

    /// Approve a pending item with a different action and execute that
    pub async fn modify(&self, item_id: &str, action: AIActionType) -> Result<ActionQueueItem> {
        let transition = self.queue.modify(item_id, action)?;
        let item = match transition {
            Transition::Applied(item) => item,
            noop => return Ok(noop.into_item()),
        };

        self.resolved(&item, TrustOutcome::Modified);
        self.execute_item(&item.id).await
    }

    /// Approve and execute every pending item at or above `min_confidence`
    pub async fn approve_all_above(&self, min_confidence: f64) -> BulkApproval {
        let approved = self
            .queue
            .approve_all(|i| i.prediction.final_prediction.confidence >= min_confidence);

        let mut report = BulkApproval::default();
        for item in approved {
            self.resolved(&item, TrustOutcome::Approved);
            match self.execute_item(&item.id).await {
                Ok(done) => report.completed.push(done),
                Err(e) => report.failed.push((item, e)),
            }
        }
        report
    }

    /// Retry the mutation of an approved item whose execution failed.
    /// Conflicts while another call is still executing the item.
    pub async fn retry_execution(&self, item_id: &str) -> Result<ActionQueueItem> {
        self.execute_item(item_id).await
    }

    fn resolved(&self, item: &ActionQueueItem, outcome: TrustOutcome) {
        self.emit(TriageEvent::QueueItemResolved {
            item_id: item.id.clone(),
            status: item.status,
        });

        let update = self.trust.update_trust_from_action(&self.user_id, outcome);
        if let Some((from, to)) = update.stage_change {
            self.emit(TriageEvent::TrustStageChanged { from, to });
        }
    }

    /// Run the mutation of an approved item, then mark it completed.
    /// The execution claim is held until the item is completed or the
    /// mutation failed.
    async fn execute_item(&self, item_id: &str) -> Result<ActionQueueItem> {
        let Some(claim) = self.queue.claim_execution(item_id)? else {
            return self
                .queue
                .get(item_id)
                .ok_or_else(|| TriageError::NotFound(format!("Queue item {}", item_id)));
        };
        let item = claim.item().clone();
        let action = item.effective_action();

        if action.is_mailbox_mutation() {
            let undo_data =
                match execute_action(self.mailbox.as_ref(), action, &item.account_id, &item.email_id)
                    .await
                {
                    Ok(data) => data,
                    Err(e) => {
                        warn!("Executing {} for queue item {} failed: {}", action, item.id, e);
                        self.emit(TriageEvent::ExecutionFailed {
                            email_id: item.email_id.clone(),
                            item_id: Some(item.id.clone()),
                            error: e.clone(),
                        });
                        return Err(e);
                    }
                };

            self.undo.push(UndoEntry::new(
                action,
                &item.email_id,
                &item.account_id,
                &self.user_id,
                undo_data,
            ));
        }

        let done = self
            .queue
            .update_status(&item.id, QueueStatus::Completed, Some(Utc::now()))?
            .into_item();
        drop(claim);
        self.emit(TriageEvent::QueueItemResolved {
            item_id: done.id.clone(),
            status: done.status,
        });
        Ok(done)
    }

    // ========== Sender model ==========

    /// Feed what the user actually did with a message from `sender`
    pub fn observe(&self, sender: &str, observation: &SenderObservation) -> Result<SenderModel> {
        let model = self.senders.update(sender, observation)?;
        self.predictor.invalidate_sender(&model.sender_id);
        Ok(model)
    }

    pub fn set_vip(&self, sender: &str, vip: bool) -> Result<SenderModel> {
        let model = self.senders.set_vip(sender, vip)?;
        self.predictor.invalidate_sender(&model.sender_id);
        Ok(model)
    }

    pub fn reset_sender(&self, sender: &str) -> Option<SenderModel> {
        let model = self.senders.reset(sender)?;
        self.predictor.invalidate_sender(&model.sender_id);
        self.emit(TriageEvent::SenderReset {
            sender_id: model.sender_id.clone(),
        });
        Some(model)
    }

    // ========== Undo ==========

    /// Reverse the most recent executed action. Undoing something that ran
    /// without review counts as a rejection.
    pub async fn undo_latest(&self) -> Result<Option<UndoEntry>> {
        let Some(entry) = self.undo.undo_latest() else {
            return Ok(None);
        };

        if let Err(e) = self.mailbox.revert(&entry).await {
            warn!("Reverting {} on {} failed: {}", entry.action_type, entry.email_id, e);
            self.undo.push(entry);
            return Err(e);
        }

        info!("Undid {} on {}", entry.action_type, entry.email_id);
        self.predictor.invalidate(&entry.email_id);
        if entry.auto_executed {
            let update = self
                .trust
                .update_trust_from_action(&self.user_id, TrustOutcome::Rejected);
            if let Some((from, to)) = update.stage_change {
                self.emit(TriageEvent::TrustStageChanged { from, to });
            }
        }
        self.emit(TriageEvent::Undone {
            email_id: entry.email_id.clone(),
            action: entry.action_type,
        });
        Ok(Some(entry))
    }

    // ========== Persistence ==========

    pub fn save(&self, store: &SnapshotStore) -> Result<()> {
        store.save(&self.user_id, SnapshotKind::SenderModels, &self.senders.snapshot())?;
        store.save(&self.user_id, SnapshotKind::TrustProfile, &self.trust_profile())?;
        store.save(&self.user_id, SnapshotKind::ActionQueue, &self.queue.snapshot())?;
        debug!("Saved triage state for {}", self.user_id);
        Ok(())
    }

    /// Restore whatever was saved for this user; missing surfaces stay empty
    pub fn load(&self, store: &SnapshotStore) -> Result<()> {
        if let Some(models) = store.load::<Vec<SenderModel>>(&self.user_id, SnapshotKind::SenderModels)? {
            self.senders.restore(models);
        }
        if let Some(profile) = store.load::<TrustProfile>(&self.user_id, SnapshotKind::TrustProfile)? {
            self.trust.restore(vec![profile]);
        }
        if let Some(items) = store.load::<Vec<ActionQueueItem>>(&self.user_id, SnapshotKind::ActionQueue)? {
            self.queue.restore(items);
        }
        self.predictor.clear_cache();
        info!("Loaded triage state for {}", self.user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::undo::InMemoryUndoStack;
    use async_trait::async_trait;

    struct NullMailbox;

    #[async_trait]
    impl MailboxActions for NullMailbox {
        async fn archive(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        async fn delete(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        async fn star(&self, _: &str, _: &str, _: bool) -> Result<()> {
            Ok(())
        }
        async fn mark_read(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        async fn mark_unread(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        async fn unsubscribe(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        async fn revert(&self, _: &UndoEntry) -> Result<()> {
            Ok(())
        }
    }

    fn session() -> TriageSession {
        let config = TriageConfig::default();
        let undo = Arc::new(InMemoryUndoStack::new(&config.undo));
        TriageSession::new("u1", config, None, Arc::new(NullMailbox), undo).unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = TriageConfig::default();
        config.ensemble.max_concurrent_llm = 0;
        let undo = Arc::new(InMemoryUndoStack::new(&config.undo));
        assert!(TriageSession::new("u1", config, None, Arc::new(NullMailbox), undo).is_err());
    }

    #[tokio::test]
    async fn test_keep_needs_no_action() {
        let s = session();
        let email = EmailInput::new("e1", "friend@example.com", "Dinner?");
        let outcome = s.process_email(&email, "acct").await.unwrap();
        assert!(matches!(outcome.disposition, Disposition::NoAction));
        assert!(s.queue().is_empty());
    }

    #[tokio::test]
    async fn test_training_wheels_queues_everything() {
        let s = session();
        let email = EmailInput::new("e2", "noreply@service.io", "Your receipt");
        let outcome = s.process_email(&email, "acct").await.unwrap();
        assert!(matches!(outcome.disposition, Disposition::Queued { .. }));
        assert_eq!(s.queue().pending().len(), 1);

        let events: Vec<TriageEvent> = s.events().try_iter().collect();
        assert!(matches!(events[0], TriageEvent::PredictionMade { .. }));
        assert!(matches!(events[1], TriageEvent::Queued { .. }));
    }

    #[tokio::test]
    async fn test_observe_invalidates_cached_prediction() {
        let s = session();
        let email = EmailInput::new("e3", "a@b.com", "Hi");
        let first = s.process_email(&email, "acct").await.unwrap();
        assert_eq!(s.predictor().cached_len(), 1);

        s.observe(
            "a@b.com",
            &SenderObservation::new(crate::types::ObservedAction::Archived, Utc::now()),
        )
        .unwrap();
        assert_eq!(s.predictor().cached_len(), 0);

        let second = s.process_email(&email, "acct").await.unwrap();
        assert_ne!(
            first.prediction.prediction_id,
            second.prediction.prediction_id
        );
    }
}
