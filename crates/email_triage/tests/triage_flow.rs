use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use email_triage::queue::QueueReason;
use email_triage::session::BulkApproval;
use email_triage::snapshot::SnapshotStore;
use email_triage::{
    AIActionType, Disposition, EmailInput, InMemoryUndoStack, MailboxActions, ObservedAction,
    QueueStatus, Result, SenderObservation, TriageConfig, TriageError, TriageEvent, TriageSession,
    TrustStage, UndoEntry, UndoSink,
};

const USER: &str = "user-1";
const ACCOUNT: &str = "acct-1";
const DIGEST: &str = "Weekly Digest <digest@news.example>";

#[derive(Default)]
struct FakeMailbox {
    calls: Mutex<Vec<String>>,
    fail: AtomicBool,
    /// Yield to the runtime before answering, like a real server round trip
    slow: AtomicBool,
}

impl FakeMailbox {
    async fn mutate(&self, call: String) -> Result<()> {
        if self.slow.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(TriageError::Mailbox("server unavailable".into()));
        }
        self.calls.lock().unwrap().push(call);
        Ok(())
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailboxActions for FakeMailbox {
    async fn archive(&self, _account_id: &str, email_id: &str) -> Result<()> {
        self.mutate(format!("archive:{}", email_id)).await
    }
    async fn delete(&self, _account_id: &str, email_id: &str) -> Result<()> {
        self.mutate(format!("delete:{}", email_id)).await
    }
    async fn star(&self, _account_id: &str, email_id: &str, starred: bool) -> Result<()> {
        self.mutate(format!("star:{}:{}", email_id, starred)).await
    }
    async fn mark_read(&self, _account_id: &str, email_id: &str) -> Result<()> {
        self.mutate(format!("read:{}", email_id)).await
    }
    async fn mark_unread(&self, _account_id: &str, email_id: &str) -> Result<()> {
        self.mutate(format!("unread:{}", email_id)).await
    }
    async fn unsubscribe(&self, _account_id: &str, email_id: &str) -> Result<()> {
        self.mutate(format!("unsubscribe:{}", email_id)).await
    }
    async fn revert(&self, entry: &UndoEntry) -> Result<()> {
        self.mutate(format!("revert:{}", entry.email_id)).await
    }
}

fn session(mailbox: Arc<FakeMailbox>) -> TriageSession {
    session_with_undo(mailbox).0
}

fn session_with_undo(mailbox: Arc<FakeMailbox>) -> (TriageSession, Arc<InMemoryUndoStack>) {
    let config = TriageConfig::default();
    let undo = Arc::new(InMemoryUndoStack::new(&config.undo));
    let sink = Arc::clone(&undo) as Arc<dyn UndoSink>;
    let s = TriageSession::new(USER, config, None, mailbox, sink).unwrap();
    (s, undo)
}

/// Teach the engine that the digest sender always gets archived
fn learn_digest_sender(s: &TriageSession) {
    for _ in 0..60 {
        s.observe(
            DIGEST,
            &SenderObservation::new(ObservedAction::Archived, Utc::now()),
        )
        .unwrap();
    }
}

fn digest_email(id: &str) -> EmailInput {
    EmailInput::new(id, DIGEST, "Your weekly digest")
}

/// Queue and approve 20 low-confidence recommendations
async fn earn_building_confidence(s: &TriageSession) {
    for i in 0..20 {
        let email = EmailInput::new(
            format!("receipt-{}", i),
            format!("noreply@shop{}.example", i),
            "Your receipt",
        );
        let outcome = s.process_email(&email, ACCOUNT).await.unwrap();
        let Disposition::Queued { item_id } = outcome.disposition else {
            panic!("expected queued, got {:?}", outcome.disposition);
        };
        let done = s.approve(&item_id).await.unwrap();
        assert_eq!(done.status, QueueStatus::Completed);
    }
    assert_eq!(s.trust_profile().trust_stage, TrustStage::BuildingConfidence);
}

#[tokio::test]
async fn test_autonomy_is_earned_through_approvals() {
    let mailbox = Arc::new(FakeMailbox::default());
    let s = session(Arc::clone(&mailbox));
    let events = s.events();
    learn_digest_sender(&s);

    // Training wheels: confident, but nothing runs unreviewed
    let first = s.process_email(&digest_email("d-0"), ACCOUNT).await.unwrap();
    assert_eq!(first.prediction.final_prediction.action, AIActionType::Archive);
    assert!(!first.prediction.final_prediction.requires_approval);
    let Disposition::Queued { item_id } = &first.disposition else {
        panic!("expected queued, got {:?}", first.disposition);
    };
    assert_eq!(
        s.queue().get(item_id).unwrap().reason,
        QueueReason::BatchCapReached
    );

    earn_building_confidence(&s).await;
    let profile = s.trust_profile();
    assert_eq!(profile.total_interactions, 20);
    assert_eq!(profile.approved_actions, 20);
    assert_eq!(profile.trust_score, 1.0);

    let auto = s.process_email(&digest_email("d-1"), ACCOUNT).await.unwrap();
    assert!(matches!(auto.disposition, Disposition::AutoExecuted { .. }));
    assert!(mailbox.calls().contains(&"archive:d-1".to_string()));
    assert_eq!(s.trust_profile().auto_executed_actions, 1);

    let drained: Vec<TriageEvent> = events.try_iter().collect();
    assert!(drained.iter().any(|e| matches!(
        e,
        TriageEvent::TrustStageChanged {
            from: TrustStage::TrainingWheels,
            to: TrustStage::BuildingConfidence
        }
    )));

    // Undoing an unreviewed action counts against trust
    let undone = s.undo_latest().await.unwrap().unwrap();
    assert_eq!(undone.email_id, "d-1");
    assert!(undone.auto_executed);
    assert!(mailbox.calls().contains(&"revert:d-1".to_string()));
    let profile = s.trust_profile();
    assert_eq!(profile.rejected_actions, 1);
    assert_eq!(profile.total_interactions, 21);
}

#[tokio::test]
async fn test_mailbox_failure_never_completes_an_item() {
    let mailbox = Arc::new(FakeMailbox::default());
    let s = session(Arc::clone(&mailbox));
    learn_digest_sender(&s);
    earn_building_confidence(&s).await;

    mailbox.fail.store(true, Ordering::SeqCst);
    let outcome = s.process_email(&digest_email("d-2"), ACCOUNT).await.unwrap();
    let Disposition::QueuedAfterFailure { item_id, error } = outcome.disposition else {
        panic!("expected fallback to queue, got {:?}", outcome.disposition);
    };
    assert!(error.is_recoverable());
    assert_eq!(s.queue().get(&item_id).unwrap().status, QueueStatus::Pending);

    let err = s.approve(&item_id).await.unwrap_err();
    assert!(matches!(err, TriageError::Mailbox(_)));
    let item = s.queue().get(&item_id).unwrap();
    assert_eq!(item.status, QueueStatus::Approved);
    assert!(item.executed_at.is_none());

    mailbox.fail.store(false, Ordering::SeqCst);
    let done = s.retry_execution(&item_id).await.unwrap();
    assert_eq!(done.status, QueueStatus::Completed);
    assert!(done.executed_at.is_some());
    assert!(done.resolved_at.is_some());
}

#[tokio::test]
async fn test_racing_approvals_count_once() {
    let mailbox = Arc::new(FakeMailbox::default());
    let s = session(Arc::clone(&mailbox));

    let email = EmailInput::new("r-1", "noreply@shop.example", "Your receipt");
    let outcome = s.process_email(&email, ACCOUNT).await.unwrap();
    let Disposition::Queued { item_id } = outcome.disposition else {
        panic!("expected queued");
    };

    let (a, b) = tokio::join!(s.approve(&item_id), s.approve(&item_id));
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(s.trust_profile().total_interactions, 1);
    assert_eq!(
        mailbox
            .calls()
            .iter()
            .filter(|c| c.as_str() == "archive:r-1")
            .count(),
        1
    );

    let err = s.reject(&item_id).unwrap_err();
    assert!(matches!(err, TriageError::Conflict(_)));
    assert_eq!(s.trust_profile().total_interactions, 1);
}

#[tokio::test]
async fn test_reject_and_modify() {
    let mailbox = Arc::new(FakeMailbox::default());
    let s = session(Arc::clone(&mailbox));

    let a = EmailInput::new("m-1", "noreply@shop.example", "Your receipt");
    let b = EmailInput::new("m-2", "noreply@bank.example", "Your receipt");
    let cancel = CancellationToken::new();
    let outcomes = s.process_batch(&[a, b], ACCOUNT, &cancel).await.unwrap();
    let ids: Vec<String> = outcomes
        .iter()
        .map(|o| match &o.disposition {
            Disposition::Queued { item_id } => item_id.clone(),
            other => panic!("expected queued, got {:?}", other),
        })
        .collect();

    let rejected = s.reject(&ids[0]).unwrap();
    assert_eq!(rejected.status, QueueStatus::Rejected);

    let modified = s.modify(&ids[1], AIActionType::Star).await.unwrap();
    assert_eq!(modified.status, QueueStatus::Completed);
    assert_eq!(modified.effective_action(), AIActionType::Star);

    assert_eq!(mailbox.calls(), vec!["star:m-2:true".to_string()]);
    let profile = s.trust_profile();
    assert_eq!(profile.total_interactions, 2);
    assert_eq!(profile.approved_actions, 0);
    assert_eq!(profile.rejected_actions, 1);
    assert_eq!(profile.modified_actions, 1);
}

#[tokio::test]
async fn test_batch_respects_auto_execution_cap() {
    let mailbox = Arc::new(FakeMailbox::default());
    let s = session(Arc::clone(&mailbox));
    learn_digest_sender(&s);
    earn_building_confidence(&s).await;

    let emails: Vec<EmailInput> = (0..15).map(|i| digest_email(&format!("b-{}", i))).collect();
    let cancel = CancellationToken::new();
    let outcomes = s.process_batch(&emails, ACCOUNT, &cancel).await.unwrap();

    assert_eq!(outcomes.len(), 15);
    let auto = outcomes
        .iter()
        .filter(|o| matches!(o.disposition, Disposition::AutoExecuted { .. }))
        .count();
    let queued = outcomes
        .iter()
        .filter(|o| matches!(o.disposition, Disposition::Queued { .. }))
        .count();
    assert_eq!(auto, 10);
    assert_eq!(queued, 5);

    let BulkApproval { completed, failed } = s.approve_all_above(0.9).await;
    assert_eq!(completed.len(), 5);
    assert!(failed.is_empty());
    assert!(s.queue().pending().is_empty());
}

#[tokio::test]
async fn test_state_survives_a_restart() {
    let store = SnapshotStore::in_memory().unwrap();

    let mailbox = Arc::new(FakeMailbox::default());
    let s = session(Arc::clone(&mailbox));
    learn_digest_sender(&s);
    earn_building_confidence(&s).await;
    s.process_email(
        &EmailInput::new("p-1", "noreply@later.example", "Your receipt"),
        ACCOUNT,
    )
    .await
    .unwrap();
    s.save(&store).unwrap();

    let restarted = session(Arc::clone(&mailbox));
    restarted.load(&store).unwrap();

    let profile = restarted.trust_profile();
    assert_eq!(profile.trust_stage, TrustStage::BuildingConfidence);
    assert_eq!(profile.total_interactions, 20);
    assert!((profile.auto_approve_threshold - 0.85).abs() < 1e-9);

    let digest = restarted.senders().get(DIGEST).unwrap();
    assert_eq!(digest.total_emails, 60);
    assert_eq!(digest.archived_emails, 60);

    let pending = restarted.queue().pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].email_id, "p-1");
}

#[tokio::test]
async fn test_retry_while_approving_executes_once() {
    let mailbox = Arc::new(FakeMailbox::default());
    let (s, undo) = session_with_undo(Arc::clone(&mailbox));

    let email = EmailInput::new("x1", "noreply@shop.example", "Your receipt");
    let outcome = s.process_email(&email, ACCOUNT).await.unwrap();
    let Disposition::Queued { item_id } = outcome.disposition else {
        panic!("expected queued");
    };

    mailbox.slow.store(true, Ordering::SeqCst);
    let (approved, retried) = tokio::join!(s.approve(&item_id), s.retry_execution(&item_id));

    assert_eq!(approved.unwrap().status, QueueStatus::Completed);
    assert!(matches!(retried, Err(TriageError::Conflict(_))));
    assert_eq!(mailbox.calls(), vec!["archive:x1".to_string()]);
    assert_eq!(undo.len(), 1);

    // Once completed, a retry is a harmless no-op
    let again = s.retry_execution(&item_id).await.unwrap();
    assert_eq!(again.status, QueueStatus::Completed);
    assert_eq!(mailbox.calls().len(), 1);
}

#[tokio::test]
async fn test_reprocessing_a_handled_email_touches_nothing() {
    let mailbox = Arc::new(FakeMailbox::default());
    let (s, undo) = session_with_undo(Arc::clone(&mailbox));
    learn_digest_sender(&s);
    earn_building_confidence(&s).await;

    let first = s.process_email(&digest_email("d-9"), ACCOUNT).await.unwrap();
    assert!(matches!(first.disposition, Disposition::AutoExecuted { .. }));
    let undo_entries = undo.len();

    let again = s.process_email(&digest_email("d-9"), ACCOUNT).await.unwrap();
    assert!(matches!(again.disposition, Disposition::AlreadyHandled));
    let archives = mailbox
        .calls()
        .iter()
        .filter(|c| c.as_str() == "archive:d-9")
        .count();
    assert_eq!(archives, 1);
    assert_eq!(undo.len(), undo_entries);
    assert_eq!(s.trust_profile().auto_executed_actions, 1);

    // Same for an email whose queue item was rejected
    let receipt = EmailInput::new("r-9", "noreply@shop.example", "Your receipt");
    let outcome = s.process_email(&receipt, ACCOUNT).await.unwrap();
    let Disposition::Queued { item_id } = outcome.disposition else {
        panic!("expected queued, got {:?}", outcome.disposition);
    };
    s.reject(&item_id).unwrap();
    let again = s.process_email(&receipt, ACCOUNT).await.unwrap();
    assert!(matches!(again.disposition, Disposition::AlreadyHandled));
    assert!(s.queue().pending().iter().all(|i| i.email_id != "r-9"));
}
