//! eddie.chat email triage decision engine
//!
//! For every incoming message the engine predicts what the user would do
//! with it, decides whether that can happen automatically or needs review,
//! and earns more autonomy as its recommendations are confirmed.
//!
//! ```text
//! email ─► sender model ─► Tier-1 ─► (Tier-3 if unsure) ─► ensemble
//!                                                            │
//!                          trust threshold ──────────────────┤
//!                                                            ▼
//!                                   auto-execute + undo  or  action queue
//!                                                            │
//!                          trust profile ◄── approve/reject/modify
//! ```
//!
//! [`session::TriageSession`] wires the pieces together for one user.

pub mod config;
pub mod ensemble;
pub mod error;
pub mod mailbox;
pub mod normalize;
pub mod queue;
pub mod rules;
pub mod semantic;
pub mod sender_model;
pub mod session;
pub mod snapshot;
pub mod tier1;
pub mod trust;
pub mod types;
pub mod undo;

pub use config::TriageConfig;
pub use ensemble::{create_action_queue_item, EnsemblePredictor};
pub use error::{Result, TriageError};
pub use mailbox::MailboxActions;
pub use queue::{ActionQueue, ActionQueueItem, QueueStatus};
pub use semantic::{SemanticClassifier, SemanticRequest, SemanticResponse};
pub use sender_model::{SenderModel, SenderModelStore};
pub use session::{Disposition, ProcessOutcome, TriageEvent, TriageSession};
pub use snapshot::SnapshotStore;
pub use tier1::StatisticalPredictor;
pub use trust::{TrustController, TrustOutcome, TrustProfile, TrustStage};
pub use types::{AIActionType, EmailInput, ObservedAction, PredictionResult, SenderObservation};
pub use undo::{InMemoryUndoStack, UndoEntry, UndoSink};

use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber for hosts that do not set up tracing themselves.
/// `RUST_LOG` wins when set.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("email_triage=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });

    // A subscriber may already be installed by the host
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
