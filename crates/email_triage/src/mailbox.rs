//! Mailbox mutation seam
//!
//! The engine never talks to a mail server itself. The host application
//! implements [`MailboxActions`] on top of its sync engine.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::error::{Result, TriageError};
use crate::types::AIActionType;
use crate::undo::UndoEntry;

/// Mutations the engine may ask for. Calls should be safe to retry.
#[async_trait]
pub trait MailboxActions: Send + Sync {
    async fn archive(&self, account_id: &str, email_id: &str) -> Result<()>;

    async fn delete(&self, account_id: &str, email_id: &str) -> Result<()>;

    async fn star(&self, account_id: &str, email_id: &str, starred: bool) -> Result<()>;

    async fn mark_read(&self, account_id: &str, email_id: &str) -> Result<()>;

    async fn mark_unread(&self, account_id: &str, email_id: &str) -> Result<()>;

    async fn unsubscribe(&self, account_id: &str, email_id: &str) -> Result<()>;

    /// Reverse a previously executed action
    async fn revert(&self, entry: &UndoEntry) -> Result<()>;
}

/// Run `action` against the mailbox and return the data needed to undo it.
///
/// Only mailbox mutations can be executed; anything else is an
/// `InvalidInput` error and nothing is touched.
pub async fn execute_action(
    mailbox: &dyn MailboxActions,
    action: AIActionType,
    account_id: &str,
    email_id: &str,
) -> Result<serde_json::Value> {
    debug!("Executing {} on {} ({})", action, email_id, account_id);

    let inverse = match action {
        AIActionType::Archive => {
            mailbox.archive(account_id, email_id).await?;
            "move_to_inbox"
        }
        AIActionType::Delete => {
            mailbox.delete(account_id, email_id).await?;
            "restore_from_trash"
        }
        AIActionType::Star => {
            mailbox.star(account_id, email_id, true).await?;
            "unstar"
        }
        AIActionType::Unsubscribe => {
            mailbox.unsubscribe(account_id, email_id).await?;
            "resubscribe_manually"
        }
        AIActionType::Keep | AIActionType::Snooze | AIActionType::Reply => {
            return Err(TriageError::InvalidInput(format!(
                "{} is not an executable mailbox action",
                action
            )));
        }
    };

    Ok(json!({
        "action": action.as_str(),
        "account_id": account_id,
        "email_id": email_id,
        "inverse": inverse,
    }))
}
