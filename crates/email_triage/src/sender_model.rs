//! Sender Behavior Model
//!
//! Per-sender rolling statistics with time decay. These are the data
//! substrate for Tier-1 prediction.
//!
//! Updates for one sender are serialized through that sender's own mutex;
//! updates for different senders never contend beyond the short map lookup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info};

use crate::config::SenderModelConfig;
use crate::error::{Result, TriageError};
use crate::normalize::SenderIdentity;
use crate::types::{EmailInput, ObservedAction, SenderObservation};

/// Lower bound keeping the decayed weight inside (0, 1]
const MIN_DECAYED_WEIGHT: f64 = 1e-6;

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Rolling statistics for one sender
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderModel {
    pub sender_id: String,
    pub sender_email: String,
    pub sender_domain: String,

    pub total_emails: u64,
    pub responded_emails: u64,
    pub archived_emails: u64,
    pub deleted_emails: u64,
    pub starred_emails: u64,
    pub ignored_emails: u64,

    pub avg_read_time_seconds: f64,
    pub avg_response_time_seconds: f64,
    #[serde(default)]
    pub read_time_samples: u64,
    #[serde(default)]
    pub response_time_samples: u64,

    pub importance_score: f64,
    pub urgency_score: f64,
    pub decayed_weight: f64,

    pub first_seen: DateTime<Utc>,
    pub last_interaction: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub is_vip: bool,
}

/// Exponential recency factor `exp(-Δt / half_life)` for a gap in days
pub fn decay_factor(elapsed_days: f64, half_life_days: f64) -> f64 {
    if half_life_days <= 0.0 || elapsed_days <= 0.0 {
        return 1.0;
    }
    (-elapsed_days / half_life_days).exp()
}

/// Fractional days from `from` to `to`, never negative
pub fn elapsed_days(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds().max(0) as f64) / MILLIS_PER_DAY
}

impl SenderModel {
    pub fn new(identity: SenderIdentity, at: DateTime<Utc>) -> Self {
        Self {
            sender_id: identity.sender_id,
            sender_email: identity.email,
            sender_domain: identity.domain,
            total_emails: 0,
            responded_emails: 0,
            archived_emails: 0,
            deleted_emails: 0,
            starred_emails: 0,
            ignored_emails: 0,
            avg_read_time_seconds: 0.0,
            avg_response_time_seconds: 0.0,
            read_time_samples: 0,
            response_time_samples: 0,
            importance_score: 0.5,
            urgency_score: 0.0,
            decayed_weight: 1.0,
            first_seen: at,
            last_interaction: at,
            last_updated: at,
            is_vip: false,
        }
    }

    fn ratio(&self, count: u64) -> f64 {
        if self.total_emails == 0 {
            return 0.0;
        }
        (count as f64 / self.total_emails as f64).clamp(0.0, 1.0)
    }

    pub fn response_rate(&self) -> f64 {
        self.ratio(self.responded_emails)
    }

    pub fn archive_rate(&self) -> f64 {
        self.ratio(self.archived_emails)
    }

    pub fn delete_rate(&self) -> f64 {
        self.ratio(self.deleted_emails)
    }

    pub fn star_rate(&self) -> f64 {
        self.ratio(self.starred_emails)
    }

    pub fn ignore_rate(&self) -> f64 {
        self.ratio(self.ignored_emails)
    }

    pub fn rate(&self, action: ObservedAction) -> f64 {
        match action {
            ObservedAction::Responded => self.response_rate(),
            ObservedAction::Archived => self.archive_rate(),
            ObservedAction::Deleted => self.delete_rate(),
            ObservedAction::Starred => self.star_rate(),
            ObservedAction::Ignored => self.ignore_rate(),
        }
    }

    /// Decayed weight carried forward to `at` without mutating the model.
    pub fn weight_at(&self, at: DateTime<Utc>, half_life_days: f64) -> f64 {
        let factor = decay_factor(elapsed_days(self.last_updated, at), half_life_days);
        (self.decayed_weight * factor).clamp(MIN_DECAYED_WEIGHT, 1.0)
    }

    /// Fold one observation into the statistics.
    pub fn apply(&mut self, observation: &SenderObservation, config: &SenderModelConfig) {
        let gap = elapsed_days(self.last_updated, observation.at);
        self.decayed_weight =
            decay_factor(gap, config.decay_half_life_days).clamp(MIN_DECAYED_WEIGHT, 1.0);

        match observation.action {
            ObservedAction::Responded => self.responded_emails += 1,
            ObservedAction::Archived => self.archived_emails += 1,
            ObservedAction::Deleted => self.deleted_emails += 1,
            ObservedAction::Starred => self.starred_emails += 1,
            ObservedAction::Ignored => self.ignored_emails += 1,
        }
        self.total_emails += 1;

        if let Some(seconds) = observation.read_time_seconds.filter(|s| *s >= 0.0) {
            self.read_time_samples += 1;
            self.avg_read_time_seconds +=
                (seconds - self.avg_read_time_seconds) / self.read_time_samples as f64;
        }
        if let Some(seconds) = observation.response_time_seconds.filter(|s| *s >= 0.0) {
            self.response_time_samples += 1;
            self.avg_response_time_seconds +=
                (seconds - self.avg_response_time_seconds) / self.response_time_samples as f64;
        }

        // History keeps more of its say the more (and the more recently) we have seen
        let history = self.decayed_weight * (1.0 - 1.0 / self.total_emails as f64);
        self.importance_score = (self.importance_score * history
            + importance_signal(observation.action) * (1.0 - history))
            .clamp(0.0, 1.0);
        if let Some(signal) = urgency_signal(observation) {
            self.urgency_score =
                (self.urgency_score * history + signal * (1.0 - history)).clamp(0.0, 1.0);
        }

        if observation.at > self.last_interaction {
            self.last_interaction = observation.at;
        }
        if observation.at > self.last_updated {
            self.last_updated = observation.at;
        }

        if !self.is_vip
            && self.total_emails >= config.min_emails_for_confidence
            && self.importance_score >= config.vip_importance_threshold
        {
            info!(
                sender_id = %self.sender_id,
                importance = self.importance_score,
                "Sender crossed VIP importance threshold"
            );
            self.is_vip = true;
        }
    }
}

fn importance_signal(action: ObservedAction) -> f64 {
    match action {
        ObservedAction::Responded => 1.0,
        ObservedAction::Starred => 1.0,
        ObservedAction::Archived => 0.3,
        ObservedAction::Ignored => 0.1,
        ObservedAction::Deleted => 0.0,
    }
}

fn urgency_signal(observation: &SenderObservation) -> Option<f64> {
    match observation.response_time_seconds {
        Some(s) if s < 3_600.0 => Some(1.0),
        Some(s) if s < 86_400.0 => Some(0.6),
        Some(_) => Some(0.2),
        None if observation.action == ObservedAction::Responded => Some(0.5),
        None => None,
    }
}

/// Thread-safe store of sender models for one user
pub struct SenderModelStore {
    config: SenderModelConfig,
    models: RwLock<HashMap<String, Arc<Mutex<SenderModel>>>>,
}

impl SenderModelStore {
    pub fn new(config: SenderModelConfig) -> Self {
        Self {
            config,
            models: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SenderModelConfig {
        &self.config
    }

    fn entry(&self, identity: &SenderIdentity, at: DateTime<Utc>) -> Arc<Mutex<SenderModel>> {
        {
            let models = self.models.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(model) = models.get(&identity.sender_id) {
                return model.clone();
            }
        }

        let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
        models
            .entry(identity.sender_id.clone())
            .or_insert_with(|| {
                debug!(sender_id = %identity.sender_id, "Creating sender model");
                Arc::new(Mutex::new(SenderModel::new(identity.clone(), at)))
            })
            .clone()
    }

    fn existing(&self, sender: &str) -> Option<Arc<Mutex<SenderModel>>> {
        let identity = SenderIdentity::parse(sender)?;
        let models = self.models.read().unwrap_or_else(PoisonError::into_inner);
        models.get(&identity.sender_id).cloned()
    }

    /// Record an observed terminal action; creates the model on first sight.
    pub fn update(&self, sender: &str, observation: &SenderObservation) -> Result<SenderModel> {
        let identity = SenderIdentity::parse(sender).ok_or_else(|| {
            TriageError::InvalidInput(format!("Unparseable sender address: {:?}", sender))
        })?;
        let entry = self.entry(&identity, observation.at);
        let mut model = entry.lock().unwrap_or_else(PoisonError::into_inner);
        model.apply(observation, &self.config);
        debug!(
            sender_id = %model.sender_id,
            action = ?observation.action,
            total = model.total_emails,
            "Sender model updated"
        );
        Ok(model.clone())
    }

    pub fn get(&self, sender: &str) -> Option<SenderModel> {
        self.existing(sender)
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    pub fn get_by_id(&self, sender_id: &str) -> Option<SenderModel> {
        let models = self.models.read().unwrap_or_else(PoisonError::into_inner);
        models
            .get(sender_id)
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    /// Explicit user VIP flag. Creates the model if the sender is new.
    pub fn set_vip(&self, sender: &str, vip: bool) -> Result<SenderModel> {
        let identity = SenderIdentity::parse(sender).ok_or_else(|| {
            TriageError::InvalidInput(format!("Unparseable sender address: {:?}", sender))
        })?;
        let entry = self.entry(&identity, Utc::now());
        let mut model = entry.lock().unwrap_or_else(PoisonError::into_inner);
        model.is_vip = vip;
        info!(sender_id = %model.sender_id, vip, "Sender VIP flag set by user");
        Ok(model.clone())
    }

    /// Explicit, audited removal of one sender's history
    pub fn reset(&self, sender: &str) -> Option<SenderModel> {
        let identity = SenderIdentity::parse(sender)?;
        let removed = {
            let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
            models.remove(&identity.sender_id)
        }?;
        let model = removed.lock().unwrap_or_else(PoisonError::into_inner).clone();
        info!(
            sender_id = %model.sender_id,
            total_emails = model.total_emails,
            "Sender model reset by user"
        );
        Some(model)
    }

    /// Explicit, audited removal of every sender model. Returns the count removed.
    pub fn reset_all(&self) -> usize {
        let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
        let count = models.len();
        models.clear();
        info!(count, "All sender models reset by user");
        count
    }

    /// Models for the senders of `emails`, keyed by sender id
    pub fn lookup_for(&self, emails: &[EmailInput]) -> HashMap<String, SenderModel> {
        let mut found = HashMap::new();
        for email in emails {
            let Some(identity) = email.from.as_deref().and_then(SenderIdentity::parse) else {
                continue;
            };
            if found.contains_key(&identity.sender_id) {
                continue;
            }
            if let Some(model) = self.get_by_id(&identity.sender_id) {
                found.insert(identity.sender_id, model);
            }
        }
        found
    }

    pub fn len(&self) -> usize {
        self.models.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every model, sorted by sender id for stable output
    pub fn snapshot(&self) -> Vec<SenderModel> {
        let models = self.models.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<SenderModel> = models
            .values()
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .collect();
        out.sort_by(|a, b| a.sender_id.cmp(&b.sender_id));
        out
    }

    /// Replace the store contents with previously persisted models
    pub fn restore(&self, snapshot: Vec<SenderModel>) {
        let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
        models.clear();
        for model in snapshot {
            models.insert(model.sender_id.clone(), Arc::new(Mutex::new(model)));
        }
    }
}
