//! Ensemble predictor
//!
//! Tier-1 always runs first. The semantic classifier (Tier-3) is only
//! consulted when Tier-1 is unsure, and a failure or timeout there simply
//! leaves Tier-3 out of the vote. The merged confidence is gated against the
//! user's current auto-approve threshold to decide whether a human has to
//! look at the recommendation.

use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EnsembleConfig;
use crate::error::{Result, TriageError};
use crate::normalize::SenderIdentity;
use crate::queue::ActionQueueItem;
use crate::semantic::{SemanticClassifier, SemanticRequest};
use crate::sender_model::SenderModel;
use crate::tier1::StatisticalPredictor;
use crate::trust::TrustController;
use crate::types::{AIActionType, EmailInput, FinalPrediction, PredictionResult, TierPrediction};

struct CacheEntry {
    sender_id: Option<String>,
    result: PredictionResult,
}

/// Bounded prediction cache keyed by email id, oldest entry evicted first
struct PredictionCache {
    capacity: usize,
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
}

impl PredictionCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, email_id: &str) -> Option<&PredictionResult> {
        self.entries.get(email_id).map(|e| &e.result)
    }

    fn insert(&mut self, email_id: String, sender_id: Option<String>, result: PredictionResult) {
        if self.entries.contains_key(&email_id) {
            self.order.retain(|id| id != &email_id);
        }
        self.order.push_back(email_id.clone());
        self.entries.insert(email_id, CacheEntry { sender_id, result });

        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn remove(&mut self, email_id: &str) -> bool {
        if self.entries.remove(email_id).is_some() {
            self.order.retain(|id| id != email_id);
            true
        } else {
            false
        }
    }

    fn remove_sender(&mut self, sender_id: &str) -> usize {
        let stale: HashSet<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.sender_id.as_deref() == Some(sender_id))
            .map(|(id, _)| id.clone())
            .collect();
        if !stale.is_empty() {
            self.entries.retain(|id, _| !stale.contains(id));
            self.order.retain(|id| !stale.contains(id));
        }
        stale.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

pub struct EnsemblePredictor {
    config: EnsembleConfig,
    tier1: StatisticalPredictor,
    classifier: Option<Arc<dyn SemanticClassifier>>,
    trust: Arc<TrustController>,
    /// Bounds outstanding Tier-3 calls
    semaphore: Arc<Semaphore>,
    cache: Mutex<PredictionCache>,
    instructions: Option<String>,
}

impl EnsemblePredictor {
    pub fn new(
        config: EnsembleConfig,
        tier1: StatisticalPredictor,
        classifier: Option<Arc<dyn SemanticClassifier>>,
        trust: Arc<TrustController>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_llm.max(1)));
        let cache = Mutex::new(PredictionCache::new(config.cache_capacity));
        Self {
            config,
            tier1,
            classifier,
            trust,
            semaphore,
            cache,
            instructions: None,
        }
    }

    /// Free-form user preferences forwarded to the semantic classifier
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn has_classifier(&self) -> bool {
        self.classifier.is_some()
    }

    /// Predict one email. Results are cached by email id.
    pub async fn predict(
        &self,
        email: &EmailInput,
        user_id: &str,
        model: Option<&SenderModel>,
    ) -> PredictionResult {
        let threshold = self.trust.auto_approve_threshold(user_id);
        if let Some(hit) = self.cached(&email.id, threshold) {
            debug!("Prediction cache hit for {}", email.id);
            return hit;
        }

        let tier1 = self.tier1.predict(email, model);
        let tier3 = self.consult_semantic(email, &tier1).await;
        let result = self.combine(&email.id, threshold, tier1, tier3);

        let sender_id = email
            .from
            .as_deref()
            .and_then(SenderIdentity::parse)
            .map(|id| id.sender_id);
        self.lock_cache()
            .insert(email.id.clone(), sender_id, result.clone());

        result
    }

    /// Predict a batch concurrently. Returns exactly one result per distinct
    /// email id. On cancellation the in-flight work is aborted and an error is
    /// returned; results that already finished stay cached.
    pub async fn predict_batch(
        self: &Arc<Self>,
        emails: &[EmailInput],
        user_id: &str,
        models: &HashMap<String, SenderModel>,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, PredictionResult>> {
        let mut seen = HashSet::new();
        let mut tasks = JoinSet::new();

        for email in emails {
            if !seen.insert(email.id.clone()) {
                debug!("Skipping duplicate email {} in batch", email.id);
                continue;
            }
            let model = email
                .from
                .as_deref()
                .and_then(SenderIdentity::parse)
                .and_then(|id| models.get(&id.sender_id).cloned());
            let this = Arc::clone(self);
            let email = email.clone();
            let user_id = user_id.to_string();

            tasks.spawn(async move {
                let result = this.predict(&email, &user_id, model.as_ref()).await;
                (email.id, result)
            });
        }

        let mut results = HashMap::with_capacity(seen.len());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(
                        "Batch prediction cancelled with {}/{} results",
                        results.len(),
                        seen.len()
                    );
                    tasks.abort_all();
                    return Err(TriageError::Cancelled);
                }
                next = tasks.join_next() => match next {
                    Some(Ok((email_id, result))) => {
                        results.insert(email_id, result);
                    }
                    Some(Err(e)) => {
                        return Err(TriageError::Other(format!("Prediction task failed: {}", e)));
                    }
                    None => break,
                },
            }
        }

        Ok(results)
    }

    /// Tier-3 result, or `None` when it is not needed, not configured, failed
    /// or timed out.
    async fn consult_semantic(
        &self,
        email: &EmailInput,
        tier1: &TierPrediction,
    ) -> Option<TierPrediction> {
        let classifier = self.classifier.as_ref()?;
        if tier1.confidence >= self.config.llm_fallback_threshold {
            return None;
        }

        // Held for the duration of the call; released on drop, including
        // when the surrounding task is aborted
        let _permit = Arc::clone(&self.semaphore).acquire_owned().await.ok()?;

        let request = SemanticRequest::from_email(email, self.instructions.as_deref());
        let timeout = Duration::from_millis(self.config.llm_timeout_ms);

        debug!(
            "Tier-1 confidence {:.2} below {:.2}, consulting {} for {}",
            tier1.confidence,
            self.config.llm_fallback_threshold,
            classifier.name(),
            email.id
        );

        match tokio::time::timeout(timeout, classifier.classify(&request)).await {
            Ok(Ok(response)) if !response.confidence.is_finite() => {
                warn!(
                    "Semantic classifier returned confidence {} for {}, using Tier-1 only",
                    response.confidence, email.id
                );
                None
            }
            Ok(Ok(response)) => Some(response.into_tier_prediction()),
            Ok(Err(e)) => {
                warn!(
                    "Semantic classifier failed for {}, using Tier-1 only: {}",
                    email.id, e
                );
                None
            }
            Err(_) => {
                warn!(
                    "Semantic classifier timed out after {}ms for {}, using Tier-1 only",
                    self.config.llm_timeout_ms, email.id
                );
                None
            }
        }
    }

    /// Weighted vote over the tiers that produced a prediction
    pub(crate) fn combine(
        &self,
        email_id: &str,
        threshold: f64,
        tier1: TierPrediction,
        tier3: Option<TierPrediction>,
    ) -> PredictionResult {
        let weights = self
            .config
            .default_weights
            .renormalized(tier3.is_some());

        let mut votes: HashMap<AIActionType, f64> = HashMap::new();
        *votes.entry(tier1.predicted_action).or_insert(0.0) += weights.tier1 * tier1.confidence;
        if let Some(t3) = &tier3 {
            *votes.entry(t3.predicted_action).or_insert(0.0) += weights.tier3 * t3.confidence;
        }

        // Ties go to Tier-1
        let mut action = tier1.predicted_action;
        let mut score = votes.get(&action).copied().unwrap_or(0.0);
        for (candidate, candidate_score) in &votes {
            if *candidate_score > score {
                action = *candidate;
                score = *candidate_score;
            }
        }
        let confidence = score.clamp(0.0, 1.0);

        let reasoning = match &tier3 {
            Some(t3) if t3.predicted_action == tier1.predicted_action => {
                format!("{} | semantic agrees: {}", tier1.reasoning, t3.reasoning)
            }
            Some(t3) => format!(
                "{} | semantic suggests {}: {}",
                tier1.reasoning, t3.predicted_action, t3.reasoning
            ),
            None => tier1.reasoning.clone(),
        };

        PredictionResult {
            prediction_id: Uuid::new_v4().to_string(),
            email_id: email_id.to_string(),
            tier1_prediction: tier1,
            tier3_prediction: tier3,
            ensemble_weights: weights,
            final_prediction: FinalPrediction {
                action,
                confidence,
                reasoning,
                requires_approval: needs_approval(confidence, threshold),
            },
            created_at: Utc::now(),
        }
    }

    /// Cached result with the approval gate re-evaluated against the
    /// current threshold
    fn cached(&self, email_id: &str, threshold: f64) -> Option<PredictionResult> {
        let cache = self.lock_cache();
        let mut hit = cache.get(email_id)?.clone();
        hit.final_prediction.requires_approval =
            needs_approval(hit.final_prediction.confidence, threshold);
        Some(hit)
    }

    pub fn clear_cache(&self) {
        self.lock_cache().clear();
        debug!("Prediction cache cleared");
    }

    pub fn invalidate(&self, email_id: &str) -> bool {
        self.lock_cache().remove(email_id)
    }

    /// Drop every cached prediction for a sender, e.g. after its model changed
    pub fn invalidate_sender(&self, sender_id: &str) -> usize {
        let removed = self.lock_cache().remove_sender(sender_id);
        if removed > 0 {
            debug!("Invalidated {} cached predictions for sender", removed);
        }
        removed
    }

    pub fn cached_len(&self) -> usize {
        self.lock_cache().entries.len()
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, PredictionCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Anything that is not clearly at or above the threshold, NaN included,
/// goes to a human
fn needs_approval(confidence: f64, threshold: f64) -> bool {
    confidence.is_nan() || confidence < threshold
}

/// Build a queue-ready item for a prediction. Touches no store.
pub fn create_action_queue_item(
    prediction: &PredictionResult,
    email: &EmailInput,
    account_id: &str,
) -> ActionQueueItem {
    let sender_email = email
        .from
        .as_deref()
        .and_then(SenderIdentity::parse)
        .map(|id| id.email)
        .or_else(|| email.from.clone())
        .unwrap_or_default();

    ActionQueueItem::new(
        email.id.clone(),
        email.subject.clone().unwrap_or_default(),
        sender_email,
        account_id,
        prediction.clone(),
    )
}
