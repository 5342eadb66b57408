//! Tier-1 Statistical Predictor
//!
//! Predicts an action from the sender's history, falling back to content
//! rules when the history is too thin. Pure and synchronous: the same email
//! and model always give the same prediction.

use std::collections::HashMap;

use crate::config::{SenderModelConfig, Tier1Config};
use crate::normalize::SenderIdentity;
use crate::rules::ContentRules;
use crate::sender_model::SenderModel;
use crate::types::{AIActionType, EmailInput, ObservedAction, TierPrediction};

const MIN_CONFIDENCE: f64 = 0.05;
const MAX_CONFIDENCE: f64 = 0.99;
const RULE_AGREEMENT_BONUS: f64 = 0.05;
const VIP_DISCARD_PENALTY: f64 = 0.8;

/// Historical outcomes that can win the arg-max, with the action each implies
const CANDIDATES: [(ObservedAction, AIActionType, &str); 4] = [
    (ObservedAction::Archived, AIActionType::Archive, "archived"),
    (ObservedAction::Deleted, AIActionType::Delete, "deleted"),
    (ObservedAction::Responded, AIActionType::Keep, "answered"),
    (ObservedAction::Starred, AIActionType::Star, "starred"),
];

pub struct StatisticalPredictor {
    sender_config: SenderModelConfig,
    config: Tier1Config,
    rules: ContentRules,
}

impl StatisticalPredictor {
    pub fn new(sender_config: SenderModelConfig, config: Tier1Config) -> Self {
        Self::with_rules(sender_config, config, ContentRules::new())
    }

    pub fn with_rules(
        sender_config: SenderModelConfig,
        config: Tier1Config,
        rules: ContentRules,
    ) -> Self {
        Self {
            sender_config,
            config,
            rules,
        }
    }

    pub fn low_confidence_floor(&self) -> f64 {
        self.config.low_confidence_floor
    }

    /// Predict from the sender model when it has enough history, otherwise
    /// from content rules.
    pub fn predict(&self, email: &EmailInput, model: Option<&SenderModel>) -> TierPrediction {
        match model {
            Some(m) if m.total_emails >= self.sender_config.min_emails_for_confidence => {
                self.predict_from_history(email, m)
            }
            Some(m) => self.predict_from_rules(
                email,
                &format!("new sender ({} emails seen)", m.total_emails),
            ),
            None => self.predict_from_rules(email, "new sender"),
        }
    }

    /// One prediction per email, keyed by email id. Models are keyed by
    /// sender id and are only read.
    pub fn predict_batch(
        &self,
        emails: &[EmailInput],
        models: &HashMap<String, SenderModel>,
    ) -> HashMap<String, TierPrediction> {
        emails
            .iter()
            .map(|email| {
                let model = email
                    .from
                    .as_deref()
                    .and_then(SenderIdentity::parse)
                    .and_then(|id| models.get(&id.sender_id));
                (email.id.clone(), self.predict(email, model))
            })
            .collect()
    }

    fn predict_from_rules(&self, email: &EmailInput, context: &str) -> TierPrediction {
        if email.from.as_deref().map(str::trim).unwrap_or("").is_empty() {
            return TierPrediction::new(
                AIActionType::Keep,
                self.config.default_keep_confidence,
                "rule-based: missing sender",
            );
        }

        match self.rules.evaluate(email) {
            Some(verdict) => TierPrediction::new(
                verdict.action,
                verdict.confidence,
                format!("rule-based: {}; {}", context, verdict.reasons.join("; ")),
            ),
            None => TierPrediction::new(
                AIActionType::Keep,
                self.config.default_keep_confidence,
                format!("rule-based: {}", context),
            ),
        }
    }

    fn predict_from_history(&self, email: &EmailInput, model: &SenderModel) -> TierPrediction {
        let mut best: Option<(ObservedAction, AIActionType, &str, f64)> = None;
        for (observed, action, verb) in CANDIDATES {
            let rate = model.rate(observed);
            if best.map(|(_, _, _, r)| rate > r).unwrap_or(true) {
                best = Some((observed, action, verb, rate));
            }
        }

        let Some((_, action, verb, rate)) = best.filter(|(_, _, _, r)| *r > 0.0) else {
            return TierPrediction::new(
                AIActionType::Keep,
                self.config.default_keep_confidence,
                format!(
                    "statistical: no consistent action across {} emails",
                    model.total_emails
                ),
            );
        };

        let n = model.total_emails as f64;
        let volume_ceiling = 1.0 - 0.5 * (-n / self.config.volume_scale).exp();
        let recency = model.weight_at(email.received_at, self.sender_config.decay_half_life_days);
        let mut confidence = rate * volume_ceiling * (0.7 + 0.3 * recency);

        let mut reasoning = format!(
            "statistical: {:.0}% of {} emails from {} were {}",
            rate * 100.0,
            model.total_emails,
            model.sender_email,
            verb
        );

        if let Some(verdict) = self.rules.evaluate(email) {
            if verdict.action == action {
                confidence += RULE_AGREEMENT_BONUS;
                reasoning.push_str("; content rules agree");
            }
        }

        if model.is_vip && matches!(action, AIActionType::Archive | AIActionType::Delete) {
            confidence *= VIP_DISCARD_PENALTY;
            reasoning.push_str("; VIP sender");
        }

        TierPrediction::new(action, confidence.clamp(MIN_CONFIDENCE, MAX_CONFIDENCE), reasoning)
    }
}
