//! Core data types shared across the decision engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::WEIGHT_EPSILON;
use crate::error::{Result, TriageError};

/// An action the engine can recommend for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AIActionType {
    /// Leave it in the inbox
    Keep,
    Archive,
    Delete,
    Star,
    Snooze,
    Unsubscribe,
    /// The user is expected to answer
    Reply,
}

impl AIActionType {
    pub const ALL: [AIActionType; 7] = [
        Self::Keep,
        Self::Archive,
        Self::Delete,
        Self::Star,
        Self::Snooze,
        Self::Unsubscribe,
        Self::Reply,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keep => "keep",
            Self::Archive => "archive",
            Self::Delete => "delete",
            Self::Star => "star",
            Self::Snooze => "snooze",
            Self::Unsubscribe => "unsubscribe",
            Self::Reply => "reply",
        }
    }

    /// Lenient parse used on classifier output. Accepts a few synonyms.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "keep" | "inbox" | "none" => Some(Self::Keep),
            "archive" => Some(Self::Archive),
            "delete" | "trash" => Some(Self::Delete),
            "star" | "flag" => Some(Self::Star),
            "snooze" => Some(Self::Snooze),
            "unsubscribe" => Some(Self::Unsubscribe),
            "reply" | "respond" => Some(Self::Reply),
            _ => None,
        }
    }

    /// Whether executing this action touches the mailbox
    pub fn is_mailbox_mutation(&self) -> bool {
        match self {
            Self::Archive | Self::Delete | Self::Star | Self::Unsubscribe => true,
            Self::Keep | Self::Snooze | Self::Reply => false,
        }
    }

    /// The sender-history observation implied by a user carrying out this action
    pub fn as_observation(&self) -> Option<ObservedAction> {
        match self {
            Self::Archive => Some(ObservedAction::Archived),
            Self::Delete => Some(ObservedAction::Deleted),
            Self::Star => Some(ObservedAction::Starred),
            Self::Reply => Some(ObservedAction::Responded),
            Self::Keep | Self::Snooze | Self::Unsubscribe => None,
        }
    }
}

impl std::fmt::Display for AIActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal action a user took on a message, as seen by the sender model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservedAction {
    Responded,
    Archived,
    Deleted,
    Starred,
    Ignored,
}

/// One observation fed into the sender behavior model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderObservation {
    pub action: ObservedAction,
    pub at: DateTime<Utc>,
    /// Seconds between delivery and the user opening the message
    pub read_time_seconds: Option<f64>,
    /// Seconds between delivery and the user's reply
    pub response_time_seconds: Option<f64>,
}

impl SenderObservation {
    pub fn new(action: ObservedAction, at: DateTime<Utc>) -> Self {
        Self {
            action,
            at,
            read_time_seconds: None,
            response_time_seconds: None,
        }
    }

    pub fn with_read_time(mut self, seconds: f64) -> Self {
        self.read_time_seconds = Some(seconds);
        self
    }

    pub fn with_response_time(mut self, seconds: f64) -> Self {
        self.response_time_seconds = Some(seconds);
        self
    }
}

/// Incoming message as seen by the decision engine.
///
/// Every content field is optional; missing data degrades predictions instead
/// of failing them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailInput {
    pub id: String,
    /// Raw `From` header value, e.g. `"Jane <jane@example.com>"`
    pub from: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub received_at: DateTime<Utc>,
    /// Message carried a `List-Unsubscribe` header (RFC 2369)
    #[serde(default)]
    pub has_list_unsubscribe: bool,
}

impl EmailInput {
    pub fn new(id: impl Into<String>, from: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            from: Some(from.into()),
            subject: Some(subject.into()),
            body: None,
            received_at: Utc::now(),
            has_list_unsubscribe: false,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = at;
        self
    }

    pub fn subject_or_empty(&self) -> &str {
        self.subject.as_deref().unwrap_or("")
    }
}

/// Output of one prediction tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierPrediction {
    pub predicted_action: AIActionType,
    pub confidence: f64,
    pub reasoning: String,
    /// Intent label reported by the semantic classifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
}

impl TierPrediction {
    pub fn new(action: AIActionType, confidence: f64, reasoning: impl Into<String>) -> Self {
        Self {
            predicted_action: action,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: reasoning.into(),
            intent: None,
        }
    }
}

/// Ensemble tier weights. Tier-2 is a reserved slot and is never produced
/// by the current engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnsembleWeights {
    pub tier1: f64,
    pub tier2: f64,
    pub tier3: f64,
}

impl Default for EnsembleWeights {
    fn default() -> Self {
        Self {
            tier1: 0.4,
            tier2: 0.2,
            tier3: 0.4,
        }
    }
}

impl EnsembleWeights {
    pub fn sum(&self) -> f64 {
        self.tier1 + self.tier2 + self.tier3
    }

    /// Configured weights must be non-negative, give Tier-1 a voice, and sum to one.
    pub fn validate(&self) -> Result<()> {
        if self.tier1 < 0.0 || self.tier2 < 0.0 || self.tier3 < 0.0 {
            return Err(TriageError::Config(format!(
                "ensemble weights must be non-negative: {:?}",
                self
            )));
        }
        if self.tier1 <= 0.0 {
            return Err(TriageError::Config(
                "ensemble tier1 weight must be positive".into(),
            ));
        }
        if (self.sum() - 1.0).abs() > WEIGHT_EPSILON {
            return Err(TriageError::Config(format!(
                "ensemble weights must sum to 1.0, got {}",
                self.sum()
            )));
        }
        Ok(())
    }

    /// Weights restricted to the tiers that actually produced a prediction,
    /// rescaled to sum to one.
    pub fn renormalized(&self, tier3_present: bool) -> EnsembleWeights {
        let tier3 = if tier3_present { self.tier3 } else { 0.0 };
        let total = self.tier1 + tier3;
        if total <= 0.0 {
            return EnsembleWeights {
                tier1: 1.0,
                tier2: 0.0,
                tier3: 0.0,
            };
        }
        EnsembleWeights {
            tier1: self.tier1 / total,
            tier2: 0.0,
            tier3: tier3 / total,
        }
    }
}

/// Final ensemble decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalPrediction {
    pub action: AIActionType,
    pub confidence: f64,
    pub reasoning: String,
    pub requires_approval: bool,
}

/// Complete, immutable record of one decision engine run for one email
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub prediction_id: String,
    pub email_id: String,
    pub tier1_prediction: TierPrediction,
    pub tier3_prediction: Option<TierPrediction>,
    pub ensemble_weights: EnsembleWeights,
    pub final_prediction: FinalPrediction,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_roundtrip_names() {
        for action in AIActionType::ALL {
            assert_eq!(AIActionType::parse(action.as_str()), Some(action));
        }
        assert_eq!(AIActionType::parse(" Respond "), Some(AIActionType::Reply));
        assert_eq!(AIActionType::parse("explode"), None);
    }

    #[test]
    fn test_action_serializes_snake_case() {
        let json = serde_json::to_string(&AIActionType::Unsubscribe).unwrap();
        assert_eq!(json, "\"unsubscribe\"");
    }

    #[test]
    fn test_renormalize_without_tier3() {
        let w = EnsembleWeights::default().renormalized(false);
        assert!((w.tier1 - 1.0).abs() < 1e-9);
        assert_eq!(w.tier2, 0.0);
        assert_eq!(w.tier3, 0.0);
    }

    #[test]
    fn test_renormalize_with_tier3() {
        let w = EnsembleWeights {
            tier1: 0.3,
            tier2: 0.2,
            tier3: 0.5,
        }
        .renormalized(true);
        assert!((w.sum() - 1.0).abs() < 1e-9);
        assert!((w.tier1 - 0.375).abs() < 1e-9);
        assert!((w.tier3 - 0.625).abs() < 1e-9);
    }

    #[test]
    fn test_weights_validation() {
        assert!(EnsembleWeights::default().validate().is_ok());
        let negative = EnsembleWeights {
            tier1: 1.2,
            tier2: -0.2,
            tier3: 0.0,
        };
        assert!(negative.validate().is_err());
        let no_tier1 = EnsembleWeights {
            tier1: 0.0,
            tier2: 0.5,
            tier3: 0.5,
        };
        assert!(no_tier1.validate().is_err());
    }

    #[test]
    fn test_mutation_and_observation_mapping() {
        assert!(AIActionType::Archive.is_mailbox_mutation());
        assert!(!AIActionType::Keep.is_mailbox_mutation());
        assert_eq!(
            AIActionType::Reply.as_observation(),
            Some(ObservedAction::Responded)
        );
        assert_eq!(AIActionType::Snooze.as_observation(), None);
    }
}
