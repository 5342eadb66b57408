//! Trust profile and autonomy controller
//!
//! One profile per user. The controller is the only writer of the trust
//! stage and of the auto-approve threshold; the threshold is always derived
//! from the stage through [`TrustConfig::threshold_for`].
//!
//! Stage changes look at a trailing window of recent dispositions rather
//! than the cumulative score, so an early run of mistakes does not pin a
//! user at the bottom forever and a late run of mistakes still demotes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

use crate::config::TrustConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustStage {
    TrainingWheels,
    BuildingConfidence,
    EarnedAutonomy,
}

impl TrustStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TrainingWheels => "training_wheels",
            Self::BuildingConfidence => "building_confidence",
            Self::EarnedAutonomy => "earned_autonomy",
        }
    }

    fn next(self) -> Option<Self> {
        match self {
            Self::TrainingWheels => Some(Self::BuildingConfidence),
            Self::BuildingConfidence => Some(Self::EarnedAutonomy),
            Self::EarnedAutonomy => None,
        }
    }

    fn previous(self) -> Option<Self> {
        match self {
            Self::TrainingWheels => None,
            Self::BuildingConfidence => Some(Self::TrainingWheels),
            Self::EarnedAutonomy => Some(Self::BuildingConfidence),
        }
    }
}

impl std::fmt::Display for TrustStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the user disposed of a recommendation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustOutcome {
    Approved,
    Rejected,
    /// Approved with a different action. Counts as a miss for accuracy.
    Modified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustProfile {
    pub user_id: String,
    pub trust_stage: TrustStage,
    /// `approved_actions / total_interactions`, 0 before any interaction
    pub trust_score: f64,
    pub total_interactions: u64,
    pub approved_actions: u64,
    pub rejected_actions: u64,
    pub modified_actions: u64,
    /// Actions executed without review. Not interactions.
    pub auto_executed_actions: u64,
    pub auto_approve_threshold: f64,
    /// Most recent dispositions, newest at the back. `true` = approved.
    pub recent_outcomes: VecDeque<bool>,
    pub stage_changed_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl TrustProfile {
    pub fn new(user_id: impl Into<String>, config: &TrustConfig, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            trust_stage: TrustStage::TrainingWheels,
            trust_score: 0.0,
            total_interactions: 0,
            approved_actions: 0,
            rejected_actions: 0,
            modified_actions: 0,
            auto_executed_actions: 0,
            auto_approve_threshold: config.threshold_for(TrustStage::TrainingWheels),
            recent_outcomes: VecDeque::new(),
            stage_changed_at: now,
            last_updated: now,
        }
    }

    /// Approval rate over the trailing window, `None` while it is empty
    pub fn window_accuracy(&self) -> Option<f64> {
        if self.recent_outcomes.is_empty() {
            return None;
        }
        let hits = self.recent_outcomes.iter().filter(|ok| **ok).count();
        Some(hits as f64 / self.recent_outcomes.len() as f64)
    }

    fn set_stage(&mut self, stage: TrustStage, config: &TrustConfig, now: DateTime<Utc>) {
        self.trust_stage = stage;
        self.auto_approve_threshold = config.threshold_for(stage);
        self.stage_changed_at = now;
    }
}

/// Result of feeding one disposition into a profile
#[derive(Debug, Clone, PartialEq)]
pub struct TrustUpdate {
    pub profile: TrustProfile,
    /// `(from, to)` when the stage moved
    pub stage_change: Option<(TrustStage, TrustStage)>,
}

pub struct TrustController {
    config: TrustConfig,
    profiles: Mutex<HashMap<String, TrustProfile>>,
}

impl TrustController {
    pub fn new(config: TrustConfig) -> Self {
        Self {
            config,
            profiles: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TrustConfig {
        &self.config
    }

    /// Current profile, created at training wheels on first use
    pub fn profile(&self, user_id: &str) -> TrustProfile {
        let mut profiles = self.profiles.lock().unwrap_or_else(PoisonError::into_inner);
        profiles
            .entry(user_id.to_string())
            .or_insert_with(|| TrustProfile::new(user_id, &self.config, Utc::now()))
            .clone()
    }

    pub fn stage(&self, user_id: &str) -> TrustStage {
        self.profile(user_id).trust_stage
    }

    pub fn auto_approve_threshold(&self, user_id: &str) -> f64 {
        self.profile(user_id).auto_approve_threshold
    }

    /// How many actions may run without review in one processed batch
    pub fn batch_cap(&self, user_id: &str) -> usize {
        self.config.batch_cap_for(self.stage(user_id))
    }

    pub fn update_trust_from_action(&self, user_id: &str, outcome: TrustOutcome) -> TrustUpdate {
        let now = Utc::now();
        let mut profiles = self.profiles.lock().unwrap_or_else(PoisonError::into_inner);
        let profile = profiles
            .entry(user_id.to_string())
            .or_insert_with(|| TrustProfile::new(user_id, &self.config, now));

        profile.total_interactions += 1;
        match outcome {
            TrustOutcome::Approved => profile.approved_actions += 1,
            TrustOutcome::Rejected => profile.rejected_actions += 1,
            TrustOutcome::Modified => profile.modified_actions += 1,
        }
        profile.trust_score = profile.approved_actions as f64 / profile.total_interactions as f64;

        profile
            .recent_outcomes
            .push_back(outcome == TrustOutcome::Approved);
        while profile.recent_outcomes.len() > self.config.window_size {
            profile.recent_outcomes.pop_front();
        }
        profile.last_updated = now;

        let before = profile.trust_stage;
        self.evaluate_stage(profile, now);
        let after = profile.trust_stage;

        debug!(
            "Trust update for {}: {:?}, score {:.3} over {} interactions",
            user_id, outcome, profile.trust_score, profile.total_interactions
        );

        let stage_change = if before != after {
            info!(
                "Trust stage for {} changed: {} -> {} (threshold {:.2})",
                user_id, before, after, profile.auto_approve_threshold
            );
            Some((before, after))
        } else {
            None
        };

        TrustUpdate {
            profile: profile.clone(),
            stage_change,
        }
    }

    /// Count an action that ran without review. Does not move the stage.
    pub fn record_auto_execution(&self, user_id: &str) -> TrustProfile {
        let now = Utc::now();
        let mut profiles = self.profiles.lock().unwrap_or_else(PoisonError::into_inner);
        let profile = profiles
            .entry(user_id.to_string())
            .or_insert_with(|| TrustProfile::new(user_id, &self.config, now));
        profile.auto_executed_actions += 1;
        profile.last_updated = now;
        profile.clone()
    }

    /// At most one stage step per disposition. Demotion is checked first.
    fn evaluate_stage(&self, profile: &mut TrustProfile, now: DateTime<Utc>) {
        let config = &self.config;
        let window_len = profile.recent_outcomes.len();
        let Some(accuracy) = profile.window_accuracy() else {
            return;
        };
        let stage = profile.trust_stage;

        let demote_below = match stage {
            TrustStage::TrainingWheels => None,
            TrustStage::BuildingConfidence => Some(config.demote_building_below),
            TrustStage::EarnedAutonomy => Some(config.demote_earned_below),
        };
        if let (Some(floor), Some(lower)) = (demote_below, stage.previous()) {
            if window_len >= config.demotion_min_window && accuracy < floor {
                profile.set_stage(lower, config, now);
                // Start the next stage with a clean slate
                profile.recent_outcomes.clear();
                return;
            }
        }

        let promotion = match stage.next() {
            Some(TrustStage::BuildingConfidence) => Some((
                config.promote_building_min_interactions,
                config.promote_building_min_accuracy,
            )),
            Some(TrustStage::EarnedAutonomy) => Some((
                config.promote_earned_min_interactions,
                config.promote_earned_min_accuracy,
            )),
            _ => None,
        };
        if let (Some((min_interactions, min_accuracy)), Some(higher)) = (promotion, stage.next()) {
            if profile.total_interactions >= min_interactions
                && window_len >= config.demotion_min_window
                && accuracy >= min_accuracy
            {
                profile.set_stage(higher, config, now);
            }
        }
    }

    pub fn snapshot(&self) -> Vec<TrustProfile> {
        let profiles = self.profiles.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<TrustProfile> = profiles.values().cloned().collect();
        all.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        all
    }

    /// Replace all profiles. Thresholds are re-derived from the stored
    /// stages and windows are trimmed to the configured size.
    pub fn restore(&self, snapshot: Vec<TrustProfile>) {
        let mut profiles = self.profiles.lock().unwrap_or_else(PoisonError::into_inner);
        profiles.clear();
        for mut profile in snapshot {
            profile.auto_approve_threshold = self.config.threshold_for(profile.trust_stage);
            while profile.recent_outcomes.len() > self.config.window_size {
                profile.recent_outcomes.pop_front();
            }
            profiles.insert(profile.user_id.clone(), profile);
        }
        debug!("Restored {} trust profiles", profiles.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER: &str = "user-1";

    fn controller() -> TrustController {
        TrustController::new(TrustConfig::default())
    }

    fn apply(c: &TrustController, outcome: TrustOutcome, times: usize) -> TrustUpdate {
        let mut last = None;
        for _ in 0..times {
            last = Some(c.update_trust_from_action(USER, outcome));
        }
        last.unwrap()
    }

    #[test]
    fn test_new_profile_starts_in_training_wheels() {
        let c = controller();
        let p = c.profile(USER);
        assert_eq!(p.trust_stage, TrustStage::TrainingWheels);
        assert_eq!(p.total_interactions, 0);
        assert_eq!(p.trust_score, 0.0);
        assert!((p.auto_approve_threshold - 0.95).abs() < 1e-9);
        assert_eq!(c.batch_cap(USER), 0);
    }

    #[test]
    fn test_consecutive_approvals_accounting() {
        let c = controller();
        let update = apply(&c, TrustOutcome::Approved, 12);
        assert_eq!(update.profile.total_interactions, 12);
        assert_eq!(update.profile.approved_actions, 12);
        assert_eq!(update.profile.trust_score, 1.0);
    }

    #[test]
    fn test_promotion_needs_volume_and_accuracy() {
        let c = controller();
        let update = apply(&c, TrustOutcome::Approved, 19);
        assert_eq!(update.profile.trust_stage, TrustStage::TrainingWheels);

        let update = c.update_trust_from_action(USER, TrustOutcome::Approved);
        assert_eq!(
            update.stage_change,
            Some((TrustStage::TrainingWheels, TrustStage::BuildingConfidence))
        );
        assert!((update.profile.auto_approve_threshold - 0.85).abs() < 1e-9);
        assert_eq!(c.batch_cap(USER), 10);

        let update = apply(&c, TrustOutcome::Approved, 80);
        assert_eq!(update.profile.trust_stage, TrustStage::EarnedAutonomy);
        assert!((c.auto_approve_threshold(USER) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_threshold_always_matches_stage() {
        let c = controller();
        let config = TrustConfig::default();
        let outcomes = [
            TrustOutcome::Approved,
            TrustOutcome::Approved,
            TrustOutcome::Rejected,
            TrustOutcome::Modified,
        ];
        for i in 0..300 {
            let update = c.update_trust_from_action(USER, outcomes[i % outcomes.len()]);
            assert_eq!(
                update.profile.auto_approve_threshold,
                config.threshold_for(update.profile.trust_stage)
            );
        }
    }

    #[test]
    fn test_single_rejection_does_not_demote() {
        let c = controller();
        apply(&c, TrustOutcome::Approved, 25);
        let update = c.update_trust_from_action(USER, TrustOutcome::Rejected);
        assert_eq!(update.profile.trust_stage, TrustStage::BuildingConfidence);
        assert!(update.stage_change.is_none());
    }

    #[test]
    fn test_trailing_window_demotion_and_recovery() {
        let c = controller();
        apply(&c, TrustOutcome::Approved, 100);
        assert_eq!(c.stage(USER), TrustStage::EarnedAutonomy);

        // 38 of the last 50 approved: still above 0.75
        let update = apply(&c, TrustOutcome::Rejected, 12);
        assert_eq!(update.profile.trust_stage, TrustStage::EarnedAutonomy);

        let update = c.update_trust_from_action(USER, TrustOutcome::Rejected);
        assert_eq!(
            update.stage_change,
            Some((TrustStage::EarnedAutonomy, TrustStage::BuildingConfidence))
        );
        assert!(update.profile.recent_outcomes.is_empty());

        // A clean streak earns autonomy back
        let update = apply(&c, TrustOutcome::Approved, 20);
        assert_eq!(update.profile.trust_stage, TrustStage::EarnedAutonomy);
    }

    #[test]
    fn test_early_mistakes_are_not_permanent() {
        let c = controller();
        apply(&c, TrustOutcome::Rejected, 10);
        let update = apply(&c, TrustOutcome::Approved, 45);
        assert!(update.profile.trust_score < 0.85);
        assert_eq!(update.profile.trust_stage, TrustStage::BuildingConfidence);
    }

    #[test]
    fn test_modified_is_an_interaction_but_not_an_approval() {
        let c = controller();
        c.update_trust_from_action(USER, TrustOutcome::Approved);
        let update = c.update_trust_from_action(USER, TrustOutcome::Modified);
        assert_eq!(update.profile.total_interactions, 2);
        assert_eq!(update.profile.approved_actions, 1);
        assert_eq!(update.profile.modified_actions, 1);
        assert!((update.profile.trust_score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_auto_execution_is_counted_separately() {
        let c = controller();
        let p = c.record_auto_execution(USER);
        assert_eq!(p.auto_executed_actions, 1);
        assert_eq!(p.total_interactions, 0);
    }

    #[test]
    fn test_profiles_are_per_user() {
        let c = controller();
        apply(&c, TrustOutcome::Approved, 20);
        assert_eq!(c.stage(USER), TrustStage::BuildingConfidence);
        assert_eq!(c.stage("someone-else"), TrustStage::TrainingWheels);
    }

    #[test]
    fn test_restore_rederives_threshold() {
        let c = controller();
        apply(&c, TrustOutcome::Approved, 20);
        let mut snapshot = c.snapshot();
        snapshot[0].auto_approve_threshold = 0.1;

        let restored = controller();
        restored.restore(snapshot);
        assert!((restored.auto_approve_threshold(USER) - 0.85).abs() < 1e-9);
        assert_eq!(restored.profile(USER).total_interactions, 20);
    }
}
