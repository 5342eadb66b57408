//! Content rules
//!
//! Cheap sender-string and subject heuristics used by Tier-1 when there is
//! not enough sender history. Each rule emits a weighted signal toward an
//! action; signals are aggregated per action and the strongest action wins.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};

use crate::normalize::{extract_address, normalize_email};
use crate::types::{AIActionType, EmailInput};

/// Rules alone never claim more than this
const MAX_RULE_CONFIDENCE: f64 = 0.7;

static NEWSLETTER_SUBJECT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(newsletter|digest|weekly update|daily update|this week in|issue #?\d+|edition)\b")
        .expect("newsletter subject pattern")
});

static PROMO_SUBJECT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d{1,2}% off|\bsale\b|\bdeal(s)?\b|limited time|flash sale|free shipping|last chance)")
        .expect("promo subject pattern")
});

static URGENT_SUBJECT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(urgent|asap|action required|immediately|deadline|time[- ]sensitive|eod|important)\b")
        .expect("urgent subject pattern")
});

static CALENDAR_SUBJECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(invitation|updated invitation|accepted|declined):").expect("calendar pattern"));

static UNSUBSCRIBE_BODY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(unsubscribe|opt[- ]out|email preferences|manage your subscription)")
        .expect("unsubscribe body pattern")
});

/// Aggregated verdict from the rules that fired
#[derive(Debug, Clone, PartialEq)]
pub struct RuleVerdict {
    pub action: AIActionType,
    pub confidence: f64,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone)]
struct Signal {
    action: AIActionType,
    weight: f64,
    reason: String,
}

impl Signal {
    fn new(action: AIActionType, weight: f64, reason: impl Into<String>) -> Self {
        Self {
            action,
            weight,
            reason: reason.into(),
        }
    }
}

/// Sender and subject rule set
pub struct ContentRules {
    bulk_domains: HashSet<String>,
    noreply_local_parts: Vec<String>,
    bulk_local_parts: Vec<String>,
    transactional_keywords: Vec<String>,
}

impl Default for ContentRules {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentRules {
    pub fn new() -> Self {
        Self {
            bulk_domains: Self::default_bulk_domains(),
            noreply_local_parts: Self::default_noreply_local_parts(),
            bulk_local_parts: Self::default_bulk_local_parts(),
            transactional_keywords: Self::default_transactional_keywords(),
        }
    }

    fn default_bulk_domains() -> HashSet<String> {
        [
            // Marketing platforms
            "mailchimp.com",
            "mcsv.net",
            "sendgrid.net",
            "constantcontact.com",
            "campaign-archive.com",
            "mail.beehiiv.com",
            "substack.com",
            "buttondown.email",
            "convertkit.com",
            "mailerlite.com",
            "hubspotemail.net",
            "klaviyomail.com",
            "medium.com",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn default_noreply_local_parts() -> Vec<String> {
        [
            "noreply",
            "no-reply",
            "no_reply",
            "donotreply",
            "do-not-reply",
            "notifications",
            "notification",
            "mailer-daemon",
            "bounce",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn default_bulk_local_parts() -> Vec<String> {
        ["newsletter", "news", "marketing", "promo", "promotions", "deals", "offers", "digest", "hello"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn default_transactional_keywords() -> Vec<String> {
        [
            "receipt",
            "invoice",
            "order confirmation",
            "your order",
            "shipping confirmation",
            "has shipped",
            "delivery notification",
            "payment received",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    /// Add a domain whose mail is treated as bulk
    pub fn add_bulk_domain(&mut self, domain: &str) {
        self.bulk_domains.insert(domain.trim().to_lowercase());
    }

    fn sender_signals(&self, from: &str, signals: &mut Vec<Signal>) {
        let Some(address) = extract_address(from) else {
            return;
        };
        let address = normalize_email(&address);
        let Some((local, domain)) = address.split_once('@') else {
            return;
        };

        if self.noreply_local_parts.iter().any(|p| local.contains(p.as_str())) {
            signals.push(Signal::new(
                AIActionType::Archive,
                0.55,
                "Sender is a no-reply address",
            ));
        }

        let bulk_domain = self.bulk_domains.contains(domain)
            || self
                .bulk_domains
                .iter()
                .any(|d| domain.ends_with(&format!(".{}", d)));
        if bulk_domain {
            signals.push(Signal::new(
                AIActionType::Archive,
                0.5,
                format!("Known bulk-mail domain: {}", domain),
            ));
        }

        if self.bulk_local_parts.iter().any(|p| local == p) {
            signals.push(Signal::new(
                AIActionType::Archive,
                0.45,
                format!("Bulk sender mailbox: {}", local),
            ));
        }
    }

    fn subject_signals(&self, subject: &str, signals: &mut Vec<Signal>) {
        if subject.is_empty() {
            return;
        }
        let lower = subject.to_lowercase();

        if URGENT_SUBJECT.is_match(subject) {
            signals.push(Signal::new(AIActionType::Keep, 0.55, "Subject sounds urgent"));
        }
        if CALENDAR_SUBJECT.is_match(subject) {
            signals.push(Signal::new(AIActionType::Keep, 0.45, "Calendar response"));
        }
        if NEWSLETTER_SUBJECT.is_match(subject) {
            signals.push(Signal::new(
                AIActionType::Archive,
                0.45,
                "Subject suggests newsletter",
            ));
        }
        if PROMO_SUBJECT.is_match(subject) {
            signals.push(Signal::new(
                AIActionType::Delete,
                0.4,
                "Subject looks promotional",
            ));
        }
        if let Some(keyword) = self
            .transactional_keywords
            .iter()
            .find(|k| lower.contains(k.as_str()))
        {
            signals.push(Signal::new(
                AIActionType::Archive,
                0.4,
                format!("Transactional subject: {}", keyword),
            ));
        }
    }

    /// Run every rule against the message. `None` when nothing fired.
    pub fn evaluate(&self, email: &EmailInput) -> Option<RuleVerdict> {
        let mut signals = Vec::new();

        if let Some(from) = email.from.as_deref() {
            self.sender_signals(from, &mut signals);
        }
        self.subject_signals(email.subject_or_empty(), &mut signals);

        let unsubscribe_in_body = email
            .body
            .as_deref()
            .map(|b| UNSUBSCRIBE_BODY.is_match(b))
            .unwrap_or(false);
        if email.has_list_unsubscribe || unsubscribe_in_body {
            signals.push(Signal::new(
                AIActionType::Archive,
                0.4,
                "Contains unsubscribe link",
            ));
        }

        if signals.is_empty() {
            return None;
        }

        let mut per_action: HashMap<AIActionType, (f64, f64, usize)> = HashMap::new();
        for signal in &signals {
            let entry = per_action.entry(signal.action).or_insert((0.0, 0.0, 0));
            entry.0 += signal.weight;
            entry.1 = entry.1.max(signal.weight);
            entry.2 += 1;
        }
        let total: f64 = signals.iter().map(|s| s.weight).sum();

        // Fixed iteration order keeps ties deterministic
        let mut best: Option<(AIActionType, (f64, f64, usize))> = None;
        for action in AIActionType::ALL {
            if let Some(score) = per_action.get(&action) {
                if best.map(|(_, b)| score.0 > b.0).unwrap_or(true) {
                    best = Some((action, *score));
                }
            }
        }
        let (action, (sum, strongest, count)) = best?;

        let support = strongest + 0.05 * (count.saturating_sub(1)) as f64;
        let agreement = sum / total;
        let confidence = (support.min(MAX_RULE_CONFIDENCE) * agreement).clamp(0.0, MAX_RULE_CONFIDENCE);

        let reasons = signals
            .into_iter()
            .filter(|s| s.action == action)
            .map(|s| s.reason)
            .collect();

        Some(RuleVerdict {
            action,
            confidence,
            reasons,
        })
    }
}
