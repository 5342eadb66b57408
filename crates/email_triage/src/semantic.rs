//! Tier-3 semantic classifier
//!
//! The engine only depends on the [`SemanticClassifier`] trait. The Ollama
//! adapter below is the implementation used by the desktop app: it sends the
//! message to a local model and parses a small JSON verdict out of the reply.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::SemanticConfig;
use crate::error::{Result, TriageError};
use crate::types::{AIActionType, EmailInput, TierPrediction};

/// Characters of body text sent to the classifier
const BODY_PREVIEW_CHARS: usize = 1500;

/// Input to the semantic classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticRequest {
    pub from: String,
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl SemanticRequest {
    pub fn from_email(email: &EmailInput, instructions: Option<&str>) -> Self {
        Self {
            from: email.from.clone().unwrap_or_default(),
            subject: email.subject.clone().unwrap_or_default(),
            body: email
                .body
                .as_deref()
                .unwrap_or("")
                .chars()
                .take(BODY_PREVIEW_CHARS)
                .collect(),
            instructions: instructions.map(|s| s.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticClassification {
    pub intent: String,
}

/// Output of the semantic classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticResponse {
    pub predicted_action: AIActionType,
    pub confidence: f64,
    pub reasoning: String,
    pub classification: SemanticClassification,
}

impl SemanticResponse {
    pub fn into_tier_prediction(self) -> TierPrediction {
        let mut prediction =
            TierPrediction::new(self.predicted_action, self.confidence, self.reasoning);
        prediction.intent = Some(self.classification.intent);
        prediction
    }
}

/// Content-understanding classifier. Fallible and slow; callers bound it
/// with a timeout.
#[async_trait]
pub trait SemanticClassifier: Send + Sync {
    fn name(&self) -> &'static str {
        "semantic"
    }

    async fn classify(&self, request: &SemanticRequest) -> Result<SemanticResponse>;
}

/// Prompt template sent to the LLM.
const TRIAGE_PROMPT: &str = r#"You triage email for a busy person. Decide what they would do with this message.

Actions:
- keep: leave it in the inbox for later
- archive: no action needed, file it away
- delete: unwanted or worthless
- star: important, must not be missed
- snooze: relevant later, not now
- unsubscribe: bulk mail they no longer want
- reply: they need to answer

Email:
From: {from}
Subject: {subject}
Body: {body}
{instructions}
Respond with ONLY a JSON object:
{"action": "<one action>", "confidence": <0.0-1.0>, "intent": "<short intent label>", "reasoning": "<one sentence>"}"#;

#[derive(Serialize)]
struct GenRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    format: &'a str,
    options: GenOptions,
}

#[derive(Serialize)]
struct GenOptions {
    temperature: f64,
    num_predict: u32,
}

#[derive(Deserialize)]
struct GenResponse {
    response: Option<String>,
}

#[derive(Deserialize)]
struct RawVerdict {
    action: String,
    confidence: f64,
    #[serde(default)]
    intent: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Ollama-backed semantic classifier
pub struct OllamaSemanticClassifier {
    client: Client,
    base_url: String,
    model: String,
    config_hash: String,
}

impl OllamaSemanticClassifier {
    pub fn new(config: &SemanticConfig, timeout: Duration) -> Result<Self> {
        let mut builder = Client::builder().timeout(timeout);

        if let Some(key) = config.api_key.as_deref() {
            let mut headers = reqwest::header::HeaderMap::new();
            let value = format!("Bearer {}", key)
                .parse()
                .map_err(|_| TriageError::Config("Invalid Ollama API key".into()))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }

        Ok(Self {
            client: builder.build()?,
            base_url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            config_hash: Self::compute_hash(&config.model, TRIAGE_PROMPT),
        })
    }

    /// SHA-256 of model name + prompt template; changes when predictions
    /// made by this classifier should be considered stale.
    pub fn compute_hash(model: &str, prompt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update(prompt.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    /// Fast connectivity check, swallows all errors.
    pub async fn is_reachable(&self) -> bool {
        self.client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn build_prompt(request: &SemanticRequest) -> String {
        let instructions = request
            .instructions
            .as_deref()
            .map(|i| format!("\nUser preferences: {}\n", i))
            .unwrap_or_default();

        TRIAGE_PROMPT
            .replace("{from}", &request.from)
            .replace(
                "{subject}",
                if request.subject.is_empty() {
                    "(no subject)"
                } else {
                    &request.subject
                },
            )
            .replace("{body}", &request.body)
            .replace("{instructions}", &instructions)
    }

    /// Extract the JSON verdict from a model reply that may carry extra text.
    pub fn parse_response(text: &str) -> Result<SemanticResponse> {
        let start = text.find('{');
        let end = text.rfind('}');
        let json = match (start, end) {
            (Some(s), Some(e)) if s < e => &text[s..=e],
            _ => {
                return Err(TriageError::Parse(format!(
                    "No JSON object in classifier reply: {}",
                    text.chars().take(120).collect::<String>()
                )))
            }
        };

        let raw: RawVerdict = serde_json::from_str(json)
            .map_err(|e| TriageError::Parse(format!("Malformed classifier verdict: {}", e)))?;

        let action = AIActionType::parse(&raw.action).ok_or_else(|| {
            TriageError::Parse(format!("Unknown action from classifier: {}", raw.action))
        })?;
        if !raw.confidence.is_finite() {
            return Err(TriageError::Parse("Non-finite classifier confidence".into()));
        }

        Ok(SemanticResponse {
            predicted_action: action,
            confidence: raw.confidence.clamp(0.0, 1.0),
            reasoning: raw
                .reasoning
                .unwrap_or_else(|| format!("semantic: {}", action)),
            classification: SemanticClassification {
                intent: raw.intent.unwrap_or_else(|| "unknown".to_string()),
            },
        })
    }
}

#[async_trait]
impl SemanticClassifier for OllamaSemanticClassifier {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn classify(&self, request: &SemanticRequest) -> Result<SemanticResponse> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenRequest {
            model: &self.model,
            prompt: Self::build_prompt(request),
            stream: false,
            format: "json",
            options: GenOptions {
                temperature: 0.1,
                num_predict: 200,
            },
        };

        debug!("Calling Ollama at {} with model {}", url, self.model);

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TriageError::Network(format!("Ollama request failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            warn!("Ollama returned status {}: {}", status, text);
            return Err(TriageError::Classifier(format!(
                "Ollama returned HTTP {}",
                status
            )));
        }

        let parsed: GenResponse = resp
            .json()
            .await
            .map_err(|e| TriageError::Parse(format!("Failed to parse Ollama response: {}", e)))?;

        Self::parse_response(parsed.response.as_deref().unwrap_or(""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_clean_json() {
        let r = OllamaSemanticClassifier::parse_response(
            r#"{"action": "reply", "confidence": 0.82, "intent": "question", "reasoning": "Direct question"}"#,
        )
        .unwrap();
        assert_eq!(r.predicted_action, AIActionType::Reply);
        assert!((r.confidence - 0.82).abs() < 1e-9);
        assert_eq!(r.classification.intent, "question");
    }

    #[test]
    fn test_parse_json_wrapped_in_prose() {
        let r = OllamaSemanticClassifier::parse_response(
            "Sure! Here it is:\n{\"action\": \"Archive\", \"confidence\": 1.7}\nHope that helps.",
        )
        .unwrap();
        assert_eq!(r.predicted_action, AIActionType::Archive);
        assert_eq!(r.confidence, 1.0);
        assert_eq!(r.classification.intent, "unknown");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(OllamaSemanticClassifier::parse_response("archive").is_err());
        assert!(OllamaSemanticClassifier::parse_response(r#"{"action": "explode", "confidence": 0.5}"#).is_err());
        assert!(OllamaSemanticClassifier::parse_response(r#"{"confidence": 0.5}"#).is_err());
    }

    #[test]
    fn test_request_truncates_body() {
        let email = EmailInput::new("1", "a@b.com", "Hi").with_body("x".repeat(5000));
        let req = SemanticRequest::from_email(&email, Some("I never read promos"));
        assert_eq!(req.body.chars().count(), BODY_PREVIEW_CHARS);
        assert_eq!(req.instructions.as_deref(), Some("I never read promos"));
    }

    #[test]
    fn test_prompt_contains_fields() {
        let req = SemanticRequest {
            from: "boss@company.com".into(),
            subject: String::new(),
            body: "Can you send the numbers?".into(),
            instructions: None,
        };
        let prompt = OllamaSemanticClassifier::build_prompt(&req);
        assert!(prompt.contains("From: boss@company.com"));
        assert!(prompt.contains("(no subject)"));
        assert!(prompt.contains("Can you send the numbers?"));
        assert!(!prompt.contains("{instructions}"));
    }

    #[test]
    fn test_config_hash_tracks_model() {
        let a = OllamaSemanticClassifier::compute_hash("m1", TRIAGE_PROMPT);
        let b = OllamaSemanticClassifier::compute_hash("m2", TRIAGE_PROMPT);
        assert_ne!(a, b);
        assert_eq!(a, OllamaSemanticClassifier::compute_hash("m1", TRIAGE_PROMPT));
    }

    #[test]
    fn test_response_into_tier_prediction_keeps_intent() {
        let r = SemanticResponse {
            predicted_action: AIActionType::Star,
            confidence: 0.9,
            reasoning: "contract".into(),
            classification: SemanticClassification {
                intent: "legal".into(),
            },
        };
        let p = r.into_tier_prediction();
        assert_eq!(p.predicted_action, AIActionType::Star);
        assert_eq!(p.intent.as_deref(), Some("legal"));
    }
}
