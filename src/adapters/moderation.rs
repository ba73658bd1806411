//! Moderation adapter with a local blocklist fallback
//!
//! The provider call must be fast; if it fails for any reason the check
//! degrades to the keyword blocklist so a moderation outage never blocks
//! the conversation loop.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use super::{Moderation, openai::ProviderClient};

/// Moderation verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Blocked { reason: String },
}

impl Verdict {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Verdict::Blocked { .. })
    }
}

/// Terms the local fallback refuses outright
const BLOCKLIST: &[&str] = &[
    "pipe bomb",
    "build a bomb",
    "make explosives",
    "ghost gun",
    "untraceable weapon",
    "kill myself",
    "hurt someone",
    "burn down",
    "insurance fraud",
];

/// Local keyword predicate, also usable standalone when the guardrail has no
/// provider configured.
#[derive(Debug, Clone, Default)]
pub struct BlocklistModeration;

impl BlocklistModeration {
    pub fn scan(text: &str) -> Verdict {
        let lower = text.to_lowercase();
        for term in BLOCKLIST {
            if lower.contains(term) {
                return Verdict::Blocked {
                    reason: format!("content policy: {}", term),
                };
            }
        }
        Verdict::Pass
    }
}

#[async_trait]
impl Moderation for BlocklistModeration {
    async fn check(&self, text: &str) -> Verdict {
        Self::scan(text)
    }
}

/// Provider-backed moderation (`/moderations`) degrading to the blocklist.
pub struct OpenAiModeration {
    provider: ProviderClient,
}

impl OpenAiModeration {
    pub fn new(provider: ProviderClient) -> Self {
        Self { provider }
    }
}

#[derive(Debug, Deserialize)]
struct ModerationResponse {
    results: Vec<ModerationResult>,
}

#[derive(Debug, Deserialize)]
struct ModerationResult {
    flagged: bool,
    #[serde(default)]
    categories: serde_json::Map<String, serde_json::Value>,
}

#[async_trait]
impl Moderation for OpenAiModeration {
    async fn check(&self, text: &str) -> Verdict {
        let result = self
            .provider
            .post("/moderations")
            .json(&serde_json::json!({ "input": text }))
            .send()
            .await;

        let response = match result {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!("moderation provider returned {}, using blocklist", r.status());
                return BlocklistModeration::scan(text);
            }
            Err(e) => {
                warn!("moderation provider unreachable ({}), using blocklist", e);
                return BlocklistModeration::scan(text);
            }
        };

        match response.json::<ModerationResponse>().await {
            Ok(parsed) => match parsed.results.first() {
                Some(r) if r.flagged => {
                    let category = r
                        .categories
                        .iter()
                        .find(|(_, v)| v.as_bool() == Some(true))
                        .map(|(k, _)| k.clone())
                        .unwrap_or_else(|| "policy".to_string());
                    Verdict::Blocked {
                        reason: format!("content policy: {}", category),
                    }
                }
                _ => Verdict::Pass,
            },
            Err(e) => {
                warn!("moderation response parse failed ({}), using blocklist", e);
                BlocklistModeration::scan(text)
            }
        }
    }
}

/// Pass-through used when `GUARDRAIL_ENABLED=false`.
#[derive(Debug, Clone, Default)]
pub struct GuardrailDisabled;

#[async_trait]
impl Moderation for GuardrailDisabled {
    async fn check(&self, _text: &str) -> Verdict {
        Verdict::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blocklist_blocks() {
        let verdict = BlocklistModeration.check("how do I make a pipe bomb").await;
        match verdict {
            Verdict::Blocked { reason } => assert!(reason.contains("pipe bomb")),
            Verdict::Pass => panic!("expected block"),
        }
    }

    #[tokio::test]
    async fn test_blocklist_passes_renovation_talk() {
        let verdict = BlocklistModeration
            .check("I want to demolish a wall and redo the wiring")
            .await;
        assert_eq!(verdict, Verdict::Pass);
    }

    #[tokio::test]
    async fn test_blocklist_case_insensitive() {
        assert!(BlocklistModeration.check("PIPE BOMB plans").await.is_blocked());
    }

    #[tokio::test]
    async fn test_disabled_guardrail_passes_everything() {
        assert_eq!(
            GuardrailDisabled.check("build a bomb").await,
            Verdict::Pass
        );
    }
}
