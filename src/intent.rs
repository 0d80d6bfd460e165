// src/intent.rs
// Optional LLM intent parsing and query expansion
//
// Both features degrade silently when no API key is configured: keyword
// matchers keep working, only free-form natural-language queries lose the
// fallback.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BotError, Result};

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

const INTENT_PROMPT: &str = "\
You route campus chatbot queries. Reply with one JSON object only:\n\
{\"intent\": NAME, \"params\": {...}} or {\"intent\": \"none\"}.\n\
Intents and required params:\n\
- student_by_id {\"id\"}: a student number lookup\n\
- student_by_name {\"name\"}: find students by name\n\
- contact {\"query\"}: find a campus office or person\n\
- course_search {\"query\"}: find courses by topic\n\
- emergency {}: emergency phone numbers\n";

const EXPAND_PROMPT: &str = "\
Expand the course-search query with up to 4 short synonyms or related terms \
(mix Chinese and English as appropriate). Reply with a JSON array of strings \
only, no explanations.\n";

/// An intent the LLM extracted from free text.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedIntent {
    pub intent: String,
    pub params: HashMap<String, String>,
}

/// Chat-completions client for intent parsing and query expansion.
pub struct IntentParser {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

impl IntentParser {
    /// Build when a key is configured; None disables LLM features.
    pub fn from_key(http: reqwest::Client, api_key: Option<&str>) -> Option<Self> {
        let api_key = api_key?.to_string();
        let endpoint = std::env::var("LLM_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.into());
        let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.into());
        Some(Self {
            http,
            endpoint,
            model,
            api_key,
        })
    }

    /// Classify free text into `(intent, params)`. `Ok(None)` means the
    /// model saw no routable intent.
    pub async fn parse_intent(&self, text: &str) -> Result<Option<ParsedIntent>> {
        let raw = self.complete(INTENT_PROMPT, text).await?;
        let value: Value = serde_json::from_str(strip_fences(&raw))
            .map_err(|e| BotError::Other(format!("unparseable intent reply: {e}")))?;

        let intent = value
            .get("intent")
            .and_then(Value::as_str)
            .unwrap_or("none")
            .to_string();
        if intent == "none" || intent.is_empty() {
            return Ok(None);
        }

        let params = value
            .get("params")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Some(ParsedIntent { intent, params }))
    }

    /// Expand a course-search query with synonyms. Failures collapse to an
    /// empty expansion; search proceeds on the raw query.
    pub async fn expand_query(&self, query: &str) -> Vec<String> {
        let raw = match self.complete(EXPAND_PROMPT, query).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!("query expansion failed: {}", e);
                return Vec::new();
            }
        };
        serde_json::from_str::<Vec<String>>(strip_fences(&raw)).unwrap_or_default()
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: 0.0,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BotError::Upstream(format!(
                "LLM returned {}",
                response.status()
            )));
        }
        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| BotError::Other("LLM reply had no choices".into()))
    }
}

/// Models love fencing JSON in markdown; strip that before parsing.
fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_fences() {
        assert_eq!(strip_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fences("```\n[1,2]\n```"), "[1,2]");
    }

    #[test]
    fn test_from_key_requires_key() {
        assert!(IntentParser::from_key(reqwest::Client::new(), None).is_none());
        assert!(IntentParser::from_key(reqwest::Client::new(), Some("sk-x")).is_some());
    }
}
