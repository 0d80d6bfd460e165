// src/platform.rs
// Chat platform interface: webhook envelope, signature check, reply client
//
// The platform SDK proper is an external collaborator; this module carries
// only what the core contracts on — events with stable ids, HMAC signature
// verification over the raw body, and a reply RPC bound by the platform's
// reply window.

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;

use crate::error::{BotError, Result};

/// Platform reply window. Replies posted later than this are discarded by
/// the platform, so the webhook deadline must stay below it.
pub const REPLY_WINDOW: Duration = Duration::from_secs(30);

/// Verify the webhook signature header against the raw request body.
pub fn verify_signature(channel_secret: &str, body: &[u8], signature_b64: &str) -> bool {
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(channel_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let Ok(expected) = base64::engine::general_purpose::STANDARD.decode(signature_b64) else {
        return false;
    };
    mac.verify_slice(&expected).is_ok()
}

/// What the user did.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// A text message
    Text(String),
    /// A postback payload from an earlier reply's buttons
    Postback(String),
}

/// One webhook event with the ids every handler and log record observes.
#[derive(Debug, Clone)]
pub struct Event {
    pub user_id: String,
    /// Group or room id when present, else the user id (1:1 chats).
    pub chat_id: String,
    pub event_id: String,
    pub message_id: Option<String>,
    pub reply_token: String,
    pub kind: EventKind,
}

// ── Wire format ──

#[derive(Debug, Deserialize)]
struct WebhookBody {
    #[serde(default)]
    events: Vec<WireEvent>,
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "webhookEventId", default)]
    event_id: String,
    #[serde(rename = "replyToken", default)]
    reply_token: String,
    #[serde(default)]
    source: WireSource,
    message: Option<WireMessage>,
    postback: Option<WirePostback>,
}

#[derive(Debug, Default, Deserialize)]
struct WireSource {
    #[serde(rename = "userId", default)]
    user_id: String,
    #[serde(rename = "groupId")]
    group_id: Option<String>,
    #[serde(rename = "roomId")]
    room_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct WirePostback {
    #[serde(default)]
    data: String,
}

/// Parse a webhook body into the events the dispatcher understands.
/// Unknown event and message types are skipped, not errors — the platform
/// adds kinds faster than bots learn them.
pub fn parse_webhook(body: &[u8]) -> Result<Vec<Event>> {
    let parsed: WebhookBody = serde_json::from_slice(body)?;
    let events = parsed
        .events
        .into_iter()
        .filter_map(|e| {
            let (kind, message_id) = match e.kind.as_str() {
                "message" => match e.message {
                    Some(m) if m.kind == "text" => (EventKind::Text(m.text), Some(m.id)),
                    _ => return None,
                },
                "postback" => (EventKind::Postback(e.postback?.data), None),
                _ => return None,
            };
            if e.source.user_id.is_empty() || e.reply_token.is_empty() {
                return None;
            }
            let chat_id = e
                .source
                .group_id
                .or(e.source.room_id)
                .unwrap_or_else(|| e.source.user_id.clone());
            Some(Event {
                user_id: e.source.user_id,
                chat_id,
                event_id: e.event_id,
                message_id: message_id.filter(|id| !id.is_empty()),
                reply_token: e.reply_token,
                kind,
            })
        })
        .collect();
    Ok(events)
}

/// One outgoing message. The rendering layer (bubbles, carousels) is out of
/// scope; the core only distinguishes text and sticker replies.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReplyMessage {
    Text { text: String },
    Image { url: String },
}

impl ReplyMessage {
    pub fn text(text: impl Into<String>) -> Self {
        ReplyMessage::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        ReplyMessage::Image { url: url.into() }
    }

    /// The text content, for assertions and logs.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ReplyMessage::Text { text } => Some(text),
            ReplyMessage::Image { .. } => None,
        }
    }
}

/// Posts replies back to the platform within the reply window.
pub struct ReplyClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
}

#[derive(Serialize)]
struct ReplyRequest<'a> {
    #[serde(rename = "replyToken")]
    reply_token: &'a str,
    messages: &'a [ReplyMessage],
}

impl ReplyClient {
    pub fn new(http: reqwest::Client, token: String) -> Self {
        Self::with_endpoint(http, token, "https://api.line.me/v2/bot/message/reply".into())
    }

    /// Test constructor pointing at a stub endpoint.
    pub fn with_endpoint(http: reqwest::Client, token: String, endpoint: String) -> Self {
        Self {
            http,
            endpoint,
            token,
        }
    }

    /// Post up to five messages against a reply token.
    pub async fn reply(&self, reply_token: &str, messages: &[ReplyMessage]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let request = ReplyRequest {
            reply_token,
            messages: &messages[..messages.len().min(5)],
        };
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .timeout(REPLY_WINDOW)
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BotError::Upstream(format!(
                "reply rejected: {}",
                response.status()
            )));
        }
        Ok(())
    }
}
