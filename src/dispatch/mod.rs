// dispatch/mod.rs
// Intent routing: pattern matchers, module handlers, LLM fallback

pub mod contact;
pub mod course;
pub mod emergency;
pub mod sticker;
pub mod student;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{BotError, Result};
use crate::index::CourseIndex;
use crate::intent::IntentParser;
use crate::limiter::{Decision, KeyedLimiter};
use crate::logsink::{Level, LogScope, MultiSink, Record, Sink};
use crate::metrics::{CacheOutcome, Metrics};
use crate::platform::{Event, EventKind, ReplyMessage};
use crate::scrape::ScrapeClient;
use crate::store::Store;

/// Everything a handler may touch, created once in the composition root.
pub struct BotContext {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub scraper: Arc<ScrapeClient>,
    pub index: Arc<CourseIndex>,
    pub limiter: Arc<KeyedLimiter>,
    pub metrics: Arc<Metrics>,
    pub intent: Option<Arc<IntentParser>>,
    pub events_log: Arc<MultiSink>,
}

/// Per-event handler context.
#[derive(Clone)]
pub struct Ctx {
    pub bot: Arc<BotContext>,
    pub token: CancellationToken,
    pub user_id: String,
    pub chat_id: String,
}

/// Deterministic accounting every handler reports.
#[derive(Debug, Default, Clone)]
pub struct HandlerStats {
    pub cache: Option<CacheOutcome>,
    pub upstream_ms: Option<u64>,
    pub result_count: usize,
}

/// A follow-up intent token. Handlers never call each other directly; they
/// hand the dispatcher a token instead.
#[derive(Debug, Clone, PartialEq)]
pub struct NextIntent {
    pub intent: String,
    pub params: HashMap<String, String>,
}

/// What a handler produced.
#[derive(Debug, Default)]
pub struct HandlerOutput {
    pub messages: Vec<ReplyMessage>,
    pub next_intent: Option<NextIntent>,
    pub stats: HandlerStats,
}

impl HandlerOutput {
    pub fn reply(message: ReplyMessage) -> Self {
        Self {
            messages: vec![message],
            ..Default::default()
        }
    }

    pub fn with_stats(mut self, stats: HandlerStats) -> Self {
        self.stats = stats;
        self
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<HandlerOutput>> + Send>>;

/// A text handler. Receives the full message text.
pub type Handler = Arc<dyn Fn(Ctx, String) -> HandlerFuture + Send + Sync>;

/// An intent handler. Receives named params from the LLM parser or a
/// postback token.
pub type IntentHandler = Arc<dyn Fn(Ctx, HashMap<String, String>) -> HandlerFuture + Send + Sync>;

/// How a matcher recognizes its messages.
pub enum Pattern {
    /// Message starts with the given keyword
    Prefix(&'static str),
    /// Regex over the whole message
    Keyword(Regex),
    /// Arbitrary predicate
    Predicate(fn(&str) -> bool),
}

impl Pattern {
    fn matches(&self, text: &str) -> bool {
        match self {
            Pattern::Prefix(prefix) => text.trim_start().starts_with(prefix),
            Pattern::Keyword(regex) => regex.is_match(text),
            Pattern::Predicate(pred) => pred(text),
        }
    }
}

/// One row of the matcher table.
pub struct Matcher {
    /// Lower wins on ties; the table is sorted by priority at build time.
    pub priority: u8,
    pub module: &'static str,
    pub pattern: Pattern,
    pub handler: Handler,
}

/// Routes events to module handlers.
pub struct Dispatcher {
    ctx: Arc<BotContext>,
    matchers: Vec<Matcher>,
    intents: HashMap<&'static str, (&'static str, IntentHandler)>,
}

impl Dispatcher {
    /// Build the matcher table and intent registry from every module.
    pub fn new(ctx: Arc<BotContext>) -> Self {
        let mut matchers = Vec::new();
        matchers.extend(student::matchers());
        matchers.extend(emergency::matchers());
        matchers.extend(contact::matchers());
        matchers.extend(course::matchers());
        matchers.extend(sticker::matchers());
        matchers.sort_by_key(|m| m.priority);

        let mut intents: HashMap<&'static str, (&'static str, IntentHandler)> = HashMap::new();
        for (module, name, handler) in student::intents()
            .into_iter()
            .chain(contact::intents())
            .chain(course::intents())
            .chain(emergency::intents())
        {
            intents.insert(name, (module, handler));
        }

        Self {
            ctx,
            matchers,
            intents,
        }
    }

    /// Handle one webhook event, producing the reply messages. Rate
    /// limiting happens before any routing; handler errors map to
    /// human-readable text and never leak raw error strings.
    pub async fn handle_event(
        &self,
        token: CancellationToken,
        event: &Event,
    ) -> Vec<ReplyMessage> {
        self.ctx
            .metrics
            .webhook_events
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        match self.ctx.limiter.allow(&event.user_id) {
            Decision::Allowed => {}
            Decision::Denied { retry_after } => {
                self.ctx
                    .metrics
                    .rate_limited
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return vec![ReplyMessage::text(format!(
                    "訊息有點多，請稍候約 {retry_after} 秒再試一次 🙏"
                ))];
            }
        }

        let ctx = Ctx {
            bot: self.ctx.clone(),
            token: token.clone(),
            user_id: event.user_id.clone(),
            chat_id: event.chat_id.clone(),
        };

        let deadline = self.ctx.config.webhook_timeout;
        let outcome = tokio::time::timeout(deadline, self.route(ctx, event)).await;

        match outcome {
            Ok(Ok((module, output))) => {
                self.log_handled(event, module, &output);
                output.messages
            }
            Ok(Err((module, e))) => self.reply_for_error(event, module, e),
            Err(_elapsed) => {
                tracing::warn!(event_id = %event.event_id, "handler exceeded webhook deadline");
                vec![ReplyMessage::text("系統忙碌中，請稍後再試 🙏")]
            }
        }
    }

    /// Route one event: matcher table first, then the LLM fallback, then
    /// any next-intent tokens (bounded, so module cycles cannot loop).
    async fn route(
        &self,
        ctx: Ctx,
        event: &Event,
    ) -> std::result::Result<(&'static str, HandlerOutput), (&'static str, BotError)> {
        let (module, mut output) = match &event.kind {
            EventKind::Text(text) => self.route_text(ctx.clone(), text).await?,
            EventKind::Postback(data) => {
                let next = parse_postback(data)
                    .ok_or(("dispatch", BotError::InvalidInput("unreadable postback".into())))?;
                self.run_intent(ctx.clone(), &next).await?
            }
        };

        // Message passing between modules: at most two extra hops.
        for _ in 0..2 {
            let Some(next) = output.next_intent.take() else {
                break;
            };
            let (_, more) = self.run_intent(ctx.clone(), &next).await?;
            output.messages.extend(more.messages);
            output.next_intent = more.next_intent;
        }

        Ok((module, output))
    }

    async fn route_text(
        &self,
        ctx: Ctx,
        text: &str,
    ) -> std::result::Result<(&'static str, HandlerOutput), (&'static str, BotError)> {
        for matcher in &self.matchers {
            if matcher.pattern.matches(text) {
                let output = (matcher.handler)(ctx, text.to_string())
                    .await
                    .map_err(|e| (matcher.module, e))?;
                return Ok((matcher.module, output));
            }
        }

        // No matcher fired: ask the LLM, when configured.
        if let Some(parser) = &self.ctx.intent {
            match parser.parse_intent(text).await {
                Ok(Some(parsed)) => {
                    let next = NextIntent {
                        intent: parsed.intent,
                        params: parsed.params,
                    };
                    return self.run_intent(ctx, &next).await;
                }
                Ok(None) => {}
                Err(e) => tracing::debug!("intent parser unavailable: {}", e),
            }
        }

        Ok((
            "dispatch",
            HandlerOutput::reply(ReplyMessage::text(
                "看不懂這句話 😅 可以試試「學號 41247001」、「課程 雲端」、「聯絡 資工系」或「緊急」",
            )),
        ))
    }

    async fn run_intent(
        &self,
        ctx: Ctx,
        next: &NextIntent,
    ) -> std::result::Result<(&'static str, HandlerOutput), (&'static str, BotError)> {
        let Some(entry) = self.intents.get(next.intent.as_str()) else {
            return Err((
                "dispatch",
                BotError::InvalidInput(format!("unknown intent {}", next.intent)),
            ));
        };
        let (module, handler) = (entry.0, entry.1.clone());
        let output = handler(ctx, next.params.clone())
            .await
            .map_err(|e| (module, e))?;
        Ok((module, output))
    }

    /// Map an error to its user-facing reply per the error taxonomy.
    fn reply_for_error(
        &self,
        event: &Event,
        module: &'static str,
        error: BotError,
    ) -> Vec<ReplyMessage> {
        use std::sync::atomic::Ordering::Relaxed;
        let metrics = &self.ctx.metrics;

        let reply = match &error {
            BotError::Cancelled => return Vec::new(), // silent
            BotError::NotFound => {
                metrics.not_found.fetch_add(1, Relaxed);
                "查無資料，換個關鍵字試試看？"
            }
            BotError::InvalidInput(_) | BotError::MissingParameter(_) => {
                metrics.client_errors.fetch_add(1, Relaxed);
                self.log_event(
                    event,
                    module,
                    Level::Warn,
                    &format!("client error: {error}"),
                );
                "缺少查詢條件，試試「學號 41247001」這樣的格式"
            }
            BotError::Upstream(_) => {
                metrics.handler_errors.fetch_add(1, Relaxed);
                self.log_event(event, module, Level::Warn, &format!("upstream: {error}"));
                "學校網站暫時沒有回應，稍後再試一次 🙏"
            }
            _ => {
                metrics.handler_errors.fetch_add(1, Relaxed);
                self.log_event(event, module, Level::Error, &format!("handler: {error}"));
                "系統發生錯誤，請稍後再試"
            }
        };
        vec![ReplyMessage::text(reply)]
    }

    fn log_handled(&self, event: &Event, module: &'static str, output: &HandlerOutput) {
        if let Some(outcome) = output.stats.cache {
            self.ctx.metrics.record_cache(outcome);
        }
        let mut record = Record::new(Level::Info, module, "handled")
            .with_field("result_count", output.stats.result_count as i64);
        if let Some(outcome) = output.stats.cache {
            record = record.with_field("cache", outcome.as_str());
        }
        if let Some(ms) = output.stats.upstream_ms {
            record = record.with_field("upstream_ms", ms as i64);
        }
        self.scoped(event).log(record);
    }

    fn log_event(&self, event: &Event, module: &str, level: Level, message: &str) {
        self.scoped(event).log(Record::new(level, module, message));
    }

    fn scoped(&self, event: &Event) -> crate::logsink::ScopedSink<MultiSink> {
        crate::logsink::ScopedSink::new(
            self.ctx.events_log.clone(),
            LogScope {
                user_id: Some(event.user_id.clone()),
                chat_id: Some(event.chat_id.clone()),
                request_id: None,
                event_id: Some(event.event_id.clone()),
                message_id: event.message_id.clone(),
            },
        )
    }
}

/// Postback payloads are urlencoded pairs with a mandatory `intent` key,
/// e.g. `intent=course_detail&uid=1131U0690`.
pub fn parse_postback(data: &str) -> Option<NextIntent> {
    let mut intent = None;
    let mut params = HashMap::new();
    for pair in data.split('&') {
        let (key, value) = pair.split_once('=')?;
        let value = urlencoding::decode(value).ok()?.into_owned();
        if key == "intent" {
            intent = Some(value);
        } else {
            params.insert(key.to_string(), value);
        }
    }
    Some(NextIntent {
        intent: intent?,
        params,
    })
}

/// Build a postback payload in the format `parse_postback` reads.
pub fn encode_postback(intent: &str, params: &[(&str, &str)]) -> String {
    let mut out = format!("intent={intent}");
    for (key, value) in params {
        out.push('&');
        out.push_str(key);
        out.push('=');
        out.push_str(&urlencoding::encode(value));
    }
    out
}

/// Stopwatch for upstream latency accounting.
pub struct UpstreamTimer(Instant);

impl UpstreamTimer {
    pub fn start() -> Self {
        Self(Instant::now())
    }

    pub fn stop(self) -> u64 {
        self.0.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_prefix() {
        let p = Pattern::Prefix("學號");
        assert!(p.matches("學號 41247001"));
        assert!(p.matches("  學號41247001"));
        assert!(!p.matches("我的學號"));
    }

    #[test]
    fn test_pattern_keyword() {
        let p = Pattern::Keyword(Regex::new("電話|分機").unwrap());
        assert!(p.matches("資工系的電話多少"));
        assert!(!p.matches("課程查詢"));
    }

    #[test]
    fn test_postback_round_trip() {
        let data = encode_postback("course_detail", &[("uid", "1131U0690")]);
        let next = parse_postback(&data).unwrap();
        assert_eq!(next.intent, "course_detail");
        assert_eq!(next.params["uid"], "1131U0690");
    }

    #[test]
    fn test_postback_encodes_reserved_chars() {
        let data = encode_postback("contact", &[("query", "資工 系&班")]);
        let next = parse_postback(&data).unwrap();
        assert_eq!(next.params["query"], "資工 系&班");
    }

    #[test]
    fn test_postback_rejects_missing_intent() {
        assert!(parse_postback("uid=123").is_none());
        assert!(parse_postback("garbage").is_none());
    }
}
