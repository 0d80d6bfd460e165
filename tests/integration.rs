//! End-to-end scenarios: dispatcher, warmup, and router driven against an
//! in-memory store and stub upstream listeners.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::{Router, routing::any};
use tokio_util::sync::CancellationToken;

use ntpu_bot::config::{Config, LimiterConfig, ScraperConfig};
use ntpu_bot::dispatch::{BotContext, Dispatcher};
use ntpu_bot::index::CourseIndex;
use ntpu_bot::limiter::KeyedLimiter;
use ntpu_bot::logsink::{Level, MultiSink, StderrSink};
use ntpu_bot::metrics::Metrics;
use ntpu_bot::platform::{Event, EventKind, ReplyMessage};
use ntpu_bot::scrape::{ScrapeClient, Site};
use ntpu_bot::store::Store;
use ntpu_bot::store::types::{Student, Syllabus};
use ntpu_bot::warmup::Warmup;

/// Scraper settings tuned for tests: tiny backoff cap, no politeness delay.
fn test_scraper_config(max_retries: u32) -> ScraperConfig {
    ScraperConfig {
        timeout: Duration::from_secs(2),
        max_retries,
        min_delay: Duration::ZERO,
        max_delay: Duration::from_millis(20),
        workers: 2,
    }
}

struct TestBot {
    bot: Arc<BotContext>,
    dispatcher: Dispatcher,
}

impl TestBot {
    async fn new(base_urls: HashMap<Site, Vec<String>>, limiter: LimiterConfig) -> Self {
        Self::with_retries(base_urls, limiter, 0).await
    }

    async fn with_retries(
        base_urls: HashMap<Site, Vec<String>>,
        limiter: LimiterConfig,
        max_retries: u32,
    ) -> Self {
        let mut config = Config::default();
        config.limiter = limiter;
        config.scraper = test_scraper_config(max_retries);
        let config = Arc::new(config);

        let metrics = Arc::new(Metrics::default());
        let store = Arc::new(Store::open_in_memory().await.expect("in-memory store"));
        let scraper = Arc::new(ScrapeClient::new(
            reqwest::Client::new(),
            base_urls,
            config.scraper.clone(),
            metrics.clone(),
        ));

        let bot = Arc::new(BotContext {
            config: config.clone(),
            store,
            scraper,
            index: Arc::new(CourseIndex::new()),
            limiter: Arc::new(KeyedLimiter::new(&config.limiter)),
            metrics,
            intent: None,
            events_log: Arc::new(MultiSink::new(vec![Arc::new(StderrSink {
                min_level: Level::Error,
            })])),
        });
        let dispatcher = Dispatcher::new(bot.clone());
        Self { bot, dispatcher }
    }

    async fn send(&self, user: &str, text: &str) -> Vec<ReplyMessage> {
        let event = Event {
            user_id: user.to_string(),
            chat_id: user.to_string(),
            event_id: format!("ev-{text}"),
            message_id: Some("m-1".to_string()),
            reply_token: "rt-1".to_string(),
            kind: EventKind::Text(text.to_string()),
        };
        self.dispatcher
            .handle_event(CancellationToken::new(), &event)
            .await
    }
}

fn first_text(messages: &[ReplyMessage]) -> &str {
    messages
        .first()
        .and_then(|m| m.as_text())
        .expect("expected a text reply")
}

/// Spawn a stub upstream on an ephemeral port, returning its base URL.
async fn spawn_stub(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub");
    let addr = listener.local_addr().expect("stub addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}")
}

fn stub_html(html: &'static str) -> Router {
    Router::new().fallback(any(move || async move {
        ([("content-type", "text/html; charset=utf-8")], html)
    }))
}

fn sample_student() -> Student {
    Student {
        id: "41247001".into(),
        name: "陳小明".into(),
        year: 112,
        department: "資工系".into(),
        cached_at: 0,
    }
}

fn sample_syllabus(uid: &str, title: &str, outline: &str) -> Syllabus {
    Syllabus {
        uid: uid.into(),
        title: title.into(),
        teachers: vec!["張老師".into()],
        year: 113,
        term: 1,
        objectives: "課程目標".into(),
        outline: outline.into(),
        schedule: "week 1-18".into(),
        content_hash: Syllabus::compute_hash(title, "課程目標", outline, "week 1-18"),
        cached_at: 0,
    }
}

// ── S1: cached student ID lookup ──

#[tokio::test]
async fn s1_cached_student_lookup() {
    let bot = TestBot::new(HashMap::new(), LimiterConfig::default()).await;
    bot.bot
        .store
        .save_student(sample_student())
        .await
        .expect("preload");

    let replies = bot.send("U1", "學號 41247001").await;
    let text = first_text(&replies);
    for field in ["41247001", "陳小明", "112", "資工系"] {
        assert!(text.contains(field), "missing {field} in {text}");
    }
    assert_eq!(bot.bot.metrics.cache_hits.load(Ordering::Relaxed), 1);
    assert_eq!(bot.bot.metrics.cache_misses.load(Ordering::Relaxed), 0);
}

// ── S2: miss with upstream no-match ──

#[tokio::test]
async fn s2_student_miss_upstream_not_found() {
    let upstream = spawn_stub(stub_html("<html><body>查無資料</body></html>")).await;
    let bot = TestBot::new(
        HashMap::from([(Site::Enrollment, vec![upstream])]),
        LimiterConfig::default(),
    )
    .await;

    let replies = bot.send("U1", "00000000").await;
    assert!(first_text(&replies).contains("查無此學號"));
    assert_eq!(bot.bot.metrics.cache_misses.load(Ordering::Relaxed), 1);
    assert_eq!(bot.bot.metrics.not_found.load(Ordering::Relaxed), 1);
}

// ── S3: department code fuzzy lookup ──

#[tokio::test]
async fn s3_department_code_fuzzy() {
    let bot = TestBot::new(HashMap::new(), LimiterConfig::default()).await;
    let replies = bot.send("U1", "系 資工").await;
    let text = first_text(&replies);
    assert!(text.contains("資訊工程學系"), "{text}");
    assert!(text.contains("85"), "{text}");
}

// ── S4: emergency card needs no I/O ──

#[tokio::test]
async fn s4_emergency_zero_io() {
    // No upstream mirrors at all, empty store: the card still renders.
    let bot = TestBot::new(HashMap::new(), LimiterConfig::default()).await;
    let replies = bot.send("U1", "緊急").await;
    let text = first_text(&replies);
    for (name, number) in ntpu_bot::dispatch::emergency::EMERGENCY_NUMBERS {
        assert!(text.contains(name));
        assert!(text.contains(number));
    }
}

// ── S5: course lexical search ──

#[tokio::test]
async fn s5_course_lexical_search() {
    let bot = TestBot::new(HashMap::new(), LimiterConfig::default()).await;
    bot.bot
        .store
        .save_syllabus(sample_syllabus("1131U0690", "雲端運算", "AWS Lambda 虛擬化"))
        .await
        .expect("preload");
    bot.bot
        .store
        .save_syllabus(sample_syllabus("1131U0700", "資料結構", "樹 堆疊 雜湊"))
        .await
        .expect("preload");
    bot.bot
        .index
        .rebuild_from_store(&bot.bot.store)
        .await
        .expect("index build");

    let replies = bot.send("U1", "課程 AWS").await;
    let text = first_text(&replies);
    assert!(text.contains("雲端運算"), "{text}");
    assert!(text.contains("最佳比對"), "{text}");
    assert!(!text.contains("資料結構"), "unrelated course leaked: {text}");

    // Top hit carries confidence exactly 1.0
    let hits = bot.bot.index.search_courses("AWS", 5);
    assert_eq!(hits[0].confidence, 1.0);
}

// ── S6: rate-limit rejection ──

#[tokio::test]
async fn s6_rate_limit_rejection() {
    let bot = TestBot::new(
        HashMap::new(),
        LimiterConfig {
            burst: 3.0,
            refill_rate: 0.1,
            daily_limit: 0,
        },
    )
    .await;
    bot.bot
        .store
        .save_student(sample_student())
        .await
        .expect("preload");

    for _ in 0..3 {
        let replies = bot.send("U1", "學號 41247001").await;
        assert!(first_text(&replies).contains("41247001"));
    }
    let replies = bot.send("U1", "學號 41247001").await;
    assert!(first_text(&replies).contains("稍候"), "{:?}", replies);
    assert_eq!(bot.bot.metrics.rate_limited.load(Ordering::Relaxed), 1);
    assert_eq!(bot.bot.limiter.drops(), 1);
}

// ── S7: warmup against a dead upstream keeps yesterday's index ──

#[tokio::test]
async fn s7_warmup_degraded_keeps_index() {
    // Upstream always 500s
    let failing = spawn_stub(Router::new().fallback(any(|| async {
        axum::http::StatusCode::INTERNAL_SERVER_ERROR
    })))
    .await;

    let mut config = Config::default();
    config.scraper = test_scraper_config(0);
    config.warmup_modules = vec!["courses".to_string()];
    let config = Arc::new(config);

    let metrics = Arc::new(Metrics::default());
    let store = Arc::new(Store::open_in_memory().await.expect("store"));
    let scraper = Arc::new(ScrapeClient::new(
        reqwest::Client::new(),
        HashMap::from([(Site::Courses, vec![failing])]),
        config.scraper.clone(),
        metrics.clone(),
    ));
    let index = Arc::new(CourseIndex::new());

    // Yesterday's data
    store
        .save_syllabus(sample_syllabus("1131U0690", "雲端運算", "AWS"))
        .await
        .expect("preload");
    index.rebuild_from_store(&store).await.expect("index");
    assert_eq!(index.count(), 1);

    let warmup = Warmup::new(
        config,
        store,
        scraper,
        index.clone(),
        metrics,
        CancellationToken::new(),
    );
    let report = warmup.run_once().await;

    let courses = report
        .modules
        .iter()
        .find(|m| m.module == "courses")
        .expect("courses module ran");
    assert!(courses.is_degraded(), "{courses:?}");
    assert!(!report.index_rebuilt);
    // The previous index still serves
    assert_eq!(index.count(), 1);
    assert_eq!(index.search_courses("AWS", 5).len(), 1);
}

// ── Property 10: mirror failover ──

#[tokio::test]
async fn scraper_failover_counts_attempts() {
    let first_attempts = Arc::new(AtomicU32::new(0));
    let second_attempts = Arc::new(AtomicU32::new(0));

    let counter = first_attempts.clone();
    let always_503 = Router::new().fallback(any(move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            axum::http::StatusCode::SERVICE_UNAVAILABLE
        }
    }));
    let counter = second_attempts.clone();
    let always_200 = Router::new().fallback(any(move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            (
                [("content-type", "text/html; charset=utf-8")],
                "<html><body>ok</body></html>",
            )
        }
    }));

    let bad = spawn_stub(always_503).await;
    let good = spawn_stub(always_200).await;

    let max_retries = 2;
    let metrics = Arc::new(Metrics::default());
    let scraper = ScrapeClient::new(
        reqwest::Client::new(),
        HashMap::from([(Site::Courses, vec![bad, good])]),
        test_scraper_config(max_retries),
        metrics.clone(),
    );

    let body = scraper
        .get(&CancellationToken::new(), Site::Courses, "/anything")
        .await
        .expect("second mirror succeeds");
    assert!(body.contains("ok"));

    assert_eq!(
        first_attempts.load(Ordering::SeqCst),
        max_retries + 1,
        "first mirror gets max_retries + 1 attempts"
    );
    assert_eq!(second_attempts.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.scrape_success.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.scrape_failures.load(Ordering::Relaxed), 0);
}

// ── Stale record served when upstream is unreachable ──

#[tokio::test]
async fn stale_student_served_on_upstream_outage() {
    let mut config = Config::default();
    config.cache_ttl = Duration::ZERO; // everything is instantly stale
    config.scraper = test_scraper_config(0);
    let config = Arc::new(config);

    let metrics = Arc::new(Metrics::default());
    let store = Arc::new(Store::open_in_memory().await.expect("store"));
    store.save_student(sample_student()).await.expect("preload");

    // Unroutable mirror: connection refused immediately
    let scraper = Arc::new(ScrapeClient::new(
        reqwest::Client::new(),
        HashMap::from([(Site::Enrollment, vec!["http://127.0.0.1:1".to_string()])]),
        config.scraper.clone(),
        metrics.clone(),
    ));

    let bot = Arc::new(BotContext {
        config: config.clone(),
        store,
        scraper,
        index: Arc::new(CourseIndex::new()),
        limiter: Arc::new(KeyedLimiter::new(&config.limiter)),
        metrics,
        intent: None,
        events_log: Arc::new(MultiSink::new(vec![Arc::new(StderrSink {
            min_level: Level::Error,
        })])),
    });
    let dispatcher = Dispatcher::new(bot.clone());

    let event = Event {
        user_id: "U1".into(),
        chat_id: "U1".into(),
        event_id: "ev-stale".into(),
        message_id: None,
        reply_token: "rt".into(),
        kind: EventKind::Text("學號 41247001".into()),
    };
    let replies = dispatcher.handle_event(CancellationToken::new(), &event).await;
    let text = first_text(&replies);
    assert!(text.contains("陳小明"), "{text}");
    assert!(text.contains("資料可能不是最新的"), "{text}");
}

// ── Router surface ──

mod router {
    use super::*;
    use http_body_util::BodyExt;
    use ntpu_bot::server::{AppState, create_router};
    use std::sync::atomic::AtomicBool;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let bot = TestBot::new(HashMap::new(), LimiterConfig::default()).await;
        AppState {
            dispatcher: Arc::new(Dispatcher::new(bot.bot.clone())),
            bot: bot.bot,
            reply: None,
            channel_secret: None,
            remote_sink: None,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    #[tokio::test]
    async fn healthz_is_ok_without_dependencies() {
        let router = create_router(test_state().await);
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/healthz")
                    .body(axum::body::Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("ok"));
    }

    #[tokio::test]
    async fn root_redirects_permanently() {
        let router = create_router(test_state().await);
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .body(axum::body::Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), axum::http::StatusCode::PERMANENT_REDIRECT);
    }

    #[tokio::test]
    async fn metrics_scrape_exposes_counters() {
        let state = test_state().await;
        state
            .bot
            .metrics
            .cache_hits
            .fetch_add(3, Ordering::Relaxed);
        let router = create_router(state);
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/metrics")
                    .body(axum::body::Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let body = response.into_body().collect().await.expect("body").to_bytes();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("bot_cache_hits_total 3"), "{text}");
    }

    #[tokio::test]
    async fn callback_handles_event_batch() {
        let state = test_state().await;
        let metrics = state.bot.metrics.clone();
        let router = create_router(state);

        let body = serde_json::json!({
            "events": [{
                "type": "message",
                "webhookEventId": "ev-1",
                "replyToken": "rt-1",
                "source": {"userId": "U1"},
                "message": {"id": "m-1", "type": "text", "text": "緊急"}
            }]
        });
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/callback")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        assert_eq!(metrics.webhook_events.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn callback_rejects_bad_signature() {
        let mut state = test_state().await;
        state.channel_secret = Some("secret".to_string());
        let router = create_router(state);

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/callback")
                    .header("x-line-signature", "bm90LXRoZS1yaWdodC1tYWM=")
                    .body(axum::body::Body::from(r#"{"events":[]}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), axum::http::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn shutdown_flag_turns_webhook_away() {
        let state = test_state().await;
        state.shutting_down.store(true, Ordering::SeqCst);
        let router = create_router(state);

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/callback")
                    .body(axum::body::Body::from(r#"{"events":[]}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(
            response.status(),
            axum::http::StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
