// src/server.rs
// Request lifecycle, health probes, webhook endpoint, graceful shutdown

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Redirect},
    routing::{get, post},
};
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::dispatch::{BotContext, Dispatcher};
use crate::error::Result;
use crate::index::CourseIndex;
use crate::intent::IntentParser;
use crate::limiter::{KeyedLimiter, spawn_sweeper};
use crate::logsink::{AsyncSink, Level, MultiSink, Sink, StderrSink, Transport};
use crate::metrics::Metrics;
use crate::platform::{ReplyClient, parse_webhook, verify_signature};
use crate::scrape::{ScrapeClient, Site, default_base_urls};
use crate::store::Store;
use crate::warmup::Warmup;

/// Upstream probe budget for the readiness endpoint.
const READY_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Project homepage for the root redirect.
const HOMEPAGE: &str = "https://www.ntpu.edu.tw";

/// Idle-key sweep period for the rate limiter.
const LIMITER_SWEEP_PERIOD: Duration = Duration::from_secs(300);

/// Shared request state.
#[derive(Clone)]
pub struct AppState {
    pub bot: Arc<BotContext>,
    pub dispatcher: Arc<Dispatcher>,
    pub reply: Option<Arc<ReplyClient>>,
    pub channel_secret: Option<String>,
    pub remote_sink: Option<Arc<AsyncSink>>,
    /// Flipped at the shutdown signal, before any cancellation: readiness
    /// and the webhook turn away new work first.
    pub shutting_down: Arc<AtomicBool>,
}

/// Create the router. The outer write timeout sits above the webhook
/// handler deadline, so the handler always times out first and can still
/// send its busy reply.
pub fn create_router(state: AppState) -> Router {
    let write_timeout = state.bot.config.webhook_timeout + Duration::from_secs(5);
    Router::new()
        .route("/", get(|| async { Redirect::permanent(HOMEPAGE) }))
        // axum's get() answers HEAD as well
        .route("/healthz", get(healthz))
        .route("/ready", get(ready))
        .route("/callback", post(callback))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(write_timeout))
        .with_state(state)
}

/// Liveness: the process is up. No dependency checks.
async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// Readiness: store pings plus a cheap probe of the primary upstream's
/// first mirror.
async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    if state.shutting_down.load(Ordering::SeqCst) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "shutting down"})),
        );
    }

    if let Err(e) = state.bot.store.ready().await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "store unavailable", "reason": e.to_string()})),
        );
    }

    // Primary upstream: first mirror of the course site answers < 500
    if let Some(primary) = state.bot.scraper.base_urls(Site::Courses).first() {
        let probe = reqwest::Client::new()
            .head(primary)
            .timeout(READY_PROBE_TIMEOUT)
            .send()
            .await;
        match probe {
            Ok(response) if response.status().as_u16() < 500 => {}
            Ok(response) => {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(serde_json::json!({
                        "status": "upstream degraded",
                        "reason": format!("primary mirror returned {}", response.status()),
                    })),
                );
            }
            Err(e) => {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(serde_json::json!({
                        "status": "upstream unreachable",
                        "reason": e.to_string(),
                    })),
                );
            }
        }
    }

    (StatusCode::OK, Json(serde_json::json!({"status": "ready"})))
}

/// Chat-platform webhook: verify, parse the event batch, dispatch, reply.
async fn callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if state.shutting_down.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    if let Some(secret) = &state.channel_secret {
        let signature = headers
            .get("x-line-signature")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !verify_signature(secret, &body, signature) {
            tracing::warn!("webhook signature verification failed");
            return StatusCode::FORBIDDEN;
        }
    }

    let events = match parse_webhook(&body) {
        Ok(events) => events,
        Err(e) => {
            tracing::warn!("unparseable webhook body: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };

    // Events are handled before the 200 goes back: the reply token is only
    // valid inside the platform's reply window and retrying a webhook
    // delivery would double-handle the batch.
    for event in events {
        let token = CancellationToken::new();
        let messages = state.dispatcher.handle_event(token, &event).await;
        if messages.is_empty() {
            continue;
        }
        if let Some(reply) = &state.reply {
            if let Err(e) = reply.reply(&event.reply_token, &messages).await {
                tracing::warn!(event_id = %event.event_id, "reply failed: {}", e);
            }
        }
    }

    StatusCode::OK
}

/// Text-format metrics scrape.
async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    // Gauges sourced at scrape time
    state.bot.metrics.limiter_active_keys.store(
        state.bot.limiter.active_keys() as i64,
        Ordering::Relaxed,
    );
    state
        .bot
        .metrics
        .index_docs
        .store(state.bot.index.count() as i64, Ordering::Relaxed);
    if let Some(sink) = &state.remote_sink {
        state.bot.metrics.log_drops.store(sink.dropped(), Ordering::Relaxed);
    }
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.bot.metrics.render(),
    )
}

/// HTTP transport for the remote log sink.
struct HttpLogTransport {
    http: reqwest::Client,
    endpoint: String,
}

impl Transport for HttpLogTransport {
    fn send(
        &self,
        line: String,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = std::result::Result<(), String>> + Send + '_>>
    {
        Box::pin(async move {
            self.http
                .post(&self.endpoint)
                .header("content-type", "application/json")
                .body(line)
                .send()
                .await
                .map_err(|e| e.to_string())?;
            Ok(())
        })
    }
}

/// Build the composition root and run the server until a shutdown signal.
///
/// Shutdown ordering: flip the 503 flag, stop accepting, cancel the shared
/// token, join background tasks bounded by `SHUTDOWN_TIMEOUT`, flush the
/// log sink, and drop the store last.
pub async fn serve(config: Config) -> Result<()> {
    let config = Arc::new(config);
    let metrics = Arc::new(Metrics::default());
    let shutdown = CancellationToken::new();

    // Store first: everything else reads through it.
    let store = Arc::new(Store::open(&config.sqlite_path).await?);

    let http = crate::http::create_shared_client(config.scraper.timeout);
    let scraper = Arc::new(ScrapeClient::new(
        http.clone(),
        default_base_urls(),
        config.scraper.clone(),
        metrics.clone(),
    ));

    let limiter = Arc::new(KeyedLimiter::new(&config.limiter));
    let index = Arc::new(CourseIndex::new());

    // Serve yesterday's data immediately: the cached syllabi are indexed
    // before the first warmup cycle runs.
    if let Err(e) = index.rebuild_from_store(&store).await {
        tracing::warn!("initial index build failed: {}", e);
    }
    metrics
        .index_docs
        .store(index.count() as i64, Ordering::Relaxed);

    let intent = IntentParser::from_key(http.clone(), config.keys.llm.as_deref()).map(Arc::new);

    // Event log: local stderr always; remote sink when configured.
    let mut event_sinks: Vec<Arc<dyn Sink>> = vec![Arc::new(StderrSink {
        min_level: Level::Info,
    })];
    let remote_sink = std::env::var("LOG_SINK_URL").ok().map(|endpoint| {
        Arc::new(AsyncSink::spawn(
            HttpLogTransport {
                http: http.clone(),
                endpoint,
            },
            1024,
            Level::Info,
        ))
    });
    if let Some(sink) = &remote_sink {
        event_sinks.push(sink.clone());
    }
    let events_log = Arc::new(MultiSink::new(event_sinks));

    let bot = Arc::new(BotContext {
        config: config.clone(),
        store: store.clone(),
        scraper: scraper.clone(),
        index: index.clone(),
        limiter: limiter.clone(),
        metrics: metrics.clone(),
        intent,
        events_log,
    });
    let dispatcher = Arc::new(Dispatcher::new(bot.clone()));

    let reply = config
        .keys
        .channel_token
        .clone()
        .map(|token| Arc::new(ReplyClient::new(http.clone(), token)));

    let state = AppState {
        bot: bot.clone(),
        dispatcher,
        reply,
        channel_secret: config.keys.channel_secret.clone(),
        remote_sink: remote_sink.clone(),
        shutting_down: Arc::new(AtomicBool::new(false)),
    };

    // Background tasks, all on the shared token.
    let mut background = Vec::new();
    background.push(tokio::spawn(
        Warmup::new(
            config.clone(),
            store.clone(),
            scraper.clone(),
            index.clone(),
            metrics.clone(),
            shutdown.clone(),
        )
        .run_loop(),
    ));
    background.push(spawn_sweeper(
        limiter.clone(),
        LIMITER_SWEEP_PERIOD,
        shutdown.clone(),
    ));

    let listener =
        tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await.map_err(crate::error::BotError::Io)?;
    tracing::info!(port = config.port, "listening");

    let shutting_down = state.shutting_down.clone();
    let router = create_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // New webhook requests see 503 from this moment on, before any
            // background task loses its context.
            shutting_down.store(true, Ordering::SeqCst);
            tracing::info!("shutdown signal received");
        })
        .await
        .map_err(crate::error::BotError::Io)?;

    // Connections drained; now cancel the background work.
    shutdown.cancel();
    let join_all = futures::future::join_all(background);
    if tokio::time::timeout(config.shutdown_timeout, join_all).await.is_err() {
        tracing::warn!("background tasks did not stop within {:?}", config.shutdown_timeout);
    }

    // Flush the remote log sink before the store goes away.
    if let Some(sink) = &remote_sink {
        sink.shutdown(config.shutdown_timeout).await;
    }

    // The store drops last when the remaining Arcs unwind here.
    drop(bot);
    drop(store);
    tracing::info!("shutdown complete");
    Ok(())
}

/// SIGTERM or ctrl-c.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
