// src/logsink.rs
// Non-blocking structured log shipping: bounded queue, fan-out, drop accounting
//
// `tracing` carries process diagnostics; this module carries the structured
// JSON event records that leave the process (remote sinks, audit files).
// A logging call on the request path never blocks: on a full queue the
// record is dropped and counted.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

/// Severity. `Warn` serializes as `"warning"` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warning",
            Level::Error => "error",
        }
    }
}

impl Serialize for Level {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One structured log record. Clones are cheap enough to hand one copy per
/// sink so sinks cannot observe each other's mutations.
#[derive(Debug, Clone, Serialize)]
pub struct Record {
    /// Epoch seconds
    pub timestamp: i64,
    pub level: Level,
    pub message: String,
    pub module: String,
    #[serde(flatten)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl Record {
    pub fn new(level: Level, module: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp(),
            level,
            module: module.into(),
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// One JSON object per line.
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"level\":\"error\",\"message\":\"unserializable record from {}\"}}",
                self.module
            )
        })
    }
}

/// A destination for records. `log` must never block.
pub trait Sink: Send + Sync {
    fn enabled(&self, level: Level) -> bool;
    fn log(&self, record: Record);
}

/// Request-scoped attribution injected by [`ScopedSink`].
#[derive(Debug, Clone, Default)]
pub struct LogScope {
    pub user_id: Option<String>,
    pub chat_id: Option<String>,
    pub request_id: Option<String>,
    pub event_id: Option<String>,
    pub message_id: Option<String>,
}

impl LogScope {
    fn apply(&self, record: &mut Record) {
        let pairs = [
            ("user_id", &self.user_id),
            ("chat_id", &self.chat_id),
            ("request_id", &self.request_id),
            ("event_id", &self.event_id),
            ("message_id", &self.message_id),
        ];
        for (key, value) in pairs {
            if let Some(v) = value {
                record
                    .fields
                    .insert(key.to_string(), serde_json::Value::String(v.clone()));
            }
        }
    }
}

/// Wraps a sink, stamping every record with the ids of the request it
/// travelled with. A record logged without a scope simply lacks the fields;
/// they are never fabricated.
pub struct ScopedSink<S> {
    inner: Arc<S>,
    scope: LogScope,
}

impl<S: Sink> ScopedSink<S> {
    pub fn new(inner: Arc<S>, scope: LogScope) -> Self {
        Self { inner, scope }
    }
}

impl<S: Sink> Sink for ScopedSink<S> {
    fn enabled(&self, level: Level) -> bool {
        self.inner.enabled(level)
    }

    fn log(&self, mut record: Record) {
        if !self.inner.enabled(record.level) {
            return;
        }
        self.scope.apply(&mut record);
        self.inner.log(record);
    }
}

/// Where an async sink's consumer forwards drained records.
///
/// Implementations may suspend; they run on the consumer task, never on the
/// producer's path.
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        line: String,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send + '_>>;
}

/// Bounded-queue sink with one consumer task. Producers `try_send`; a full
/// queue drops the record and bumps the counter.
pub struct AsyncSink {
    /// Taken (dropped) on shutdown to close the channel; records arriving
    /// after that are counted as drops.
    tx: std::sync::RwLock<Option<mpsc::Sender<Record>>>,
    min_level: Level,
    dropped: Arc<AtomicU64>,
    consumer: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AsyncSink {
    /// Spawn the consumer and return the sink. `capacity` bounds the queue.
    pub fn spawn<T: Transport>(transport: T, capacity: usize, min_level: Level) -> Self {
        let (tx, mut rx) = mpsc::channel::<Record>(capacity.max(1));
        let consumer = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let line = record.to_json_line();
                if let Err(e) = transport.send(line).await {
                    tracing::debug!("log transport send failed: {}", e);
                }
            }
        });
        Self {
            tx: std::sync::RwLock::new(Some(tx)),
            min_level,
            dropped: Arc::new(AtomicU64::new(0)),
            consumer: std::sync::Mutex::new(Some(consumer)),
        }
    }

    /// Records dropped on a full queue since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the queue and wait (bounded) for the consumer to drain.
    pub async fn shutdown(&self, timeout: Duration) {
        // Dropping the sender closes the channel; the consumer exits after
        // draining whatever is queued.
        self.tx.write().unwrap_or_else(|e| e.into_inner()).take();
        let handle = self.consumer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                tracing::warn!("log sink drain timed out after {:?}", timeout);
            }
        }
    }
}

impl Sink for AsyncSink {
    fn enabled(&self, level: Level) -> bool {
        level >= self.min_level
    }

    fn log(&self, record: Record) {
        if !self.enabled(record.level) {
            return;
        }
        let tx = self.tx.read().unwrap_or_else(|e| e.into_inner());
        match tx.as_ref() {
            Some(tx) if tx.try_send(record).is_ok() => {}
            _ => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Fans a record out to N inner sinks, one clone per sink. The enabled
/// check short-circuits before any clone happens.
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Arc<dyn Sink>>,
}

impl MultiSink {
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn Sink>) {
        self.sinks.push(sink);
    }
}

impl Sink for MultiSink {
    fn enabled(&self, level: Level) -> bool {
        self.sinks.iter().any(|s| s.enabled(level))
    }

    fn log(&self, record: Record) {
        for sink in &self.sinks {
            if sink.enabled(record.level) {
                sink.log(record.clone());
            }
        }
    }
}

/// Writes JSON lines to local stderr. The always-available local sink.
pub struct StderrSink {
    pub min_level: Level,
}

impl Sink for StderrSink {
    fn enabled(&self, level: Level) -> bool {
        level >= self.min_level
    }

    fn log(&self, record: Record) {
        eprintln!("{}", record.to_json_line());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Transport that records what it received, optionally stalling forever.
    struct CaptureTransport {
        lines: Arc<Mutex<Vec<String>>>,
        stall: bool,
    }

    impl Transport for CaptureTransport {
        fn send(
            &self,
            line: String,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send + '_>>
        {
            let lines = self.lines.clone();
            let stall = self.stall;
            Box::pin(async move {
                if stall {
                    std::future::pending::<()>().await;
                }
                lines.lock().unwrap().push(line);
                Ok(())
            })
        }
    }

    #[test]
    fn test_warn_serializes_as_warning() {
        let record = Record::new(Level::Warn, "dispatch", "slow upstream");
        let line = record.to_json_line();
        assert!(line.contains("\"level\":\"warning\""), "{line}");
    }

    #[test]
    fn test_scope_fields_injected_not_fabricated() {
        let mut record = Record::new(Level::Info, "dispatch", "hit");
        LogScope {
            user_id: Some("U1".into()),
            chat_id: None,
            request_id: Some("r-9".into()),
            event_id: None,
            message_id: None,
        }
        .apply(&mut record);

        let line = record.to_json_line();
        assert!(line.contains("\"user_id\":\"U1\""));
        assert!(line.contains("\"request_id\":\"r-9\""));
        assert!(!line.contains("chat_id"));
    }

    #[tokio::test]
    async fn test_async_sink_delivers() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = AsyncSink::spawn(
            CaptureTransport {
                lines: lines.clone(),
                stall: false,
            },
            16,
            Level::Debug,
        );

        sink.log(Record::new(Level::Info, "test", "one"));
        sink.log(Record::new(Level::Info, "test", "two"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lines.lock().unwrap().len(), 2);
        assert_eq!(sink.dropped(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = AsyncSink::spawn(
            CaptureTransport {
                lines,
                stall: true, // consumer never drains
            },
            2,
            Level::Debug,
        );

        let started = std::time::Instant::now();
        // Capacity 2 plus one record stuck in the consumer; the rest drop.
        for i in 0..10 {
            sink.log(Record::new(Level::Info, "test", format!("r{i}")));
        }
        // Never blocks: ten try_sends complete within milliseconds
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(sink.dropped() >= 7, "dropped {}", sink.dropped());
    }

    #[tokio::test]
    async fn test_level_gate_short_circuits() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = AsyncSink::spawn(
            CaptureTransport {
                lines: lines.clone(),
                stall: false,
            },
            16,
            Level::Warn,
        );
        sink.log(Record::new(Level::Debug, "test", "ignored"));
        sink.log(Record::new(Level::Error, "test", "kept"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lines.lock().unwrap().len(), 1);
        assert_eq!(sink.dropped(), 0, "disabled levels are not drops");
    }

    #[tokio::test]
    async fn test_multi_sink_fans_out_clones() {
        let a_lines = Arc::new(Mutex::new(Vec::new()));
        let b_lines = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::new(AsyncSink::spawn(
            CaptureTransport {
                lines: a_lines.clone(),
                stall: false,
            },
            16,
            Level::Debug,
        ));
        let b = Arc::new(AsyncSink::spawn(
            CaptureTransport {
                lines: b_lines.clone(),
                stall: false,
            },
            16,
            Level::Error,
        ));

        let multi = MultiSink::new(vec![a, b]);
        multi.log(Record::new(Level::Info, "test", "info goes to a only"));
        multi.log(Record::new(Level::Error, "test", "error goes to both"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a_lines.lock().unwrap().len(), 2);
        assert_eq!(b_lines.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_drops() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = AsyncSink::spawn(
            CaptureTransport {
                lines: lines.clone(),
                stall: false,
            },
            16,
            Level::Debug,
        );
        sink.log(Record::new(Level::Info, "test", "queued"));
        sink.shutdown(Duration::from_secs(1)).await;
        assert_eq!(lines.lock().unwrap().len(), 1, "queued record drains");

        // Post-shutdown records count as drops
        sink.log(Record::new(Level::Info, "test", "late"));
        assert_eq!(sink.dropped(), 1);
    }

    #[tokio::test]
    async fn test_scoped_sink_wraps() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let inner = Arc::new(AsyncSink::spawn(
            CaptureTransport {
                lines: lines.clone(),
                stall: false,
            },
            16,
            Level::Debug,
        ));
        let scoped = ScopedSink::new(
            inner,
            LogScope {
                user_id: Some("U42".into()),
                ..Default::default()
            },
        );
        scoped.log(Record::new(Level::Info, "dispatch", "handled"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let lines = lines.lock().unwrap();
        assert!(lines[0].contains("\"user_id\":\"U42\""));
    }
}
