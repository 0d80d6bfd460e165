// src/warmup.rs
// Background population and refresh of the store, and index rebuilds
//
// Runs once at process start (spawned, the server listens immediately) and
// again on a daily schedule. Modules run sequentially so they never starve
// the shared scrape client; units inside a module run on a small bounded
// worker pool because the institutional sites rate-limit aggressively.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Local, Timelike};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dispatch::student::DEPARTMENTS;
use crate::error::BotError;
use crate::index::CourseIndex;
use crate::metrics::Metrics;
use crate::scrape::{ScrapeClient, contact, course, sticker, student};
use crate::store::Store;
use crate::store::types::Semester;

/// Student cohorts refreshed per run (current entry year and the three
/// before it; older cohorts have graduated).
const STUDENT_COHORTS: i32 = 4;

/// Administrative units scraped by the contacts module, on top of the
/// department list.
const ADMIN_UNITS: [&str; 6] = ["教務處", "學務處", "總務處", "圖書館", "資訊中心", "體育室"];

/// Per-module outcome of one warmup run.
#[derive(Debug, Clone)]
pub struct ModuleReport {
    pub module: String,
    pub ok: u64,
    pub failed: u64,
}

impl ModuleReport {
    /// Zero successes out of a non-empty unit list.
    pub fn is_degraded(&self) -> bool {
        self.ok == 0 && self.failed > 0
    }
}

/// Outcome of one full warmup cycle.
#[derive(Debug, Clone, Default)]
pub struct WarmupReport {
    pub modules: Vec<ModuleReport>,
    pub index_rebuilt: bool,
    pub swept_rows: usize,
}

/// The warmup pipeline. Owned by the composition root; observes the shared
/// shutdown token at every unit boundary.
pub struct Warmup {
    config: Arc<Config>,
    store: Arc<Store>,
    scraper: Arc<ScrapeClient>,
    index: Arc<CourseIndex>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl Warmup {
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        scraper: Arc<ScrapeClient>,
        index: Arc<CourseIndex>,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            store,
            scraper,
            index,
            metrics,
            shutdown,
        }
    }

    /// Startup run plus the daily schedule. Panics inside a cycle are
    /// contained per unit; the loop itself runs until shutdown.
    pub async fn run_loop(self) {
        tracing::info!("warmup started");
        self.run_once().await;

        loop {
            let sleep = duration_until_hour(self.config.warmup_hour);
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(sleep) => {}
            }
            if self.shutdown.is_cancelled() {
                break;
            }
            self.run_once().await;
        }
        tracing::info!("warmup shutting down");
    }

    /// One full cycle: refresh every enabled module, rebuild the index for
    /// semesters whose syllabus hashes changed, then sweep and self-test.
    pub async fn run_once(&self) -> WarmupReport {
        let mut report = WarmupReport::default();
        let mut changed_semesters: Vec<Semester> = Vec::new();

        for module in &self.config.warmup_modules {
            if self.shutdown.is_cancelled() {
                break;
            }
            let module_report = match module.as_str() {
                "students" => self.refresh_students().await,
                "contacts" => self.refresh_contacts().await,
                "courses" => self.refresh_courses(&mut changed_semesters).await,
                "stickers" => self.refresh_stickers().await,
                other => {
                    tracing::warn!(module = other, "unknown warmup module, skipping");
                    continue;
                }
            };

            self.metrics
                .warmup_units_ok
                .fetch_add(module_report.ok, std::sync::atomic::Ordering::Relaxed);
            self.metrics
                .warmup_units_failed
                .fetch_add(module_report.failed, std::sync::atomic::Ordering::Relaxed);

            if module_report.is_degraded() {
                tracing::warn!(
                    module = %module_report.module,
                    failed = module_report.failed,
                    "warmup module degraded: zero successful units"
                );
            }
            report.modules.push(module_report);
        }

        // Rebuild only when the course module actually changed something;
        // a degraded refresh keeps yesterday's index rather than publishing
        // an empty one.
        if !changed_semesters.is_empty() {
            changed_semesters.sort();
            changed_semesters.dedup();
            match self.index.rebuild_semesters(&self.store, &changed_semesters).await {
                Ok(()) => {
                    report.index_rebuilt = true;
                    self.metrics
                        .index_docs
                        .store(self.index.count() as i64, std::sync::atomic::Ordering::Relaxed);
                    tracing::info!(semesters = ?changed_semesters, "index rebuilt");
                }
                Err(e) => tracing::error!("index rebuild failed: {}", e),
            }
        }

        report.swept_rows = self.final_sweep().await;
        report
    }

    async fn refresh_students(&self) -> ModuleReport {
        let current_year = current_roc_year();
        let units: Vec<(String, i32)> = DEPARTMENTS
            .iter()
            .flat_map(|(_, name)| {
                (0..STUDENT_COHORTS).map(move |back| (name.to_string(), current_year - back))
            })
            .collect();

        self.run_units("students", units, |unit| {
            let store = self.store.clone();
            let scraper = self.scraper.clone();
            let token = self.shutdown.clone();
            async move {
                let (department, year) = unit;
                let students =
                    student::fetch_students_by_unit(&scraper, &token, &department, year).await?;
                for s in students {
                    store
                        .save_student(s)
                        .await
                        .map_err(|e| BotError::Other(e.to_string()))?;
                }
                Ok(())
            }
        })
        .await
    }

    async fn refresh_contacts(&self) -> ModuleReport {
        let units: Vec<String> = ADMIN_UNITS
            .iter()
            .map(|s| s.to_string())
            .chain(DEPARTMENTS.iter().map(|(_, name)| name.to_string()))
            .collect();

        self.run_units("contacts", units, |org| {
            let store = self.store.clone();
            let scraper = self.scraper.clone();
            let token = self.shutdown.clone();
            async move {
                let contacts = contact::fetch_contacts(&scraper, &token, &org).await?;
                for c in contacts {
                    store
                        .save_contact(c)
                        .await
                        .map_err(|e| BotError::Other(e.to_string()))?;
                }
                Ok(())
            }
        })
        .await
    }

    /// Course units are semesters: fetch the catalog, then every course's
    /// syllabus, collecting the semesters whose content hashes moved.
    async fn refresh_courses(&self, changed: &mut Vec<Semester>) -> ModuleReport {
        let semesters = current_semesters();
        let changed_tx = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));

        let report = self
            .run_units("courses", semesters, |semester| {
                let store = self.store.clone();
                let scraper = self.scraper.clone();
                let token = self.shutdown.clone();
                let changed_tx = changed_tx.clone();
                async move {
                    let courses =
                        course::fetch_courses_by_semester(&scraper, &token, semester).await?;
                    for c in &courses {
                        store
                            .save_course(c.clone())
                            .await
                            .map_err(|e| BotError::Other(e.to_string()))?;
                    }
                    for c in &courses {
                        if token.is_cancelled() {
                            return Err(BotError::Cancelled);
                        }
                        match course::fetch_syllabus(&scraper, &token, c).await {
                            Ok(Some(syllabus)) => {
                                let hash_changed = store
                                    .save_syllabus(syllabus)
                                    .await
                                    .map_err(|e| BotError::Other(e.to_string()))?;
                                if hash_changed {
                                    changed_tx
                                        .lock()
                                        .unwrap_or_else(|e| e.into_inner())
                                        .push(semester);
                                }
                            }
                            Ok(None) => {}
                            Err(BotError::Cancelled) => return Err(BotError::Cancelled),
                            // A missing syllabus never fails the semester
                            Err(e) => tracing::debug!(uid = %c.uid, "syllabus fetch failed: {}", e),
                        }
                    }
                    Ok(())
                }
            })
            .await;

        changed.extend(changed_tx.lock().unwrap_or_else(|e| e.into_inner()).drain(..));
        report
    }

    async fn refresh_stickers(&self) -> ModuleReport {
        self.run_units("stickers", vec![()], |()| {
            let store = self.store.clone();
            let scraper = self.scraper.clone();
            let token = self.shutdown.clone();
            async move {
                let stickers = sticker::fetch_stickers(&scraper, &token).await?;
                for s in stickers {
                    store
                        .save_sticker(s)
                        .await
                        .map_err(|e| BotError::Other(e.to_string()))?;
                }
                Ok(())
            }
        })
        .await
    }

    /// Fan units over the bounded worker pool. Per-unit failures are
    /// counted, never fatal; panics are contained at the task join.
    async fn run_units<U, F, Fut>(&self, module: &str, units: Vec<U>, run: F) -> ModuleReport
    where
        U: Send + 'static,
        F: Fn(U) -> Fut,
        Fut: std::future::Future<Output = crate::error::Result<()>> + Send + 'static,
    {
        let mut report = ModuleReport {
            module: module.to_string(),
            ok: 0,
            failed: 0,
        };

        let mut stream = futures::stream::iter(units.into_iter().map(|unit| {
            let fut = run(unit);
            tokio::spawn(fut)
        }))
        .buffer_unordered(self.config.scraper.workers);

        while let Some(joined) = stream.next().await {
            match joined {
                Ok(Ok(())) => report.ok += 1,
                Ok(Err(BotError::Cancelled)) => {
                    tracing::info!(module, "warmup cancelled at unit boundary");
                    break;
                }
                Ok(Err(e)) => {
                    report.failed += 1;
                    tracing::warn!(module, error = %e, "warmup unit failed");
                }
                Err(join_err) => {
                    // A panicking unit is a failed unit, nothing more
                    report.failed += 1;
                    tracing::error!(module, "warmup unit panicked: {}", join_err);
                }
            }
            if self.shutdown.is_cancelled() {
                break;
            }
        }

        tracing::info!(module, ok = report.ok, failed = report.failed, "warmup module done");
        report
    }

    /// TTL sweep plus the report-only integrity check.
    async fn final_sweep(&self) -> usize {
        let swept = match self.store.cleanup_expired(self.config.cache_ttl).await {
            Ok(count) => {
                if count > 0 {
                    tracing::info!(deleted = count, "TTL sweep complete");
                }
                count
            }
            Err(e) => {
                tracing::error!("TTL sweep failed: {}", e);
                0
            }
        };

        match self.store.integrity_check().await {
            Ok(Ok(())) => tracing::debug!("integrity check passed"),
            Ok(Err(verdict)) => {
                self.metrics
                    .integrity_failures
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                tracing::warn!(verdict, "integrity check failed");
            }
            Err(e) => tracing::warn!("integrity check unavailable: {}", e),
        }
        swept
    }
}

/// Current ROC year.
fn current_roc_year() -> i32 {
    Local::now().year() - 1911
}

/// The semester we are in plus the one before it: the pair the catalog
/// refresh targets and the index serves.
pub fn current_semesters() -> Vec<Semester> {
    let now = Local::now();
    let (year, term) = match now.month() {
        8..=12 => (now.year() - 1911, 1),
        1 => (now.year() - 1912, 1),
        _ => (now.year() - 1912, 2),
    };
    let current = Semester::new(year, term as u8);
    let previous = if current.term == 2 {
        Semester::new(current.year, 1)
    } else {
        Semester::new(current.year - 1, 2)
    };
    vec![current, previous]
}

/// Time until the next local occurrence of `hour`:00.
fn duration_until_hour(hour: u32) -> Duration {
    let now = Local::now();
    let today_target = now
        .date_naive()
        .and_hms_opt(hour, 0, 0)
        .unwrap_or_else(|| now.date_naive().and_hms_opt(3, 0, 0).expect("3:00 exists"));
    let target = if now.time().hour() < hour {
        today_target
    } else {
        today_target + chrono::Duration::days(1)
    };
    let seconds = (target - now.naive_local()).num_seconds().max(60);
    Duration::from_secs(seconds as u64)
}
