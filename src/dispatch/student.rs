// dispatch/student.rs
// Student number lookups, name search, and department codes

use std::collections::HashMap;
use std::sync::Arc;

use crate::dispatch::{
    Ctx, Handler, HandlerOutput, HandlerStats, IntentHandler, Matcher, Pattern, UpstreamTimer,
};
use crate::error::{BotError, Result};
use crate::metrics::CacheOutcome;
use crate::platform::ReplyMessage;
use crate::scrape::student::{fetch_student_by_id, is_student_id};
use crate::store::now_epoch;
use crate::store::types::Student;

/// Department codes as used in student numbers and the course catalog.
/// In code, not the store: the table changes once a decade.
pub const DEPARTMENTS: [(&str, &str); 16] = [
    ("11", "中國文學系"),
    ("12", "應用外語學系"),
    ("13", "歷史學系"),
    ("21", "經濟學系"),
    ("22", "社會學系"),
    ("23", "社會工作學系"),
    ("41", "企業管理學系"),
    ("42", "金融與合作經營學系"),
    ("43", "會計學系"),
    ("44", "統計學系"),
    ("45", "休閒運動管理學系"),
    ("71", "法律學系"),
    ("81", "不動產與城鄉環境學系"),
    ("83", "通訊工程學系"),
    ("84", "電機工程學系"),
    ("85", "資訊工程學系"),
];

pub fn matchers() -> Vec<Matcher> {
    vec![
        // A bare 8-9 digit message is a student number
        Matcher {
            priority: 10,
            module: "student",
            pattern: Pattern::Predicate(|text| is_student_id(text.trim())),
            handler: raw_id_handler(),
        },
        Matcher {
            priority: 20,
            module: "student",
            pattern: Pattern::Prefix("學號"),
            handler: Arc::new(|ctx, text| Box::pin(handle_id_command(ctx, text))),
        },
        Matcher {
            priority: 30,
            module: "student",
            pattern: Pattern::Prefix("系"),
            handler: Arc::new(|ctx, text| Box::pin(handle_department(ctx, text))),
        },
    ]
}

pub fn intents() -> Vec<(&'static str, &'static str, IntentHandler)> {
    vec![
        (
            "student",
            "student_by_id",
            Arc::new(|ctx, params| Box::pin(intent_by_id(ctx, params))),
        ),
        (
            "student",
            "student_by_name",
            Arc::new(|ctx, params| Box::pin(intent_by_name(ctx, params))),
        ),
    ]
}

fn raw_id_handler() -> Handler {
    Arc::new(|ctx, text| Box::pin(async move { lookup_by_id(ctx, text.trim().to_string()).await }))
}

async fn handle_id_command(ctx: Ctx, text: String) -> Result<HandlerOutput> {
    let arg = text.trim_start().trim_start_matches("學號").trim().to_string();
    if arg.is_empty() {
        return Err(BotError::MissingParameter("學號".into()));
    }
    if is_student_id(&arg) {
        lookup_by_id(ctx, arg).await
    } else {
        lookup_by_name(ctx, arg).await
    }
}

async fn intent_by_id(ctx: Ctx, params: HashMap<String, String>) -> Result<HandlerOutput> {
    let id = params
        .get("id")
        .cloned()
        .ok_or(BotError::MissingParameter("id".into()))?;
    if !is_student_id(&id) {
        return Err(BotError::InvalidInput(format!("not a student number: {id}")));
    }
    lookup_by_id(ctx, id).await
}

async fn intent_by_name(ctx: Ctx, params: HashMap<String, String>) -> Result<HandlerOutput> {
    let name = params
        .get("name")
        .cloned()
        .ok_or(BotError::MissingParameter("name".into()))?;
    lookup_by_name(ctx, name).await
}

/// Cache-first student number lookup: fresh hit served directly, stale hit
/// refreshed (and served stale when upstream is down), miss scraped.
async fn lookup_by_id(ctx: Ctx, id: String) -> Result<HandlerOutput> {
    let bot = &ctx.bot;
    let cached = bot.store.get_student(&id).await.map_err(|e| {
        bot.metrics.record_cache(CacheOutcome::Error);
        BotError::Other(e.to_string())
    })?;

    let ttl = bot.config.cache_ttl.as_secs() as i64;
    let fresh = |s: &Student| now_epoch() - s.cached_at < ttl;

    if let Some(student) = &cached {
        if fresh(student) {
            return Ok(HandlerOutput::reply(ReplyMessage::text(student_card(student)))
                .with_stats(HandlerStats {
                    cache: Some(CacheOutcome::Hit),
                    upstream_ms: None,
                    result_count: 1,
                }));
        }
    }

    // Miss or stale: go upstream.
    let timer = UpstreamTimer::start();
    let fetched = fetch_student_by_id(&bot.scraper, &ctx.token, &id).await;
    let upstream_ms = timer.stop();

    match fetched {
        Ok(Some(student)) => {
            bot.store
                .save_student(student.clone())
                .await
                .map_err(|e| BotError::Other(e.to_string()))?;
            Ok(HandlerOutput::reply(ReplyMessage::text(student_card(&student)))
                .with_stats(HandlerStats {
                    cache: Some(CacheOutcome::Miss),
                    upstream_ms: Some(upstream_ms),
                    result_count: 1,
                }))
        }
        Ok(None) => {
            bot.metrics
                .not_found
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(HandlerOutput::reply(ReplyMessage::text(format!(
                "查無此學號 {id}，確認一下是不是打錯了？"
            )))
            .with_stats(HandlerStats {
                cache: Some(CacheOutcome::Miss),
                upstream_ms: Some(upstream_ms),
                result_count: 0,
            }))
        }
        Err(BotError::Cancelled) => Err(BotError::Cancelled),
        Err(e) => {
            // Upstream unreachable: a stale record beats no record.
            if let Some(student) = cached {
                tracing::warn!(id, error = %e, "serving stale student record");
                return Ok(HandlerOutput::reply(ReplyMessage::text(format!(
                    "{}\n（資料可能不是最新的）",
                    student_card(&student)
                )))
                .with_stats(HandlerStats {
                    cache: Some(CacheOutcome::Hit),
                    upstream_ms: Some(upstream_ms),
                    result_count: 1,
                }));
            }
            Err(e)
        }
    }
}

/// Name search over the cache only; names are warmed in bulk and never
/// worth a per-query scrape.
async fn lookup_by_name(ctx: Ctx, name: String) -> Result<HandlerOutput> {
    let students = ctx
        .bot
        .store
        .search_students_by_name(&name)
        .await
        .map_err(|e| BotError::Other(e.to_string()))?;

    if students.is_empty() {
        ctx.bot
            .metrics
            .not_found
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        return Ok(HandlerOutput::reply(ReplyMessage::text(format!(
            "找不到叫「{name}」的同學"
        )))
        .with_stats(HandlerStats {
            cache: Some(CacheOutcome::Hit),
            upstream_ms: None,
            result_count: 0,
        }));
    }

    let count = students.len();
    let lines: Vec<String> = students
        .iter()
        .take(10)
        .map(|s| format!("{}　{}　{}", s.id, s.name, s.department))
        .collect();
    let mut text = lines.join("\n");
    if count > 10 {
        text.push_str(&format!("\n……共 {count} 筆，顯示前 10 筆"));
    }

    Ok(HandlerOutput::reply(ReplyMessage::text(text)).with_stats(HandlerStats {
        cache: Some(CacheOutcome::Hit),
        upstream_ms: None,
        result_count: count,
    }))
}

/// Department-code lookup, e.g. `系 資工` → 資訊工程學系（85）. Rune-set
/// matching catches the common abbreviations.
async fn handle_department(_ctx: Ctx, text: String) -> Result<HandlerOutput> {
    let query = text.trim_start().trim_start_matches('系').trim();
    if query.is_empty() {
        return Err(BotError::MissingParameter("系所關鍵字".into()));
    }

    let hits: Vec<(&str, &str)> = DEPARTMENTS
        .iter()
        .filter(|(code, name)| {
            name.contains(query)
                || crate::store::fuzzy::rune_set_match(query, name)
                || *code == query
        })
        .copied()
        .collect();

    if hits.is_empty() {
        return Ok(HandlerOutput::reply(ReplyMessage::text(format!(
            "找不到和「{query}」相符的系所"
        ))));
    }

    let count = hits.len();
    let lines: Vec<String> = hits
        .into_iter()
        .map(|(code, name)| format!("{name}（{code}）"))
        .collect();
    Ok(HandlerOutput::reply(ReplyMessage::text(lines.join("\n"))).with_stats(HandlerStats {
        cache: None,
        upstream_ms: None,
        result_count: count,
    }))
}

/// The student card every id lookup replies with.
fn student_card(s: &Student) -> String {
    format!(
        "學號:{}\n姓名:{}\n入學年:{}\n系所:{}",
        s.id, s.name, s.year, s.department
    )
}
