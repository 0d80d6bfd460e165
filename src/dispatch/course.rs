// dispatch/course.rs
// Free-text course search over the lexical index, plus detail lookups

use std::collections::HashMap;
use std::sync::Arc;

use crate::dispatch::{
    Ctx, HandlerOutput, HandlerStats, IntentHandler, Matcher, Pattern, encode_postback,
};
use crate::error::{BotError, Result};
use crate::index::CourseHit;
use crate::metrics::CacheOutcome;
use crate::platform::ReplyMessage;

/// Hits requested per semester from the index.
const TOP_N: usize = 5;

pub fn matchers() -> Vec<Matcher> {
    vec![Matcher {
        priority: 50,
        module: "course",
        pattern: Pattern::Prefix("課程"),
        handler: Arc::new(|ctx, text| Box::pin(handle_search_command(ctx, text))),
    }]
}

pub fn intents() -> Vec<(&'static str, &'static str, IntentHandler)> {
    vec![
        (
            "course",
            "course_search",
            Arc::new(|ctx, params| Box::pin(intent_search(ctx, params))),
        ),
        (
            "course",
            "course_detail",
            Arc::new(|ctx, params| Box::pin(intent_detail(ctx, params))),
        ),
    ]
}

async fn handle_search_command(ctx: Ctx, text: String) -> Result<HandlerOutput> {
    let query = text.trim_start().trim_start_matches("課程").trim().to_string();
    if query.is_empty() {
        return Err(BotError::MissingParameter("課程關鍵字".into()));
    }
    search(ctx, query).await
}

async fn intent_search(ctx: Ctx, params: HashMap<String, String>) -> Result<HandlerOutput> {
    let query = params
        .get("query")
        .cloned()
        .ok_or(BotError::MissingParameter("query".into()))?;
    search(ctx, query).await
}

/// Lexical search over the two newest semesters, with LLM query expansion
/// when a key is configured. The index never blocks behind rebuilds, so
/// this path stays well inside the webhook budget.
async fn search(ctx: Ctx, query: String) -> Result<HandlerOutput> {
    // Expand the query with synonyms; the raw query always stays first.
    let mut expanded = query.clone();
    if let Some(parser) = &ctx.bot.intent {
        for term in parser.expand_query(&query).await {
            expanded.push(' ');
            expanded.push_str(&term);
        }
    }

    let hits = ctx.bot.index.search_courses(&expanded, TOP_N);
    if hits.is_empty() {
        // Fall back to a title substring search over the store
        let courses = ctx
            .bot
            .store
            .search_courses_by_title(&query)
            .await
            .map_err(|e| BotError::Other(e.to_string()))?;
        if courses.is_empty() {
            ctx.bot
                .metrics
                .not_found
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Ok(HandlerOutput::reply(ReplyMessage::text(format!(
                "找不到和「{query}」相關的課程"
            )))
            .with_stats(HandlerStats {
                cache: Some(CacheOutcome::Hit),
                upstream_ms: None,
                result_count: 0,
            }));
        }
        let count = courses.len();
        let lines: Vec<String> = courses
            .iter()
            .take(TOP_N)
            .map(|c| format!("{}（{}）{}", c.title, c.semester(), c.teachers.join("、")))
            .collect();
        return Ok(HandlerOutput::reply(ReplyMessage::text(lines.join("\n")))
            .with_stats(HandlerStats {
                cache: Some(CacheOutcome::Hit),
                upstream_ms: None,
                result_count: count,
            }));
    }

    let count = hits.len();
    let lines: Vec<String> = hits.iter().map(render_hit).collect();
    let mut text = lines.join("\n");
    if let Some(top) = hits.first() {
        let token = encode_postback("course_detail", &[("uid", &top.uid)]);
        text.push_str(&format!("\n（回覆代碼看課程大綱: {token}）"));
    }

    Ok(HandlerOutput::reply(ReplyMessage::text(text)).with_stats(HandlerStats {
        cache: Some(CacheOutcome::Hit),
        upstream_ms: None,
        result_count: count,
    }))
}

/// One result line, tiered by the per-semester relative confidence.
fn render_hit(hit: &CourseHit) -> String {
    let badge = match hit.tier() {
        "best" => "⭐ 最佳比對",
        "high" => "✨ 高度相關",
        _ => "・部分相關",
    };
    format!("{badge}  {}（{}）", hit.title, hit.semester)
}

/// Course detail: the cached course row, its syllabus, and its programs.
async fn intent_detail(ctx: Ctx, params: HashMap<String, String>) -> Result<HandlerOutput> {
    let uid = params
        .get("uid")
        .cloned()
        .ok_or(BotError::MissingParameter("uid".into()))?;

    let course = ctx
        .bot
        .store
        .get_course(&uid)
        .await
        .map_err(|e| BotError::Other(e.to_string()))?;
    let Some(course) = course else {
        ctx.bot
            .metrics
            .not_found
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        return Ok(HandlerOutput::reply(ReplyMessage::text("這門課不在目前的課表裡"))
            .with_stats(HandlerStats {
                cache: Some(CacheOutcome::Miss),
                upstream_ms: None,
                result_count: 0,
            }));
    };

    let mut lines = vec![
        format!("📚 {}（{}）", course.title, course.semester()),
        format!("教師:{}", course.teachers.join("、")),
    ];
    if !course.credits.is_empty() {
        lines.push(format!("學分:{}", course.credits));
    }
    if !course.time.is_empty() {
        lines.push(format!("時間:{} {}", course.time, course.location));
    }

    let programs = ctx
        .bot
        .store
        .get_course_programs(&uid)
        .await
        .map_err(|e| BotError::Other(e.to_string()))?;
    if !programs.is_empty() {
        lines.push(format!("開放:{}", programs.join("、")));
    }

    if let Some(syllabus) = ctx
        .bot
        .store
        .get_syllabus(&uid)
        .await
        .map_err(|e| BotError::Other(e.to_string()))?
    {
        if !syllabus.objectives.is_empty() {
            lines.push(format!("目標:{}", truncate(&syllabus.objectives, 120)));
        }
        if !syllabus.outline.is_empty() {
            lines.push(format!("大綱:{}", truncate(&syllabus.outline, 200)));
        }
    }

    Ok(HandlerOutput::reply(ReplyMessage::text(lines.join("\n"))).with_stats(HandlerStats {
        cache: Some(CacheOutcome::Hit),
        upstream_ms: None,
        result_count: 1,
    }))
}

/// Truncate on a char boundary with an ellipsis.
fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}…")
}
