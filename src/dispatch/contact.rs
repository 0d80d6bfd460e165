// dispatch/contact.rs
// Campus directory lookups with postback paging

use std::collections::HashMap;
use std::sync::Arc;

use crate::dispatch::{
    Ctx, HandlerOutput, HandlerStats, IntentHandler, Matcher, Pattern, encode_postback,
};
use crate::error::{BotError, Result};
use crate::metrics::CacheOutcome;
use crate::platform::ReplyMessage;
use crate::store::types::{Contact, ContactKind};

/// Results per page in a reply.
const PAGE_SIZE: usize = 5;

pub fn matchers() -> Vec<Matcher> {
    vec![
        Matcher {
            priority: 40,
            module: "contact",
            pattern: Pattern::Prefix("聯絡"),
            handler: Arc::new(|ctx, text| Box::pin(handle_search_command(ctx, text))),
        },
        Matcher {
            priority: 41,
            module: "contact",
            pattern: Pattern::Keyword(
                regex::Regex::new("電話|分機|信箱").expect("static regex"),
            ),
            handler: Arc::new(|ctx, text| Box::pin(handle_keyword(ctx, text))),
        },
    ]
}

pub fn intents() -> Vec<(&'static str, &'static str, IntentHandler)> {
    vec![(
        "contact",
        "contact",
        Arc::new(|ctx, params| Box::pin(intent_search(ctx, params))),
    )]
}

async fn handle_search_command(ctx: Ctx, text: String) -> Result<HandlerOutput> {
    let query = text.trim_start().trim_start_matches("聯絡").trim().to_string();
    if query.is_empty() {
        return Err(BotError::MissingParameter("聯絡對象".into()));
    }
    search(ctx, query, 0).await
}

/// Keyword path: strip the trigger words, search on the rest.
async fn handle_keyword(ctx: Ctx, text: String) -> Result<HandlerOutput> {
    let query: String = text
        .replace(['的', '？', '?'], " ")
        .replace("電話", " ")
        .replace("分機", " ")
        .replace("信箱", " ")
        .replace("多少", " ")
        .trim()
        .to_string();
    if query.is_empty() {
        return Err(BotError::MissingParameter("聯絡對象".into()));
    }
    search(ctx, query, 0).await
}

async fn intent_search(ctx: Ctx, params: HashMap<String, String>) -> Result<HandlerOutput> {
    let query = params
        .get("query")
        .cloned()
        .ok_or(BotError::MissingParameter("query".into()))?;
    let page = params
        .get("page")
        .and_then(|p| p.parse().ok())
        .unwrap_or(0usize);
    search(ctx, query, page).await
}

/// Directory search is cache-only: the whole directory is warmed daily and
/// a per-query scrape would blow the webhook budget.
async fn search(ctx: Ctx, query: String, page: usize) -> Result<HandlerOutput> {
    let contacts = ctx
        .bot
        .store
        .search_contacts_by_name(&query)
        .await
        .map_err(|e| BotError::Other(e.to_string()))?;

    if contacts.is_empty() {
        ctx.bot
            .metrics
            .not_found
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        return Ok(HandlerOutput::reply(ReplyMessage::text(format!(
            "找不到「{query}」的聯絡方式，試試完整的單位名稱？"
        )))
        .with_stats(HandlerStats {
            cache: Some(CacheOutcome::Hit),
            upstream_ms: None,
            result_count: 0,
        }));
    }

    let total = contacts.len();
    let start = page * PAGE_SIZE;
    let page_items: Vec<&Contact> = contacts.iter().skip(start).take(PAGE_SIZE).collect();
    if page_items.is_empty() {
        return Ok(HandlerOutput::reply(ReplyMessage::text("沒有更多結果了")));
    }

    let mut text = page_items
        .iter()
        .map(|c| contact_card(c))
        .collect::<Vec<_>>()
        .join("\n——\n");

    let mut output = HandlerOutput::default();
    if start + page_items.len() < total {
        let token = encode_postback(
            "contact",
            &[("query", query.as_str()), ("page", &(page + 1).to_string())],
        );
        text.push_str(&format!(
            "\n（第 {} 頁，共 {} 筆。回覆代碼看下一頁: {token}）",
            page + 1,
            total
        ));
    }
    output.messages.push(ReplyMessage::text(text));
    Ok(output.with_stats(HandlerStats {
        cache: Some(CacheOutcome::Hit),
        upstream_ms: None,
        result_count: total,
    }))
}

fn contact_card(c: &Contact) -> String {
    let mut lines = vec![match c.kind {
        ContactKind::Organization => format!("🏛 {}", c.name),
        ContactKind::Individual => format!("👤 {}（{}）", c.name, c.title),
    }];
    if !c.organization.is_empty() {
        lines.push(format!("單位:{}", c.organization));
    }
    if !c.phone.is_empty() {
        let ext = if c.extension.is_empty() {
            String::new()
        } else {
            format!(" 分機 {}", c.extension)
        };
        lines.push(format!("電話:{}{}", c.phone, ext));
    }
    if !c.email.is_empty() {
        lines.push(format!("信箱:{}", c.email));
    }
    if !c.location.is_empty() {
        lines.push(format!("位置:{}", c.location));
    }
    if !c.website.is_empty() {
        lines.push(format!("網站:{}", c.website));
    }
    lines.join("\n")
}
