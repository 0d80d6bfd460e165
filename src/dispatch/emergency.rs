// dispatch/emergency.rs
// Emergency phone numbers, embedded in code
//
// This table must be reachable with zero I/O: it is the one answer the bot
// can still give with the store closed and every upstream down.

use std::sync::Arc;

use crate::dispatch::{Ctx, HandlerOutput, HandlerStats, IntentHandler, Matcher, Pattern};
use crate::error::Result;
use crate::platform::ReplyMessage;

/// Campus and national emergency lines.
pub const EMERGENCY_NUMBERS: [(&str, &str); 6] = [
    ("校安中心（24小時）", "02-8674-1111"),
    ("駐衛警察隊", "02-8674-1110"),
    ("醫務室", "02-8674-1081"),
    ("三峽警察分局", "02-2671-4092"),
    ("警察局", "110"),
    ("消防救護", "119"),
];

pub fn matchers() -> Vec<Matcher> {
    vec![Matcher {
        priority: 15,
        module: "emergency",
        pattern: Pattern::Keyword(
            regex::Regex::new("緊急|校安|報案").expect("static regex"),
        ),
        handler: Arc::new(|ctx, _text| Box::pin(handle(ctx))),
    }]
}

pub fn intents() -> Vec<(&'static str, &'static str, IntentHandler)> {
    vec![(
        "emergency",
        "emergency",
        Arc::new(|ctx, _params| Box::pin(handle(ctx))),
    )]
}

async fn handle(_ctx: Ctx) -> Result<HandlerOutput> {
    Ok(HandlerOutput::reply(ReplyMessage::text(emergency_card())).with_stats(HandlerStats {
        cache: None,
        upstream_ms: None,
        result_count: EMERGENCY_NUMBERS.len(),
    }))
}

/// The emergency card, rendered purely from the in-code table.
pub fn emergency_card() -> String {
    let mut lines = vec!["🚨 緊急聯絡電話".to_string()];
    for (name, number) in EMERGENCY_NUMBERS {
        lines.push(format!("{name}:{number}"));
    }
    lines.join("\n")
}
