// dispatch/sticker.rs
// Serves a random cached sticker

use std::sync::Arc;

use rand::Rng;

use crate::dispatch::{Ctx, HandlerOutput, HandlerStats, Matcher, Pattern};
use crate::error::{BotError, Result};
use crate::metrics::CacheOutcome;
use crate::platform::ReplyMessage;

pub fn matchers() -> Vec<Matcher> {
    vec![Matcher {
        priority: 60,
        module: "sticker",
        pattern: Pattern::Keyword(regex::Regex::new("貼圖|sticker").expect("static regex")),
        handler: Arc::new(|ctx, _text| Box::pin(handle(ctx))),
    }]
}

async fn handle(ctx: Ctx) -> Result<HandlerOutput> {
    let seed = rand::rng().random::<u64>();
    let sticker = ctx
        .bot
        .store
        .pick_sticker(seed)
        .await
        .map_err(|e| BotError::Other(e.to_string()))?;

    let Some(sticker) = sticker else {
        return Ok(HandlerOutput::reply(ReplyMessage::text("貼圖庫還是空的，晚點再來看看"))
            .with_stats(HandlerStats {
                cache: Some(CacheOutcome::Miss),
                upstream_ms: None,
                result_count: 0,
            }));
    };

    // Diagnostics only; a failed bump never blocks the reply
    if let Err(e) = ctx.bot.store.record_sticker_outcome(&sticker.url, true).await {
        tracing::debug!("sticker counter bump failed: {}", e);
    }

    Ok(HandlerOutput::reply(ReplyMessage::image(sticker.url)).with_stats(HandlerStats {
        cache: Some(CacheOutcome::Hit),
        upstream_ms: None,
        result_count: 1,
    }))
}
