// scrape/sticker.rs
// Sticker board pages → Sticker records

use scraper::{Html, Selector};
use tokio_util::sync::CancellationToken;

use super::client::ScrapeClient;
use super::sites::Site;
use crate::error::Result;
use crate::store::types::Sticker;

/// Fetch the sticker board index.
pub async fn fetch_stickers(client: &ScrapeClient, ctx: &CancellationToken) -> Result<Vec<Sticker>> {
    let body = client.get(ctx, Site::Stickers, "/board/latest").await?;
    Ok(parse_stickers(&body, "board"))
}

/// Parse sticker image URLs off a board page.
pub fn parse_stickers(html: &str, source: &str) -> Vec<Sticker> {
    let doc = Html::parse_document(html);
    let img_sel = Selector::parse("img.sticker").expect("static selector");

    let mut seen = std::collections::HashSet::new();
    doc.select(&img_sel)
        .filter_map(|img| img.value().attr("src"))
        .filter(|src| src.starts_with("https://"))
        .filter(|src| seen.insert(src.to_string()))
        .map(|src| Sticker {
            url: src.to_string(),
            source: source.to_string(),
            cached_at: 0,
            hits: 0,
            failures: 0,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stickers_dedup_and_scheme() {
        let page = r#"
            <img class="sticker" src="https://s.moe/a.png">
            <img class="sticker" src="https://s.moe/a.png">
            <img class="sticker" src="http://insecure/b.png">
            <img class="banner" src="https://s.moe/c.png">
            <img class="sticker" src="https://s.moe/d.png">"#;
        let stickers = parse_stickers(page, "board");
        let urls: Vec<_> = stickers.iter().map(|s| s.url.as_str()).collect();
        assert_eq!(urls, vec!["https://s.moe/a.png", "https://s.moe/d.png"]);
        assert!(stickers.iter().all(|s| s.source == "board"));
    }
}
