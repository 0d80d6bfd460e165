// scrape/contact.rs
// Campus directory pages → Contact records

use scraper::{Html, Selector};
use tokio_util::sync::CancellationToken;

use super::client::ScrapeClient;
use super::sites::Site;
use crate::error::Result;
use crate::store::types::{Contact, ContactKind};

/// Fetch the full directory (a warmup unit per top-level organization).
pub async fn fetch_contacts(
    client: &ScrapeClient,
    ctx: &CancellationToken,
    organization: &str,
) -> Result<Vec<Contact>> {
    let path = format!("/directory/unit?org={}", urlencoding::encode(organization));
    let body = client.get(ctx, Site::Directory, &path).await?;
    Ok(parse_contacts(&body))
}

/// Parse a directory page. Organization cards and individual cards share
/// one markup shape; individuals carry a title, organizations do not.
pub fn parse_contacts(html: &str) -> Vec<Contact> {
    let doc = Html::parse_document(html);
    let card_sel = Selector::parse("div.contact-card").expect("static selector");

    let mut contacts = Vec::new();
    for card in doc.select(&card_sel) {
        let field = |class: &str| -> String {
            let sel = Selector::parse(&format!("span.{class}")).expect("static selector");
            card.select(&sel)
                .next()
                .map(|e| e.text().collect::<String>().trim().to_string())
                .unwrap_or_default()
        };

        let uid = card
            .value()
            .attr("data-uid")
            .map(str::to_string)
            .unwrap_or_default();
        let name = field("name");
        if uid.is_empty() || name.is_empty() {
            continue;
        }
        let title = field("title");
        let kind = if title.is_empty() {
            ContactKind::Organization
        } else {
            ContactKind::Individual
        };

        contacts.push(Contact {
            uid,
            kind,
            name,
            organization: field("org"),
            superior: field("superior"),
            title,
            phone: field("phone"),
            extension: field("ext"),
            email: field("email"),
            location: field("location"),
            website: field("website"),
            cached_at: 0,
        });
    }
    contacts
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
        <div class="contact-card" data-uid="org-85">
          <span class="name">資訊工程學系</span>
          <span class="org">電機資訊學院</span>
          <span class="phone">02-86741111</span>
          <span class="ext">66666</span>
          <span class="location">資訊大樓9F</span>
          <span class="website">https://cs.ntpu.edu.tw</span>
        </div>
        <div class="contact-card" data-uid="p-123">
          <span class="name">王主任</span>
          <span class="title">系主任</span>
          <span class="org">資訊工程學系</span>
          <span class="superior">電機資訊學院</span>
          <span class="email">chair@ntpu.edu.tw</span>
        </div>
        <div class="contact-card"><span class="name">無識別</span></div>
        </body></html>"#;

    #[test]
    fn test_parse_contacts() {
        let contacts = parse_contacts(PAGE);
        assert_eq!(contacts.len(), 2);

        assert_eq!(contacts[0].uid, "org-85");
        assert_eq!(contacts[0].kind, ContactKind::Organization);
        assert_eq!(contacts[0].name, "資訊工程學系");
        assert_eq!(contacts[0].extension, "66666");

        assert_eq!(contacts[1].kind, ContactKind::Individual);
        assert_eq!(contacts[1].title, "系主任");
        assert_eq!(contacts[1].superior, "電機資訊學院");
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse_contacts("<html></html>").is_empty());
    }
}
