// store/contacts.rs
// Campus directory contact operations

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};

use super::fuzzy::rune_set_match;
use super::types::{Contact, ContactKind};
use super::{GET_ALL_CAP, LIKE_CAP, like_pattern};

const COLS: &str =
    "uid, kind, name, organization, superior, title, phone, extension, email, location, website, cached_at";

/// Parse a Contact from a row in COLS order.
pub fn parse_contact_row(row: &rusqlite::Row) -> rusqlite::Result<Contact> {
    let kind: String = row.get(1)?;
    Ok(Contact {
        uid: row.get(0)?,
        kind: ContactKind::parse(&kind).unwrap_or(ContactKind::Individual),
        name: row.get(2)?,
        organization: row.get(3)?,
        superior: row.get(4)?,
        title: row.get(5)?,
        phone: row.get(6)?,
        extension: row.get(7)?,
        email: row.get(8)?,
        location: row.get(9)?,
        website: row.get(10)?,
        cached_at: row.get(11)?,
    })
}

pub fn get_contact_sync(conn: &Connection, uid: &str) -> Result<Option<Contact>> {
    let contact = conn
        .query_row(
            &format!("SELECT {COLS} FROM contacts WHERE uid = ?1"),
            [uid],
            parse_contact_row,
        )
        .optional()?;
    Ok(contact)
}

pub fn save_contact_sync(conn: &Connection, contact: &Contact, now: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO contacts \
         (uid, kind, name, organization, superior, title, phone, extension, email, location, website, cached_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
         ON CONFLICT(uid) DO UPDATE SET \
           kind = excluded.kind, \
           name = excluded.name, \
           organization = excluded.organization, \
           superior = excluded.superior, \
           title = excluded.title, \
           phone = excluded.phone, \
           extension = excluded.extension, \
           email = excluded.email, \
           location = excluded.location, \
           website = excluded.website, \
           cached_at = MAX(cached_at, excluded.cached_at)",
        params![
            contact.uid,
            contact.kind.as_str(),
            contact.name,
            contact.organization,
            contact.superior,
            contact.title,
            contact.phone,
            contact.extension,
            contact.email,
            contact.location,
            contact.website,
            now
        ],
    )?;
    Ok(())
}

/// Two-tier search over name and organization, unioned and deduplicated on
/// uid preserving first-seen order.
pub fn search_contacts_by_name_sync(conn: &Connection, query: &str) -> Result<Vec<Contact>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT {COLS} FROM contacts \
         WHERE name LIKE ?1 ESCAPE '\\' OR organization LIKE ?1 ESCAPE '\\' \
         LIMIT {LIKE_CAP}"
    ))?;
    let like_hits: Vec<Contact> = stmt
        .query_map([like_pattern(query)], parse_contact_row)?
        .collect::<rusqlite::Result<_>>()?;

    let all = get_all_contacts_sync(conn)?;
    let fuzzy_hits = all
        .into_iter()
        .filter(|c| rune_set_match(query, &c.name) || rune_set_match(query, &c.organization));

    let mut seen = std::collections::HashSet::new();
    let mut results = Vec::new();
    for c in like_hits.into_iter().chain(fuzzy_hits) {
        if seen.insert(c.uid.clone()) {
            results.push(c);
        }
    }
    Ok(results)
}

pub fn get_all_contacts_sync(conn: &Connection) -> Result<Vec<Contact>> {
    let mut stmt =
        conn.prepare(&format!("SELECT {COLS} FROM contacts ORDER BY uid LIMIT {GET_ALL_CAP}"))?;
    let contacts = stmt
        .query_map([], parse_contact_row)?
        .collect::<rusqlite::Result<_>>()?;
    Ok(contacts)
}

pub fn count_contacts_sync(conn: &Connection) -> Result<i64> {
    let count = conn.query_row("SELECT COUNT(*) FROM contacts", [], |row| row.get(0))?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::run_migrations;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn sample(uid: &str, name: &str, org: &str) -> Contact {
        Contact {
            uid: uid.into(),
            kind: ContactKind::Organization,
            name: name.into(),
            organization: org.into(),
            superior: String::new(),
            title: String::new(),
            phone: "02-86741111".into(),
            extension: "66666".into(),
            email: String::new(),
            location: String::new(),
            website: String::new(),
            cached_at: 0,
        }
    }

    #[test]
    fn test_round_trip() {
        let conn = test_conn();
        let c = sample("u1", "資訊工程學系", "電機資訊學院");
        save_contact_sync(&conn, &c, 500).unwrap();

        let got = get_contact_sync(&conn, "u1").unwrap().unwrap();
        assert_eq!(got.name, "資訊工程學系");
        assert_eq!(got.kind, ContactKind::Organization);
        assert_eq!(got.cached_at, 500);
    }

    #[test]
    fn test_search_both_fields() {
        let conn = test_conn();
        save_contact_sync(&conn, &sample("u1", "資訊工程學系", "電機資訊學院"), 1).unwrap();

        // name substring
        assert_eq!(search_contacts_by_name_sync(&conn, "資訊工程").unwrap().len(), 1);
        // organization substring
        assert_eq!(search_contacts_by_name_sync(&conn, "電機").unwrap().len(), 1);
        // fuzzy abbreviation on name
        assert_eq!(search_contacts_by_name_sync(&conn, "資工系").unwrap().len(), 1);
    }

    #[test]
    fn test_search_dedup_first_seen_order() {
        let conn = test_conn();
        save_contact_sync(&conn, &sample("u1", "資訊工程學系", ""), 1).unwrap();
        save_contact_sync(&conn, &sample("u2", "資訊管理學系", ""), 1).unwrap();

        let hits = search_contacts_by_name_sync(&conn, "資訊").unwrap();
        assert_eq!(hits.len(), 2);
        let uids: Vec<_> = hits.iter().map(|c| c.uid.as_str()).collect();
        assert_eq!(uids, vec!["u1", "u2"]);
    }
}
