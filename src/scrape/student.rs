// scrape/student.rs
// Enrollment pages → Student records

use scraper::{Html, Selector};
use tokio_util::sync::CancellationToken;

use super::client::ScrapeClient;
use super::sites::Site;
use crate::error::Result;
use crate::store::types::Student;

/// Derive the ROC entry year from a student number. 9-digit numbers carry
/// a 3-digit year after the leading type digit; 8-digit numbers carry two
/// digits, which the enrollment system rolled over at ROC 100.
pub fn year_from_student_id(id: &str) -> Option<i32> {
    if !id.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    match id.len() {
        9 => id[1..4].parse().ok(),
        8 => {
            let short: i32 = id[1..3].parse().ok()?;
            Some(if short < 50 { short + 100 } else { short })
        }
        _ => None,
    }
}

/// Valid student numbers are 8 or 9 digits.
pub fn is_student_id(text: &str) -> bool {
    matches!(text.len(), 8 | 9) && text.chars().all(|c| c.is_ascii_digit())
}

/// Look up one student by number. `Ok(None)` means the query was valid but
/// upstream holds no match.
pub async fn fetch_student_by_id(
    client: &ScrapeClient,
    ctx: &CancellationToken,
    id: &str,
) -> Result<Option<Student>> {
    let path = format!("/pls/portal/query_std.show?sno={}", urlencoding::encode(id));
    let body = client.get(ctx, Site::Enrollment, &path).await?;
    Ok(parse_students(&body).into_iter().find(|s| s.id == id))
}

/// Fetch every student of one department and entry year (a warmup unit).
pub async fn fetch_students_by_unit(
    client: &ScrapeClient,
    ctx: &CancellationToken,
    department: &str,
    year: i32,
) -> Result<Vec<Student>> {
    let path = format!(
        "/pls/portal/query_std.list?dept={}&year={}",
        urlencoding::encode(department),
        year
    );
    let body = client.get(ctx, Site::Enrollment, &path).await?;
    Ok(parse_students(&body))
}

/// Parse the enrollment result table. Rows carry the student number, name
/// and department; the entry year is derived from the number.
///
/// Synchronous on purpose: the parsed DOM is not `Send` and must not cross
/// an await point.
pub fn parse_students(html: &str) -> Vec<Student> {
    let doc = Html::parse_document(html);
    let row_sel = Selector::parse("table.std-list tr").expect("static selector");
    let cell_sel = Selector::parse("td").expect("static selector");

    let mut students = Vec::new();
    for row in doc.select(&row_sel) {
        let cells: Vec<String> = row
            .select(&cell_sel)
            .map(|c| c.text().collect::<String>().trim().to_string())
            .collect();
        if cells.len() < 3 {
            continue; // header or malformed row
        }
        let id = cells[0].clone();
        let Some(year) = year_from_student_id(&id) else {
            continue;
        };
        if cells[1].is_empty() {
            continue;
        }
        students.push(Student {
            id,
            name: cells[1].clone(),
            year,
            department: cells[2].clone(),
            cached_at: 0,
        });
    }
    students
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
        <table class="std-list">
          <tr><th>學號</th><th>姓名</th><th>系所</th></tr>
          <tr><td>41247001</td><td>陳小明</td><td>資工系</td></tr>
          <tr><td>412470029</td><td>林大華</td><td>資工系</td></tr>
          <tr><td>bogus</td><td>壞列</td><td>x</td></tr>
        </table>
        </body></html>"#;

    #[test]
    fn test_parse_students() {
        let students = parse_students(PAGE);
        assert_eq!(students.len(), 2);
        assert_eq!(students[0].id, "41247001");
        assert_eq!(students[0].name, "陳小明");
        assert_eq!(students[0].year, 112);
        assert_eq!(students[1].year, 124);
    }

    #[test]
    fn test_parse_empty_page() {
        assert!(parse_students("<html><body>查無資料</body></html>").is_empty());
    }

    #[test]
    fn test_year_from_student_id() {
        assert_eq!(year_from_student_id("41247001"), Some(112));
        assert_eq!(year_from_student_id("49647001"), Some(96));
        assert_eq!(year_from_student_id("412470012"), Some(124));
        assert_eq!(year_from_student_id("1234"), None);
        assert_eq!(year_from_student_id("4124700a"), None);
    }

    #[test]
    fn test_is_student_id() {
        assert!(is_student_id("41247001"));
        assert!(is_student_id("412470012"));
        assert!(!is_student_id("4124700"));
        assert!(!is_student_id("41247001x"));
    }
}
