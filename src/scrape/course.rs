// scrape/course.rs
// Course catalog and syllabus pages → Course / Syllabus records

use scraper::{Html, Selector};
use tokio_util::sync::CancellationToken;

use super::client::ScrapeClient;
use super::sites::Site;
use crate::error::Result;
use crate::store::types::{Course, Semester, Syllabus, course_uid};

/// Fetch one semester's course catalog (a warmup unit).
pub async fn fetch_courses_by_semester(
    client: &ScrapeClient,
    ctx: &CancellationToken,
    semester: Semester,
) -> Result<Vec<Course>> {
    let path = format!(
        "/pls/course/query.list?yr={}&term={}",
        semester.year, semester.term
    );
    let body = client.get(ctx, Site::Courses, &path).await?;
    Ok(parse_courses(&body, semester))
}

/// Fetch the syllabus for one course offering.
pub async fn fetch_syllabus(
    client: &ScrapeClient,
    ctx: &CancellationToken,
    course: &Course,
) -> Result<Option<Syllabus>> {
    let path = format!(
        "/pls/course/syllabus.show?yr={}&term={}&no={}",
        course.year,
        course.term,
        urlencoding::encode(&course.no)
    );
    let body = client.get(ctx, Site::Courses, &path).await?;
    Ok(parse_syllabus(&body, course))
}

/// Parse a catalog listing. Each row: course number, title, teachers,
/// credits, time, location, eligible classes.
pub fn parse_courses(html: &str, semester: Semester) -> Vec<Course> {
    let doc = Html::parse_document(html);
    let row_sel = Selector::parse("table.course-list tr").expect("static selector");
    let cell_sel = Selector::parse("td").expect("static selector");

    let mut courses = Vec::new();
    for row in doc.select(&row_sel) {
        let cells: Vec<String> = row
            .select(&cell_sel)
            .map(|c| c.text().collect::<String>().trim().to_string())
            .collect();
        if cells.len() < 7 {
            continue;
        }
        let no = cells[0].clone();
        let title = cells[1].clone();
        if no.is_empty() || title.is_empty() {
            continue;
        }
        courses.push(Course {
            uid: course_uid(semester.year, semester.term, &no),
            year: semester.year,
            term: semester.term,
            no,
            title,
            teachers: split_teachers(&cells[2]),
            credits: cells[3].clone(),
            time: cells[4].clone(),
            location: cells[5].clone(),
            eligible: cells[6].clone(),
            cached_at: 0,
        });
    }
    courses
}

/// Teachers arrive as a single cell joined by the usual separators; order
/// is preserved.
fn split_teachers(cell: &str) -> Vec<String> {
    cell.split(['、', ',', '/'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a syllabus page into the 3-field merged schema. Returns None when
/// the page carries no syllabus sections (course exists, syllabus was never
/// filed).
pub fn parse_syllabus(html: &str, course: &Course) -> Option<Syllabus> {
    let doc = Html::parse_document(html);
    let section = |class: &str| -> String {
        let sel = Selector::parse(&format!("div.{class}")).expect("static selector");
        doc.select(&sel)
            .next()
            .map(|e| {
                e.text()
                    .collect::<String>()
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default()
    };

    let objectives = section("syllabus-objectives");
    let outline = section("syllabus-outline");
    let schedule = section("syllabus-schedule");
    if objectives.is_empty() && outline.is_empty() && schedule.is_empty() {
        return None;
    }

    Some(Syllabus {
        uid: course.uid.clone(),
        title: course.title.clone(),
        teachers: course.teachers.clone(),
        year: course.year,
        term: course.term,
        content_hash: Syllabus::compute_hash(&course.title, &objectives, &outline, &schedule),
        objectives,
        outline,
        schedule,
        cached_at: 0,
    })
}
