use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{Datelike, Duration, Local, NaiveDate};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use super::{clean_homework, HtmlParser};
use crate::date_util;
use crate::error::{Error, Result};
use crate::model::{LessonRecord, StudentInfo, WeekControl, WeekPage};

static WEEK_BUTTONS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a.UgeKnap, a.UgeKnapValgt, a.UgeKnapAktuel").unwrap());
static OFFSET_LINKS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"a[onclick*="v="]"#).unwrap());
static TIMETABLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table.time_8_16").unwrap());
static ANCHORS: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a").unwrap());
static NOTE_BUTTON: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"input[type="image"][src*="note.gif"]"#).unwrap());
static STUDENT_ID_INPUT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"input[name="StudentId"]"#).unwrap());
static STUDENT_ID_DATA: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("[data-student-id]").unwrap());

static OFFSET: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"v=(-?\d+)").unwrap());
static NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)").unwrap());
static DATE_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{2}\.\d{2}\.\d{4})\s*-\s*(\d{2}\.\d{2}\.\d{4})").unwrap()
});
static DAY_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\S+)\s+(\d{1,2}/\d{1,2})").unwrap());
static LESSON_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"'([A-F0-9-]+)&").unwrap());
static STUDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Næmingatímatalva:\s*([^,]+),\s*([^\s<.]+)").unwrap());
static STUDENT_ID_GUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[a-fA-F0-9]{8}-[a-fA-F0-9]{4}-[a-fA-F0-9]{4}-[a-fA-F0-9]{4}-[a-fA-F0-9]{12}")
        .unwrap()
});
static TEACHER_LINKED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([^<>]+?)\s*\(\s*<a[^>]*?>([A-Z]{2,4})</a>\s*\)").unwrap()
});
static TEACHER_PLAIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([^<>]+?)\s*\(\s*([A-Z]{2,4})\s*\)").unwrap());

const CANCELLED_CLASSES: &[&str] = &[
    "lektionslinje_lesson1",
    "lektionslinje_lesson2",
    "lektionslinje_lesson3",
    "lektionslinje_lesson4",
    "lektionslinje_lesson5",
    "lektionslinje_lesson7",
    "lektionslinje_lesson10",
    "lektionslinje_lessoncancelled",
];

/// Lessons spanning at least this many columns run all day.
const ALL_DAY_COLSPAN: usize = 90;

/// Parser for the Glasir portal's timetable markup.
#[derive(Debug, Clone, Default)]
pub struct GlasirParser {
    /// Date the week selector is read relative to; today when unset.
    today: Option<NaiveDate>,
}

impl GlasirParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reference_date(today: NaiveDate) -> Self {
        Self { today: Some(today) }
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Local::now().date_naive())
    }
}

/// Column index to `(slot, time range)`.
fn slot_for_column(column: usize) -> (&'static str, &'static str) {
    match column {
        2..=25 => ("1", "08:10-09:40"),
        26..=50 => ("2", "10:05-11:35"),
        51..=71 => ("3", "12:10-13:40"),
        72..=90 => ("4", "13:55-15:25"),
        91..=111 => ("5", "15:30-17:00"),
        112..=131 => ("6", "17:15-18:45"),
        _ => ("N/A", "N/A"),
    }
}

fn has_class(el: &ElementRef<'_>, pred: impl Fn(&str) -> bool) -> bool {
    el.value().classes().any(pred)
}

fn children_named<'a>(el: ElementRef<'a>, name: &'a str) -> impl Iterator<Item = ElementRef<'a>> + 'a {
    el.children()
        .filter_map(ElementRef::wrap)
        .filter(move |c| c.value().name() == name)
}

fn text_of(el: &ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").trim().to_string()
}

struct ClassCode {
    subject: String,
    level: String,
    year_code: String,
}

/// Split a class code such as `evf-A-33-2425-22y` or `Várroynd-før-A-33-2425`.
fn split_class_code(raw: &str) -> ClassCode {
    let parts: Vec<&str> = raw.split('-').collect();
    let part = |i: usize| parts.get(i).copied().unwrap_or_default().to_string();
    if parts.first() == Some(&"Várroynd") {
        let subject = match parts.get(1) {
            Some(p) => format!("Várroynd-{p}"),
            None => "Várroynd".to_string(),
        };
        ClassCode {
            subject,
            level: part(2),
            year_code: part(4),
        }
    } else {
        let subject = parts.first().copied().filter(|s| !s.is_empty()).unwrap_or("N/A");
        ClassCode {
            subject: subject.to_string(),
            level: part(1),
            year_code: part(3),
        }
    }
}

struct DayContext {
    day: String,
    date: NaiveDate,
}

impl HtmlParser for GlasirParser {
    fn parse_week_controls(&self, markup: &str) -> Result<Vec<WeekControl>> {
        let doc = Html::parse_document(markup);
        let mut links: Vec<ElementRef<'_>> = doc.select(&WEEK_BUTTONS).collect();
        if links.is_empty() {
            links = doc.select(&OFFSET_LINKS).collect();
        }

        let today = self.today();
        let mut controls: Vec<WeekControl> = Vec::new();
        for link in links {
            let Some(onclick) = link.value().attr("onclick") else {
                continue;
            };
            let Some(offset) = OFFSET
                .captures(onclick)
                .and_then(|c| c[1].parse::<i32>().ok())
            else {
                continue;
            };
            if controls.iter().any(|c| c.offset == offset) {
                continue;
            }
            let label = text_of(&link);
            let shown = NUMBER
                .captures(&label)
                .and_then(|c| c[1].parse::<u32>().ok())
                .filter(|n| (1..=53).contains(n));
            let week = match shown {
                Some(n) => date_util::resolve_week(today, offset, n),
                None => date_util::monday_at_offset(today, offset).iso_week(),
            };
            let is_current = has_class(&link, |c| c == "UgeKnapValgt" || c == "UgeKnapAktuel");
            controls.push(WeekControl {
                offset,
                slot_key: format!("{}-W{:02}", week.year(), week.week()),
                week_number: shown.unwrap_or(week.week()),
                is_current,
            });
        }
        log::debug!("Parsed {} week controls", controls.len());
        Ok(controls)
    }

    fn parse_week(&self, markup: &str) -> Result<WeekPage> {
        let doc = Html::parse_document(markup);
        let table = doc
            .select(&TIMETABLE)
            .next()
            .ok_or_else(|| Error::Parse("timetable table not found".into()))?;

        let page_text = text_of(&doc.root_element());
        let student = STUDENT.captures(&page_text).map(|c| StudentInfo {
            name: c[1].trim().to_string(),
            class: c[2].trim().to_string(),
        });
        let stated_start = DATE_RANGE
            .captures(&page_text)
            .and_then(|c| date_util::parse_dotted(&c[1]))
            .map(date_util::monday_of);

        let fallback_year = self.today().year();
        let rows = children_named(table, "tbody").flat_map(|tbody| children_named(tbody, "tr"));

        let mut day: Option<DayContext> = None;
        let mut first_date: Option<NaiveDate> = None;
        let mut lessons = Vec::new();

        for row in rows {
            let cells: Vec<ElementRef<'_>> = children_named(row, "td").collect();
            let Some(first) = cells.first() else {
                continue;
            };
            let is_header = has_class(first, |c| c == "lektionslinje_1" || c == "lektionslinje_1_aktuel");
            if is_header {
                let header = text_of(first);
                if let Some(caps) = DAY_HEADER.captures(&header) {
                    let name = &caps[1];
                    let Some(date) = date_util::resolve_day_month(&caps[2], stated_start, fallback_year)
                    else {
                        continue;
                    };
                    first_date.get_or_insert(date);
                    day = Some(DayContext {
                        day: date_util::english_day(name).unwrap_or(name).to_string(),
                        date,
                    });
                }
            }
            let Some(ctx) = day.as_ref() else {
                continue;
            };

            let mut column = 0usize;
            for cell in &cells {
                let colspan = cell
                    .value()
                    .attr("colspan")
                    .and_then(|s| s.trim().parse::<usize>().ok())
                    .unwrap_or(1);
                if has_class(cell, |c| c.starts_with("lektionslinje_lesson")) {
                    if let Some(lesson) = parse_lesson(cell, ctx, column, colspan) {
                        lessons.push(lesson);
                    }
                }
                column += colspan;
            }
        }

        let start = stated_start
            .or_else(|| first_date.map(date_util::monday_of))
            .ok_or_else(|| Error::Parse("no week dates in timetable".into()))?;
        let iso = start.iso_week();
        Ok(WeekPage {
            week_number: iso.week(),
            year: iso.year(),
            start_date: start,
            end_date: start + Duration::days(6),
            student,
            lessons,
        })
    }

    fn parse_homework(&self, body: &str) -> Option<String> {
        clean_homework(body)
    }

    fn parse_student_id(&self, markup: &str) -> Option<String> {
        let doc = Html::parse_document(markup);
        let from_input = doc
            .select(&STUDENT_ID_INPUT)
            .find_map(|e| e.value().attr("value"))
            .or_else(|| {
                doc.select(&STUDENT_ID_DATA)
                    .find_map(|e| e.value().attr("data-student-id"))
            })
            .map(str::trim)
            .filter(|s| !s.is_empty());
        if let Some(id) = from_input {
            return Some(id.to_string());
        }
        STUDENT_ID_GUID.find(markup).map(|m| m.as_str().to_string())
    }

    fn parse_teacher_map(&self, markup: &str) -> HashMap<String, String> {
        let mut map: HashMap<String, String> = TEACHER_LINKED
            .captures_iter(markup)
            .map(|c| (c[2].to_string(), c[1].trim().to_string()))
            .collect();
        if map.is_empty() {
            map = TEACHER_PLAIN
                .captures_iter(markup)
                .map(|c| (c[2].to_string(), c[1].trim().to_string()))
                .collect();
        }
        map.retain(|_, name| !name.is_empty());
        map
    }
}

fn parse_lesson(cell: &ElementRef<'_>, ctx: &DayContext, column: usize, colspan: usize) -> Option<LessonRecord> {
    let anchors: Vec<String> = cell.select(&ANCHORS).map(|a| text_of(&a)).collect();
    if anchors.len() < 3 {
        return None;
    }
    let code = split_class_code(&anchors[0]);
    let (time_slot, time_range) = if colspan >= ALL_DAY_COLSPAN {
        ("All day", "08:10-15:25")
    } else {
        slot_for_column(column)
    };
    let lesson_id = cell
        .select(&NOTE_BUTTON)
        .filter_map(|note| note.value().attr("onclick"))
        .find_map(|onclick| LESSON_ID.captures(onclick).map(|c| c[1].to_string()));

    Some(LessonRecord {
        lesson_id,
        subject: code.subject,
        level: code.level,
        academic_year: date_util::academic_year(&code.year_code),
        teacher_initials: anchors[1].clone(),
        teacher_name: None,
        location: anchors[2].replace("st.", "").trim().to_string(),
        day: ctx.day.clone(),
        date: ctx.date,
        time_slot: time_slot.to_string(),
        time_range: time_range.to_string(),
        cancelled: has_class(cell, |c| CANCELLED_CLASSES.contains(&c)),
        homework: None,
    })
}
