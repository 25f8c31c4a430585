use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Identity of one schedule week, independent of the week number the
/// portal shows (which repeats every academic year).
pub type SlotKey = String;

/// One navigation control in the portal's week selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeekControl {
    pub offset: i32,
    pub slot_key: SlotKey,
    pub week_number: u32,
    pub is_current: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSlot {
    pub slot_key: SlotKey,
    pub offset: i32,
    pub week_number: u32,
    pub year: i32,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentInfo {
    pub name: String,
    pub class: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonRecord {
    /// Present only when the portal shows a homework note for the lesson.
    pub lesson_id: Option<String>,
    pub subject: String,
    pub level: String,
    /// e.g. `2024-2025`, from the class code.
    pub academic_year: String,
    pub teacher_initials: String,
    pub teacher_name: Option<String>,
    pub location: String,
    pub day: String,
    pub date: NaiveDate,
    /// `1`..`6`, `All day`, or `N/A` when the column is unrecognised.
    pub time_slot: String,
    pub time_range: String,
    pub cancelled: bool,
    pub homework: Option<String>,
}

impl LessonRecord {
    pub fn start_time(&self) -> &str {
        self.time_range.split_once('-').map_or("", |(s, _)| s)
    }

    pub fn end_time(&self) -> &str {
        self.time_range.split_once('-').map_or("", |(_, e)| e)
    }
}

/// Everything the parser pulls from one week's timetable payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeekPage {
    pub week_number: u32,
    pub year: i32,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub student: Option<StudentInfo>,
    pub lessons: Vec<LessonRecord>,
}
