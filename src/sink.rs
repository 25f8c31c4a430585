use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Datelike;
use serde::Serialize;

use crate::error::Result;
use crate::model::{LessonRecord, ScheduleSlot, StudentInfo};
use crate::storage::{repository, Database};

pub const FORMAT_VERSION: u32 = 2;

/// A slot whose pipeline has finished, ready to be stored.
#[derive(Debug, Clone)]
pub struct CompletedSlot {
    pub slot: ScheduleSlot,
    pub student: Option<StudentInfo>,
    pub lessons: Vec<LessonRecord>,
}

/// Receives each completed slot. Persisting the same slot twice must
/// leave one copy.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn persist(&self, completed: &CompletedSlot) -> Result<()>;
}

/// `"{year} Vika {week} - {start}-{end}.json"`, filed under the end date's
/// year so a week spanning New Year lands in the new year.
pub fn week_file_name(slot: &ScheduleSlot) -> String {
    format!(
        "{} Vika {} - {}-{}.json",
        slot.end_date.year(),
        slot.week_number,
        slot.start_date.format("%Y.%m.%d"),
        slot.end_date.format("%Y.%m.%d"),
    )
}

// ── JSON export ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeekExport<'a> {
    pub student_info: ExportStudent<'a>,
    pub events: Vec<ExportEvent<'a>>,
    pub week_info: ExportWeek,
    pub format_version: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportStudent<'a> {
    pub student_name: &'a str,
    pub class: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportWeek {
    pub week_number: u32,
    pub start_date: String,
    pub end_date: String,
    pub year: i32,
    pub week_key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportEvent<'a> {
    pub title: &'a str,
    pub level: &'a str,
    pub year: &'a str,
    pub date: String,
    pub day: &'a str,
    pub teacher: &'a str,
    pub teacher_short: &'a str,
    pub location: &'a str,
    pub time_slot: &'a str,
    pub start_time: &'a str,
    pub end_time: &'a str,
    pub time_range: &'a str,
    pub cancelled: bool,
    pub lesson_id: Option<&'a str>,
    pub description: Option<&'a str>,
}

impl<'a> WeekExport<'a> {
    pub fn new(completed: &'a CompletedSlot) -> Self {
        let slot = &completed.slot;
        let year = slot.end_date.year();
        let student_info = match &completed.student {
            Some(s) => ExportStudent {
                student_name: &s.name,
                class: &s.class,
            },
            None => ExportStudent {
                student_name: "",
                class: "",
            },
        };
        let events = completed
            .lessons
            .iter()
            .map(|l| ExportEvent {
                title: &l.subject,
                level: &l.level,
                year: &l.academic_year,
                date: l.date.to_string(),
                day: &l.day,
                teacher: l.teacher_name.as_deref().unwrap_or(&l.teacher_initials),
                teacher_short: &l.teacher_initials,
                location: &l.location,
                time_slot: &l.time_slot,
                start_time: l.start_time(),
                end_time: l.end_time(),
                time_range: &l.time_range,
                cancelled: l.cancelled,
                lesson_id: l.lesson_id.as_deref(),
                description: l.homework.as_deref(),
            })
            .collect();
        Self {
            student_info,
            events,
            week_info: ExportWeek {
                week_number: slot.week_number,
                start_date: slot.start_date.to_string(),
                end_date: slot.end_date.to_string(),
                year,
                week_key: format!("{year}_Week_{}", slot.week_number),
            },
            format_version: FORMAT_VERSION,
        }
    }
}

/// Writes one JSON file per week into a directory.
pub struct JsonDirSink {
    dir: PathBuf,
}

impl JsonDirSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl PersistenceSink for JsonDirSink {
    async fn persist(&self, completed: &CompletedSlot) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(week_file_name(&completed.slot));
        let json = serde_json::to_string_pretty(&WeekExport::new(completed))?;
        tokio::fs::write(&path, json).await?;
        log::info!("Wrote {}", path.display());
        Ok(())
    }
}

// ── SQLite ─────────────────────────────────────────────────────────

#[async_trait]
impl PersistenceSink for Database {
    async fn persist(&self, completed: &CompletedSlot) -> Result<()> {
        let completed = completed.clone();
        self.writer()
            .call(move |conn| {
                let file_name = week_file_name(&completed.slot);
                repository::replace_week(
                    conn,
                    &completed.slot,
                    completed.student.as_ref(),
                    &completed.lessons,
                    &file_name,
                )?;
                Ok::<(), rusqlite::Error>(())
            })
            .await?;
        Ok(())
    }
}

/// Fans each slot out to several sinks, stopping at the first failure.
pub struct MultiSink {
    sinks: Vec<Arc<dyn PersistenceSink>>,
}

impl MultiSink {
    pub fn new(sinks: Vec<Arc<dyn PersistenceSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl PersistenceSink for MultiSink {
    async fn persist(&self, completed: &CompletedSlot) -> Result<()> {
        for sink in &self.sinks {
            sink.persist(completed).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn completed() -> CompletedSlot {
        CompletedSlot {
            slot: ScheduleSlot {
                slot_key: "2025-W01".into(),
                offset: 0,
                week_number: 1,
                year: 2025,
                start_date: NaiveDate::from_ymd_opt(2024, 12, 30).unwrap(),
                end_date: NaiveDate::from_ymd_opt(2025, 1, 5).unwrap(),
            },
            student: Some(StudentInfo {
                name: "Rókur Kvilt Meitilberg".into(),
                class: "22y".into(),
            }),
            lessons: vec![LessonRecord {
                lesson_id: Some("L1".into()),
                subject: "evf".into(),
                level: "A".into(),
                academic_year: "2024-2025".into(),
                teacher_initials: "JOH".into(),
                teacher_name: Some("Jóhanna Hansen".into()),
                location: "608".into(),
                day: "Monday".into(),
                date: NaiveDate::from_ymd_opt(2024, 12, 30).unwrap(),
                time_slot: "1".into(),
                time_range: "08:10-09:40".into(),
                cancelled: false,
                homework: Some("Les s. 12".into()),
            }],
        }
    }

    #[test]
    fn test_cross_year_file_name() {
        assert_eq!(
            week_file_name(&completed().slot),
            "2025 Vika 1 - 2024.12.30-2025.01.05.json"
        );
    }

    #[test]
    fn test_export_shape() {
        let c = completed();
        let value = serde_json::to_value(WeekExport::new(&c)).unwrap();
        assert_eq!(value["formatVersion"], 2);
        assert_eq!(value["studentInfo"]["studentName"], "Rókur Kvilt Meitilberg");
        assert_eq!(value["weekInfo"]["weekKey"], "2025_Week_1");
        assert_eq!(value["weekInfo"]["startDate"], "2024-12-30");
        let event = &value["events"][0];
        assert_eq!(event["teacher"], "Jóhanna Hansen");
        assert_eq!(event["teacherShort"], "JOH");
        assert_eq!(event["startTime"], "08:10");
        assert_eq!(event["endTime"], "09:40");
        assert_eq!(event["description"], "Les s. 12");
        assert_eq!(event["lessonId"], "L1");
    }

    #[tokio::test]
    async fn test_json_sink_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonDirSink::new(dir.path().join("weeks"));
        let c = completed();
        sink.persist(&c).await.unwrap();
        sink.persist(&c).await.unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path().join("weeks")).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_multi_sink_writes_database_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_memory().await.unwrap();
        let sink = MultiSink::new(vec![
            Arc::new(db.clone()),
            Arc::new(JsonDirSink::new(dir.path())),
        ]);
        sink.persist(&completed()).await.unwrap();

        let lessons = db
            .reader()
            .call(|conn| repository::get_week_lessons(conn, "2025-W01"))
            .await
            .unwrap();
        assert_eq!(lessons.len(), 1);
        assert!(dir
            .path()
            .join("2025 Vika 1 - 2024.12.30-2025.01.05.json")
            .exists());
    }
}
