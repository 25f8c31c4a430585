use std::collections::HashMap;

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::model::{LessonRecord, ScheduleSlot, StudentInfo};

// ── Config ─────────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))",
        params![key, value],
    )?;
    Ok(())
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Processed Slots ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ProcessedSlot {
    pub slot_key: String,
    pub week_offset: i32,
    pub week_number: u32,
    pub year: i32,
    pub start_date: String,
    pub end_date: String,
    pub processed_at: String,
}

pub fn mark_slot_processed(conn: &Connection, slot: &ScheduleSlot) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO processed_slots
            (slot_key, week_offset, week_number, year, start_date, end_date, processed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))",
        params![
            slot.slot_key,
            slot.offset,
            slot.week_number,
            slot.year,
            slot.start_date.to_string(),
            slot.end_date.to_string(),
        ],
    )?;
    Ok(())
}

pub fn processed_slot_keys(conn: &Connection) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT slot_key FROM processed_slots")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect()
}

pub fn list_processed_slots(conn: &Connection) -> Result<Vec<ProcessedSlot>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT slot_key, week_offset, week_number, year, start_date, end_date, processed_at
         FROM processed_slots ORDER BY start_date",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(ProcessedSlot {
            slot_key: row.get(0)?,
            week_offset: row.get(1)?,
            week_number: row.get(2)?,
            year: row.get(3)?,
            start_date: row.get(4)?,
            end_date: row.get(5)?,
            processed_at: row.get(6)?,
        })
    })?;
    rows.collect()
}

/// Forget every processed slot, so the next run fetches them again.
pub fn clear_processed_slots(conn: &Connection) -> Result<usize, rusqlite::Error> {
    conn.execute("DELETE FROM processed_slots", [])
}

// ── Weeks & Lessons ────────────────────────────────────────────────

/// Store a week and replace its lessons. Re-persisting a week is idempotent.
pub fn replace_week(
    conn: &Connection,
    slot: &ScheduleSlot,
    student: Option<&StudentInfo>,
    lessons: &[LessonRecord],
    file_name: &str,
) -> Result<(), rusqlite::Error> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO weeks
            (slot_key, week_offset, week_number, year, start_date, end_date,
             student_name, student_class, file_name, synced_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, datetime('now'))
         ON CONFLICT(slot_key) DO UPDATE SET
            week_offset = excluded.week_offset,
            week_number = excluded.week_number,
            year = excluded.year,
            start_date = excluded.start_date,
            end_date = excluded.end_date,
            student_name = COALESCE(excluded.student_name, weeks.student_name),
            student_class = COALESCE(excluded.student_class, weeks.student_class),
            file_name = excluded.file_name,
            synced_at = excluded.synced_at",
        params![
            slot.slot_key,
            slot.offset,
            slot.week_number,
            slot.year,
            slot.start_date.to_string(),
            slot.end_date.to_string(),
            student.map(|s| s.name.as_str()),
            student.map(|s| s.class.as_str()),
            file_name,
        ],
    )?;
    tx.execute("DELETE FROM lessons WHERE slot_key = ?1", params![slot.slot_key])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO lessons
                (slot_key, position, lesson_id, subject, level, academic_year,
                 teacher_initials, teacher_name, location, day, date,
                 time_slot, time_range, cancelled, homework)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        )?;
        for (position, lesson) in lessons.iter().enumerate() {
            stmt.execute(params![
                slot.slot_key,
                position as i64,
                lesson.lesson_id,
                lesson.subject,
                lesson.level,
                lesson.academic_year,
                lesson.teacher_initials,
                lesson.teacher_name,
                lesson.location,
                lesson.day,
                lesson.date.to_string(),
                lesson.time_slot,
                lesson.time_range,
                lesson.cancelled,
                lesson.homework,
            ])?;
        }
    }
    tx.commit()
}

pub fn get_week_lessons(conn: &Connection, slot_key: &str) -> Result<Vec<LessonRecord>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT lesson_id, subject, level, academic_year, teacher_initials, teacher_name,
                location, day, date, time_slot, time_range, cancelled, homework
         FROM lessons WHERE slot_key = ?1 ORDER BY position",
    )?;
    let rows = stmt.query_map(params![slot_key], |row| {
        let date: String = row.get(8)?;
        let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(LessonRecord {
            lesson_id: row.get(0)?,
            subject: row.get(1)?,
            level: row.get(2)?,
            academic_year: row.get(3)?,
            teacher_initials: row.get(4)?,
            teacher_name: row.get(5)?,
            location: row.get(6)?,
            day: row.get(7)?,
            date,
            time_slot: row.get(9)?,
            time_range: row.get(10)?,
            cancelled: row.get(11)?,
            homework: row.get(12)?,
        })
    })?;
    rows.collect()
}

// ── Teachers ───────────────────────────────────────────────────────

pub fn replace_teachers(conn: &Connection, teachers: &HashMap<String, String>) -> Result<(), rusqlite::Error> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM teachers", [])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO teachers (initials, full_name, cached_at) VALUES (?1, ?2, datetime('now'))",
        )?;
        for (initials, name) in teachers {
            stmt.execute(params![initials, name])?;
        }
    }
    tx.commit()
}

pub fn get_teachers(conn: &Connection) -> Result<HashMap<String, String>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT initials, full_name FROM teachers")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Sync Jobs ──────────────────────────────────────────────────────

pub fn insert_sync_job(conn: &Connection, selection: &str) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_jobs (selection, status, started_at)
         VALUES (?1, 'running', datetime('now'))",
        params![selection],
    )?;
    Ok(conn.last_insert_rowid())
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobCounts {
    pub slots_complete: u32,
    pub slots_partial: u32,
    pub slots_skipped: u32,
    pub slots_failed: u32,
    pub lessons_synced: u64,
}

pub fn update_sync_job(
    conn: &Connection,
    job_id: i64,
    status: &str,
    counts: &JobCounts,
    error_message: Option<&str>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE sync_jobs SET
            status = ?2, completed_at = datetime('now'),
            slots_complete = ?3, slots_partial = ?4,
            slots_skipped = ?5, slots_failed = ?6,
            lessons_synced = ?7, error_message = ?8
         WHERE id = ?1",
        params![
            job_id,
            status,
            counts.slots_complete,
            counts.slots_partial,
            counts.slots_skipped,
            counts.slots_failed,
            counts.lessons_synced as i64,
            error_message,
        ],
    )?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncJob {
    pub id: i64,
    pub selection: String,
    pub status: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub counts: JobCounts,
    pub error_message: Option<String>,
}

pub fn last_sync_job(conn: &Connection) -> Result<Option<SyncJob>, rusqlite::Error> {
    conn.query_row(
        "SELECT id, selection, status, started_at, completed_at,
                slots_complete, slots_partial, slots_skipped, slots_failed,
                lessons_synced, error_message
         FROM sync_jobs ORDER BY id DESC LIMIT 1",
        [],
        |row| {
            Ok(SyncJob {
                id: row.get(0)?,
                selection: row.get(1)?,
                status: row.get(2)?,
                started_at: row.get(3)?,
                completed_at: row.get(4)?,
                counts: JobCounts {
                    slots_complete: row.get(5)?,
                    slots_partial: row.get(6)?,
                    slots_skipped: row.get(7)?,
                    slots_failed: row.get(8)?,
                    lessons_synced: row.get::<_, i64>(9)? as u64,
                },
                error_message: row.get(10)?,
            })
        },
    )
    .optional()
}

// ── Status ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub processed_slots: i64,
    pub weeks: i64,
    pub lessons: i64,
    pub lessons_with_homework: i64,
    pub teachers: i64,
}

pub fn store_status(conn: &Connection) -> Result<StoreStatus, rusqlite::Error> {
    let count = |sql: &str| conn.query_row(sql, [], |row| row.get::<_, i64>(0));
    Ok(StoreStatus {
        processed_slots: count("SELECT COUNT(*) FROM processed_slots")?,
        weeks: count("SELECT COUNT(*) FROM weeks")?,
        lessons: count("SELECT COUNT(*) FROM lessons")?,
        lessons_with_homework: count("SELECT COUNT(*) FROM lessons WHERE homework IS NOT NULL")?,
        teachers: count("SELECT COUNT(*) FROM teachers")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    fn slot(key: &str) -> ScheduleSlot {
        ScheduleSlot {
            slot_key: key.to_string(),
            offset: 0,
            week_number: 12,
            year: 2025,
            start_date: NaiveDate::from_ymd_opt(2025, 3, 17).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2025, 3, 23).unwrap(),
        }
    }

    fn lesson(id: &str, homework: Option<&str>) -> LessonRecord {
        LessonRecord {
            lesson_id: Some(id.to_string()),
            subject: "evf".into(),
            level: "A".into(),
            academic_year: "2024-2025".into(),
            teacher_initials: "JOH".into(),
            teacher_name: Some("Jóhanna Hansen".into()),
            location: "608".into(),
            day: "Monday".into(),
            date: NaiveDate::from_ymd_opt(2025, 3, 17).unwrap(),
            time_slot: "1".into(),
            time_range: "08:10-09:40".into(),
            cancelled: false,
            homework: homework.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_config_round_trip() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                set_config(conn, "student_id", "12345")?;
                let val = get_config(conn, "student_id")?;
                assert_eq!(val, Some("12345".to_string()));

                let missing = get_config(conn, "nonexistent")?;
                assert_eq!(missing, None);

                set_config(conn, "base_url", "https://tg.glasir.fo")?;
                assert_eq!(list_config(conn)?.len(), 2);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_replace_week_is_idempotent() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let s = slot("2025-W12");
                let student = StudentInfo {
                    name: "Rókur".into(),
                    class: "22y".into(),
                };
                let lessons = vec![lesson("L1", Some("Les s. 12")), lesson("L2", None)];
                replace_week(conn, &s, Some(&student), &lessons, "a.json")?;
                replace_week(conn, &s, None, &lessons, "a.json")?;

                let stored = get_week_lessons(conn, "2025-W12")?;
                assert_eq!(stored, lessons);

                let status = store_status(conn)?;
                assert_eq!(status.weeks, 1);
                assert_eq!(status.lessons, 2);
                assert_eq!(status.lessons_with_homework, 1);

                let name: Option<String> = conn.query_row(
                    "SELECT student_name FROM weeks WHERE slot_key = '2025-W12'",
                    [],
                    |row| row.get(0),
                )?;
                assert_eq!(name.as_deref(), Some("Rókur"));
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_processed_slots() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                mark_slot_processed(conn, &slot("A"))?;
                mark_slot_processed(conn, &slot("B"))?;
                mark_slot_processed(conn, &slot("A"))?;

                let mut keys = processed_slot_keys(conn)?;
                keys.sort();
                assert_eq!(keys, vec!["A".to_string(), "B".to_string()]);
                assert_eq!(list_processed_slots(conn)?[0].week_number, 12);

                assert_eq!(clear_processed_slots(conn)?, 2);
                assert!(processed_slot_keys(conn)?.is_empty());
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_teachers_replace() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let mut map = HashMap::new();
                map.insert("JOH".to_string(), "Jóhanna Hansen".to_string());
                replace_teachers(conn, &map)?;
                map.insert("ABC".to_string(), "Anna B. Crane".to_string());
                replace_teachers(conn, &map)?;
                assert_eq!(get_teachers(conn)?, map);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sync_job_lifecycle() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                assert!(last_sync_job(conn)?.is_none());
                let id = insert_sync_job(conn, "current")?;
                let counts = JobCounts {
                    slots_complete: 2,
                    slots_skipped: 1,
                    lessons_synced: 40,
                    ..JobCounts::default()
                };
                update_sync_job(conn, id, "success", &counts, None)?;

                let job = last_sync_job(conn)?.unwrap();
                assert_eq!(job.id, id);
                assert_eq!(job.status, "success");
                assert_eq!(job.counts.slots_complete, 2);
                assert_eq!(job.counts.lessons_synced, 40);
                assert!(job.completed_at.is_some());
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }
}
