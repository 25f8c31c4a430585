use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::model::{ScheduleSlot, SlotKey, WeekControl};
use crate::parse::HtmlParser;
use crate::portal::requests::FormRequest;
use crate::sink::{CompletedSlot, PersistenceSink};
use crate::storage::repository::{self, JobCounts};
use crate::storage::Database;
use crate::sync::dedup::OffsetDedupTracker;
use crate::sync::discovery::WeekRangeDiscovery;
use crate::sync::fetch::fetch_all;
use crate::sync::merge::{apply_teacher_names, merge};
use crate::sync::retry::{BatchScope, RetryReauthPolicy};
use crate::sync::{SlotOutcome, SyncOptions, SyncProgress, SyncReport};

/// Per-slot result, as shown to the user.
#[derive(Debug, Clone, Serialize)]
pub struct SlotReport {
    pub slot_key: SlotKey,
    pub offset: i32,
    pub outcome: SlotOutcome,
    pub lessons: usize,
    pub homework_fetched: usize,
    pub homework_failed: usize,
    pub error: Option<String>,
}

impl SlotReport {
    fn skipped(control: &WeekControl) -> Self {
        Self {
            slot_key: control.slot_key.clone(),
            offset: control.offset,
            outcome: SlotOutcome::Skipped,
            lessons: 0,
            homework_fetched: 0,
            homework_failed: 0,
            error: None,
        }
    }

    fn failed(slot_key: SlotKey, offset: i32, error: &Error) -> Self {
        Self {
            slot_key,
            offset,
            outcome: SlotOutcome::Failed,
            lessons: 0,
            homework_fetched: 0,
            homework_failed: 0,
            error: Some(error.to_string()),
        }
    }
}

/// Results accumulated over one run. Passed through the pipeline instead
/// of any shared global state.
#[derive(Debug)]
pub struct RunContext {
    pub selection: String,
    pub started_at: DateTime<Utc>,
    slots: Mutex<Vec<SlotReport>>,
}

impl RunContext {
    pub fn new(selection: impl Into<String>) -> Self {
        Self {
            selection: selection.into(),
            started_at: Utc::now(),
            slots: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, report: SlotReport) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report);
    }

    pub fn slots(&self) -> Vec<SlotReport> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn into_report(self, reauthentications: u32) -> SyncReport {
        let mut slots = self.slots.into_inner().unwrap_or_else(PoisonError::into_inner);
        slots.sort_by_key(|s| (s.offset.abs(), s.offset));
        SyncReport::from_slots(slots, reauthentications)
    }
}

/// Everything a run talks to.
pub struct SyncContext<'a> {
    pub db: &'a Database,
    pub policy: &'a RetryReauthPolicy,
    pub parser: &'a dyn HtmlParser,
    pub sink: &'a dyn PersistenceSink,
    pub progress: &'a dyn SyncProgress,
    pub cancel: &'a CancellationToken,
}

/// Sync the selected weeks for one student.
///
/// Slots already recorded as processed are skipped unless `options.full`.
/// A slot is marked processed only after its lessons and all their
/// homework have been fetched, merged and persisted. Run-level failures
/// (no offsets for a range selection, failed reauthentication, unusable
/// session parameters) stop the run and are returned after the job row is
/// closed; slots persisted before that stay persisted.
pub async fn sync_weeks(
    ctx: &SyncContext<'_>,
    student_id: &str,
    teachers: &HashMap<String, String>,
    options: &SyncOptions,
) -> Result<SyncReport> {
    let run = RunContext::new(options.selection.to_string());
    let job_id = ctx
        .db
        .writer()
        .call({
            let selection = run.selection.clone();
            move |conn| repository::insert_sync_job(conn, &selection)
        })
        .await?;
    let reauths_before = ctx.policy.reauth_count();

    let result = run_pipeline(ctx, &run, student_id, teachers, options).await;
    let report = run.into_report(ctx.policy.reauth_count() - reauths_before);

    let counts = JobCounts {
        slots_complete: report.slots_complete,
        slots_partial: report.slots_partial,
        slots_skipped: report.slots_skipped,
        slots_failed: report.slots_failed,
        lessons_synced: report.lessons_synced,
    };
    let (status, error) = match &result {
        Ok(()) => (report.status.as_str().to_string(), report.error.clone()),
        Err(e) => ("failed".to_string(), Some(e.to_string())),
    };
    ctx.db
        .writer()
        .call(move |conn| repository::update_sync_job(conn, job_id, &status, &counts, error.as_deref()))
        .await?;

    result.map(|()| report)
}

async fn run_pipeline(
    ctx: &SyncContext<'_>,
    run: &RunContext,
    student_id: &str,
    teachers: &HashMap<String, String>,
    options: &SyncOptions,
) -> Result<()> {
    let tracker = if options.full {
        OffsetDedupTracker::new()
    } else {
        let keys = ctx
            .db
            .reader()
            .call(|conn| repository::processed_slot_keys(conn))
            .await?;
        OffsetDedupTracker::with_processed(keys)
    };

    let controls = WeekRangeDiscovery::new(ctx.policy, ctx.parser, student_id)
        .discover()
        .await?;
    let offsets = options.selection.offsets(&controls)?;
    let by_offset: HashMap<i32, &WeekControl> = controls.iter().map(|c| (c.offset, c)).collect();

    let mut pending: HashMap<SlotKey, WeekControl> = HashMap::new();
    for offset in offsets {
        let Some(control) = by_offset.get(&offset) else {
            let err = Error::Parse(format!("no week selector entry for offset {offset}"));
            log::warn!("{err}");
            run.record(SlotReport::failed(format!("offset:{offset}"), offset, &err));
            continue;
        };
        if !tracker.should_process(&control.slot_key) {
            log::info!("Skipping {} (already processed)", control.slot_key);
            ctx.progress.on_slot_skipped(&control.slot_key);
            run.record(SlotReport::skipped(control));
            continue;
        }
        pending.insert(control.slot_key.clone(), (*control).clone());
    }

    ctx.progress.on_run_start(pending.len());
    log::info!("Syncing {} weeks for student {student_id}", pending.len());

    let week_scope = BatchScope::new();
    let keys: Vec<SlotKey> = pending.keys().cloned().collect();
    let batch = fetch_all(keys, options.week_concurrency, ctx.cancel, |key| {
        let control = pending.get(&key).cloned();
        let week_scope = &week_scope;
        let tracker = &tracker;
        async move {
            let control = control.ok_or_else(|| Error::Other(format!("unknown slot {key}")))?;
            process_slot(ctx, week_scope, tracker, &control, student_id, teachers, options).await
        }
    })
    .await;

    for (_, report) in batch.succeeded {
        run.record(report);
    }
    for (key, err) in &batch.failed {
        let offset = pending.get(key).map(|c| c.offset).unwrap_or_default();
        if !matches!(err, Error::Cancelled) {
            log::error!("Week {key} failed: {err}");
        }
        let report = SlotReport::failed(key.clone(), offset, err);
        ctx.progress.on_slot_complete(&report);
        run.record(report);
    }

    match batch.aborted {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Fetch, parse, merge and persist one week.
async fn process_slot(
    ctx: &SyncContext<'_>,
    week_scope: &BatchScope,
    tracker: &OffsetDedupTracker,
    control: &WeekControl,
    student_id: &str,
    teachers: &HashMap<String, String>,
    options: &SyncOptions,
) -> Result<SlotReport> {
    let markup = ctx
        .policy
        .fetch(week_scope, &FormRequest::week(student_id, control.offset))
        .await?;
    let page = ctx.parser.parse_week(&markup)?;
    let slot = ScheduleSlot {
        slot_key: control.slot_key.clone(),
        offset: control.offset,
        week_number: page.week_number,
        year: page.year,
        start_date: page.start_date,
        end_date: page.end_date,
    };
    ctx.progress.on_week_fetched(&slot, page.lessons.len());

    let mut lesson_ids: Vec<String> = page
        .lessons
        .iter()
        .filter_map(|l| l.lesson_id.clone())
        .collect();
    lesson_ids.sort();
    lesson_ids.dedup();
    let total = lesson_ids.len();

    let homework_scope = BatchScope::new();
    let done = AtomicUsize::new(0);
    let homework_batch = fetch_all(lesson_ids, options.homework_concurrency, ctx.cancel, |id| {
        let homework_scope = &homework_scope;
        let done = &done;
        let slot_key = &slot.slot_key;
        async move {
            let body = ctx
                .policy
                .fetch(homework_scope, &FormRequest::homework(&id))
                .await?;
            let n = done.fetch_add(1, Ordering::SeqCst) + 1;
            ctx.progress.on_homework_progress(slot_key, n, total);
            Ok(ctx.parser.parse_homework(&body))
        }
    })
    .await;
    if let Some(e) = homework_batch.aborted {
        return Err(e);
    }
    for (id, err) in &homework_batch.failed {
        log::warn!("Homework {id} for {} failed: {err}", slot.slot_key);
    }

    let homework_fetched = homework_batch.succeeded.len();
    let homework_failed = homework_batch.failed.len();
    let homework: HashMap<String, String> = homework_batch
        .succeeded
        .into_iter()
        .filter_map(|(id, text)| text.map(|t| (id, t)))
        .collect();

    let mut lessons = merge(page.lessons, &homework)?;
    apply_teacher_names(&mut lessons, teachers);
    let lesson_count = lessons.len();

    ctx.sink
        .persist(&CompletedSlot {
            slot: slot.clone(),
            student: page.student,
            lessons,
        })
        .await?;

    let outcome = if homework_failed == 0 {
        ctx.db
            .writer()
            .call({
                let slot = slot.clone();
                move |conn| repository::mark_slot_processed(conn, &slot)
            })
            .await?;
        tracker.mark_processed(slot.slot_key.clone());
        SlotOutcome::Complete
    } else {
        SlotOutcome::Partial
    };
    log::info!(
        "Week {} ({}): {lesson_count} lessons, {homework_fetched}/{total} homework notes, {}",
        slot.week_number,
        slot.slot_key,
        outcome.as_str()
    );

    let report = SlotReport {
        slot_key: slot.slot_key,
        offset: slot.offset,
        outcome,
        lessons: lesson_count,
        homework_fetched,
        homework_failed,
        error: (homework_failed > 0).then(|| format!("{homework_failed} homework notes missing")),
    };
    ctx.progress.on_slot_complete(&report);
    Ok(report)
}
