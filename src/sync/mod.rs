pub mod dedup;
pub mod discovery;
pub mod fetch;
pub mod merge;
pub mod retry;
pub mod syncer;

use serde::Serialize;

use crate::model::{ScheduleSlot, SlotKey};

pub use dedup::OffsetDedupTracker;
pub use discovery::{WeekRangeDiscovery, WeekSelection};
pub use fetch::{fetch_all, FetchBatchResult};
pub use merge::merge;
pub use retry::{BatchScope, RetryConfig, RetryReauthPolicy};
pub use syncer::{RunContext, SlotReport};

pub const DEFAULT_HOMEWORK_CONCURRENCY: usize = 10;
pub const DEFAULT_WEEK_CONCURRENCY: usize = 5;

/// Options controlling a sync run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub selection: WeekSelection,
    pub homework_concurrency: usize,
    pub week_concurrency: usize,
    pub retry: RetryConfig,
    /// Ignore slots recorded as processed by earlier runs.
    pub full: bool,
    /// Refetch the teacher directory even when a cached copy exists.
    pub update_teachers: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            selection: WeekSelection::Current,
            homework_concurrency: DEFAULT_HOMEWORK_CONCURRENCY,
            week_concurrency: DEFAULT_WEEK_CONCURRENCY,
            retry: RetryConfig::default(),
            full: false,
            update_teachers: false,
        }
    }
}

/// How one slot ended up in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlotOutcome {
    /// Fetched, merged with all homework, persisted and marked processed.
    Complete,
    /// Persisted, but some homework notes could not be fetched; not marked.
    Partial,
    /// Already processed by an earlier run.
    Skipped,
    Failed,
}

impl SlotOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotOutcome::Complete => "complete",
            SlotOutcome::Partial => "partial",
            SlotOutcome::Skipped => "skipped",
            SlotOutcome::Failed => "failed",
        }
    }
}

/// Report returned after a sync run completes.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub status: SyncStatus,
    pub slots_complete: u32,
    pub slots_partial: u32,
    pub slots_skipped: u32,
    pub slots_failed: u32,
    pub lessons_synced: u64,
    pub homework_fetched: u64,
    pub homework_failed: u64,
    pub reauthentications: u32,
    pub slots: Vec<SlotReport>,
    pub error: Option<String>,
}

impl SyncReport {
    /// Build a report, deriving the status from the slot outcomes.
    pub fn from_slots(slots: Vec<SlotReport>, reauthentications: u32) -> Self {
        let count = |o: SlotOutcome| slots.iter().filter(|s| s.outcome == o).count() as u32;
        let slots_complete = count(SlotOutcome::Complete);
        let slots_partial = count(SlotOutcome::Partial);
        let slots_skipped = count(SlotOutcome::Skipped);
        let slots_failed = count(SlotOutcome::Failed);

        let status = if slots_partial == 0 && slots_failed == 0 {
            SyncStatus::Success
        } else if slots_complete > 0 || slots_partial > 0 {
            SyncStatus::PartialFailure
        } else {
            SyncStatus::Failed
        };
        let error = match (slots_failed, slots_partial) {
            (0, 0) => None,
            (f, 0) => Some(format!("{f} slots failed")),
            (0, p) => Some(format!("{p} slots missing homework")),
            (f, p) => Some(format!("{f} slots failed, {p} slots missing homework")),
        };

        Self {
            status,
            slots_complete,
            slots_partial,
            slots_skipped,
            slots_failed,
            lessons_synced: slots.iter().map(|s| s.lessons as u64).sum(),
            homework_fetched: slots.iter().map(|s| s.homework_fetched as u64).sum(),
            homework_failed: slots.iter().map(|s| s.homework_failed as u64).sum(),
            reauthentications,
            slots,
            error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SyncStatus {
    Success,
    PartialFailure,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::PartialFailure => "partial_failure",
            SyncStatus::Failed => "failed",
        }
    }
}

/// Callbacks for reporting run progress.
pub trait SyncProgress: Send + Sync {
    fn on_run_start(&self, _slots_total: usize) {}
    fn on_slot_skipped(&self, _slot_key: &SlotKey) {}
    fn on_week_fetched(&self, _slot: &ScheduleSlot, _lessons: usize) {}
    fn on_homework_progress(&self, _slot_key: &SlotKey, _done: usize, _total: usize) {}
    fn on_slot_complete(&self, _report: &SlotReport) {}
}

/// Progress reporter that does nothing.
pub struct NoopProgress;

impl SyncProgress for NoopProgress {}
