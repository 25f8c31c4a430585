pub mod date_util;
pub mod error;
pub mod model;
pub mod parse;
pub mod portal;
pub mod session;
pub mod sink;
pub mod storage;
pub mod sync;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub use error::{Error, Result};
pub use model::{LessonRecord, ScheduleSlot, SlotKey, StudentInfo, WeekControl, WeekPage};
pub use parse::{GlasirParser, HtmlParser};
pub use portal::{
    AccountFile, CredentialSource, EnvCredentials, HttpPortal, PortalConfig, RemotePortal,
    StaticCredentials,
};
pub use session::{SessionParameterProvider, SessionParameters};
pub use sink::{CompletedSlot, JsonDirSink, MultiSink, PersistenceSink};
pub use storage::Database;
pub use sync::{
    NoopProgress, RetryConfig, SlotOutcome, SlotReport, SyncOptions, SyncProgress, SyncReport,
    SyncStatus, WeekSelection,
};

// Re-export repository types needed by the binary crate, but not the module itself
pub use storage::repository::{ProcessedSlot, StoreStatus, SyncJob};

use portal::FormRequest;
use storage::repository;
use sync::syncer::{self, SyncContext};
use sync::{BatchScope, RetryReauthPolicy};

/// Build the portal configuration from `app_config`, falling back to defaults.
pub async fn portal_config(db: &Database, cookie_file: Option<PathBuf>) -> Result<PortalConfig> {
    let config: HashMap<String, String> = db
        .reader()
        .call(|conn| repository::list_config(conn))
        .await?
        .into_iter()
        .collect();

    let mut portal = PortalConfig {
        cookie_file,
        ..PortalConfig::default()
    };
    if let Some(url) = config.get("base_url") {
        portal.base_url = url.clone();
    }
    if let Some(url) = config.get("login_url") {
        portal.login_url = Some(url.clone());
    }
    if let Some(secs) = config.get("request_timeout_secs") {
        portal.request_timeout = Duration::from_secs(parse_config_number(
            "request_timeout_secs",
            secs,
        )?);
    }
    Ok(portal)
}

fn parse_config_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key} must be a number, got {value:?}")))
}

/// Main entry point for syncing a student's timetable.
pub struct GlasirSync {
    db: Database,
    portal: Arc<dyn RemotePortal>,
    parser: Arc<dyn HtmlParser>,
    credentials: Arc<dyn CredentialSource>,
    session: Arc<SessionParameterProvider>,
}

impl GlasirSync {
    pub fn new(
        db: Database,
        portal: Arc<dyn RemotePortal>,
        parser: Arc<dyn HtmlParser>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        let session = Arc::new(SessionParameterProvider::new(portal.clone()));
        Self {
            db,
            portal,
            parser,
            credentials,
            session,
        }
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    fn policy(&self, retry: RetryConfig) -> RetryReauthPolicy {
        RetryReauthPolicy::new(
            self.portal.clone(),
            self.session.clone(),
            self.credentials.clone(),
            retry,
        )
    }

    /// Sync options with `app_config` values laid over the defaults.
    pub async fn sync_options(&self) -> Result<SyncOptions> {
        let config: HashMap<String, String> = self.config_list().await?.into_iter().collect();
        let mut options = SyncOptions::default();
        if let Some(v) = config.get("homework_concurrency") {
            options.homework_concurrency = parse_config_number("homework_concurrency", v)?;
        }
        if let Some(v) = config.get("week_concurrency") {
            options.week_concurrency = parse_config_number("week_concurrency", v)?;
        }
        if let Some(v) = config.get("max_retries") {
            options.retry.max_retries = parse_config_number("max_retries", v)?;
        }
        Ok(options)
    }

    // ── Student identity ─────────────────────────────────────────

    /// The student id timetable requests are made for.
    /// Checks `app_config` for `student_id` first; otherwise reads it from the
    /// portal's main page and caches it.
    async fn student_id(&self, policy: &RetryReauthPolicy) -> Result<String> {
        let cached: Option<String> = self
            .db
            .reader()
            .call(|conn| repository::get_config(conn, "student_id"))
            .await?;
        if let Some(id) = cached {
            return Ok(id);
        }

        let scope = BatchScope::new();
        let markup = policy
            .run(&scope, "student id", |_| self.portal.current_markup())
            .await?;
        let Some(id) = self.parser.parse_student_id(&markup) else {
            return Err(Error::Config(
                "could not find a student id on the portal page. Run: glasirsync config set student_id <ID>"
                    .into(),
            ));
        };
        log::info!("Detected student id {id}");
        self.db
            .writer()
            .call({
                let id = id.clone();
                move |conn| repository::set_config(conn, "student_id", &id)
            })
            .await?;
        Ok(id)
    }

    // ── Teachers ─────────────────────────────────────────────────

    /// Teacher initials to full names. Uses the cached table unless it is
    /// empty or `update` is set. A failed fetch keeps whatever is cached.
    async fn teacher_map(&self, policy: &RetryReauthPolicy, update: bool) -> Result<HashMap<String, String>> {
        let cached = self
            .db
            .reader()
            .call(|conn| repository::get_teachers(conn))
            .await?;
        if !cached.is_empty() && !update {
            return Ok(cached);
        }

        let scope = BatchScope::new();
        let fetched = match policy.fetch(&scope, &FormRequest::teachers()).await {
            Ok(markup) => self.parser.parse_teacher_map(&markup),
            Err(e) if e.is_run_fatal() => return Err(e),
            Err(e) => {
                log::warn!("Could not fetch the teacher list: {e}");
                return Ok(cached);
            }
        };
        if fetched.is_empty() {
            log::warn!("Teacher list was empty; using initials only");
            return Ok(cached);
        }

        log::info!("Fetched {} teachers", fetched.len());
        self.db
            .writer()
            .call({
                let fetched = fetched.clone();
                move |conn| repository::replace_teachers(conn, &fetched)
            })
            .await?;
        Ok(fetched)
    }

    // ── Sync ─────────────────────────────────────────────────────

    pub async fn sync(
        &self,
        options: &SyncOptions,
        sink: &dyn PersistenceSink,
        cancel: &CancellationToken,
        progress: &dyn SyncProgress,
    ) -> Result<SyncReport> {
        let policy = self.policy(options.retry.clone());
        let student_id = self.student_id(&policy).await?;
        let teachers = self.teacher_map(&policy, options.update_teachers).await?;

        let ctx = SyncContext {
            db: &self.db,
            policy: &policy,
            parser: self.parser.as_ref(),
            sink,
            progress,
            cancel,
        };
        syncer::sync_weeks(&ctx, &student_id, &teachers, options).await
    }

    // ── Processed slots ──────────────────────────────────────────

    pub async fn processed_list(&self) -> Result<Vec<ProcessedSlot>> {
        Ok(self
            .db
            .reader()
            .call(|conn| repository::list_processed_slots(conn))
            .await?)
    }

    /// Forget every processed slot. Returns how many were removed.
    pub async fn processed_clear(&self) -> Result<usize> {
        Ok(self
            .db
            .writer()
            .call(|conn| repository::clear_processed_slots(conn))
            .await?)
    }

    pub async fn status(&self) -> Result<(StoreStatus, Option<SyncJob>)> {
        Ok(self
            .db
            .reader()
            .call(|conn| {
                let status = repository::store_status(conn)?;
                let job = repository::last_sync_job(conn)?;
                Ok::<_, rusqlite::Error>((status, job))
            })
            .await?)
    }

    // ── Config ───────────────────────────────────────────────────

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .db
            .reader()
            .call({
                let key = key.to_string();
                move |conn| repository::get_config(conn, &key)
            })
            .await?)
    }

    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        self.db
            .writer()
            .call({
                let key = key.to_string();
                let value = value.to_string();
                move |conn| repository::set_config(conn, &key, &value)
            })
            .await?;
        Ok(())
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        Ok(self
            .db
            .reader()
            .call(|conn| repository::list_config(conn))
            .await?)
    }
}
