pub mod extract;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::portal::RemotePortal;

pub use extract::{extract, ExtractionStrategy};

/// Short-lived parameters the portal expects on every fragment request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParameters {
    /// `lname`; scoped to the login session.
    pub session_token: String,
    /// `timex`; increases monotonically.
    pub request_nonce: String,
    pub obtained_at: DateTime<Utc>,
    /// Bumped on every refresh so callers can tell a fresh set from the one
    /// that just failed them.
    pub generation: u64,
}

impl SessionParameters {
    pub fn new(session_token: impl Into<String>, request_nonce: impl Into<String>, generation: u64) -> Self {
        Self {
            session_token: session_token.into(),
            request_nonce: request_nonce.into(),
            obtained_at: Utc::now(),
            generation,
        }
    }
}

/// Caches `SessionParameters` and refreshes them from the portal's current
/// page. Refresh is single-flight: concurrent callers queue on the cache
/// lock and pick up whatever the first caller stored.
pub struct SessionParameterProvider {
    portal: Arc<dyn RemotePortal>,
    cached: Mutex<Option<Arc<SessionParameters>>>,
    generation: AtomicU64,
}

impl SessionParameterProvider {
    pub fn new(portal: Arc<dyn RemotePortal>) -> Self {
        Self {
            portal,
            cached: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub async fn get(&self) -> Result<Arc<SessionParameters>> {
        let mut cached = self.cached.lock().await;
        if let Some(params) = cached.as_ref() {
            return Ok(params.clone());
        }
        let params = self.fetch().await?;
        *cached = Some(params.clone());
        Ok(params)
    }

    pub async fn invalidate(&self) {
        let mut cached = self.cached.lock().await;
        if cached.take().is_some() {
            log::debug!("Session parameters invalidated");
        }
    }

    /// Replace the cached parameters with a fresh extraction.
    pub async fn refresh(&self) -> Result<Arc<SessionParameters>> {
        let mut cached = self.cached.lock().await;
        let params = self.fetch().await?;
        *cached = Some(params.clone());
        Ok(params)
    }

    /// Generation of the most recent successful refresh; 0 before the first.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Cached parameters without triggering a refresh.
    pub async fn peek(&self) -> Option<Arc<SessionParameters>> {
        self.cached.lock().await.clone()
    }

    async fn fetch(&self) -> Result<Arc<SessionParameters>> {
        let markup = self.portal.current_markup().await?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let params = refresh_from(&markup, generation)?;
        log::info!("Session parameters refreshed (generation {generation})");
        Ok(Arc::new(params))
    }
}

/// Build parameters from a page. The nonce falls back to the current Unix
/// time in milliseconds.
pub fn refresh_from(markup: &str, generation: u64) -> Result<SessionParameters> {
    let found = extract(markup)?;
    let nonce = found.nonce.unwrap_or_else(|| {
        log::debug!("No timer in page; using current time");
        Utc::now().timestamp_millis().to_string()
    });
    Ok(SessionParameters::new(found.token, nonce, generation))
}
