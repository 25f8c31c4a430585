use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;

use crate::error::{classify_status, Error, FailureClass, Result};
use crate::portal::requests::FormRequest;
use crate::portal::{is_login_page, CredentialSource, PortalResponse, RemotePortal};
use crate::session::{SessionParameterProvider, SessionParameters};

/// Backoff settings for transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based), doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_backoff);
        if self.jitter {
            add_jitter(base)
        } else {
            base
        }
    }
}

/// Up to 25% either way.
fn add_jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

/// Turn a raw portal response into its body or a classified error.
pub fn check_response(response: PortalResponse) -> Result<String> {
    if is_login_page(&response) {
        return Err(Error::SessionExpired(format!(
            "login page returned for {}",
            response.url
        )));
    }
    if response.is_success() {
        return Ok(response.body);
    }
    let message = response.body.chars().take(200).collect::<String>();
    Err(match classify_status(response.status) {
        FailureClass::Auth => Error::SessionExpired(format!("HTTP {}", response.status)),
        FailureClass::Transient => Error::TransientFetch(format!("HTTP {}", response.status)),
        FailureClass::Fatal => Error::Rejected {
            status: response.status,
            message,
        },
    })
}

/// Per-batch reauthentication budget. A batch reauthenticates at most once.
#[derive(Debug, Default)]
pub struct BatchScope {
    reauth_spent: AtomicBool,
}

impl BatchScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reauth_spent(&self) -> bool {
        self.reauth_spent.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct ReauthState {
    /// Session generation that triggered the most recent reauthentication,
    /// with its outcome.
    last: Option<(u64, std::result::Result<(), String>)>,
}

/// Wraps a fetch with transient retries and a single-flight
/// reauthentication cycle.
pub struct RetryReauthPolicy {
    portal: Arc<dyn RemotePortal>,
    session: Arc<SessionParameterProvider>,
    credentials: Arc<dyn CredentialSource>,
    config: RetryConfig,
    reauth: Mutex<ReauthState>,
    reauth_count: AtomicU32,
}

impl RetryReauthPolicy {
    pub fn new(
        portal: Arc<dyn RemotePortal>,
        session: Arc<SessionParameterProvider>,
        credentials: Arc<dyn CredentialSource>,
        config: RetryConfig,
    ) -> Self {
        Self {
            portal,
            session,
            credentials,
            config,
            reauth: Mutex::new(ReauthState::default()),
            reauth_count: AtomicU32::new(0),
        }
    }

    pub fn portal(&self) -> &Arc<dyn RemotePortal> {
        &self.portal
    }

    pub fn session(&self) -> &Arc<SessionParameterProvider> {
        &self.session
    }

    /// Reauthentications actually performed.
    pub fn reauth_count(&self) -> u32 {
        self.reauth_count.load(Ordering::SeqCst)
    }

    /// Run `op` with the current session parameters until it succeeds or
    /// fails for good. Transient failures back off and retry; an expired
    /// session reauthenticates (shared with concurrent callers) and retries
    /// once; anything else is returned as is.
    pub async fn run<T, F, Fut>(&self, scope: &BatchScope, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(Arc<SessionParameters>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut transient_attempts = 0u32;
        let mut reauthenticated = false;
        loop {
            // Parameter refresh reads the main page, which fails the same
            // ways a fetch does. The generation is read first so a login
            // finished by another caller meanwhile is recognised as shared.
            let before = self.session.generation();
            let (err, seen_generation) = match self.session.get().await {
                Ok(params) => match op(params.clone()).await {
                    Ok(value) => {
                        if transient_attempts > 0 {
                            log::info!("{label}: succeeded after {} retries", transient_attempts);
                        }
                        return Ok(value);
                    }
                    Err(e) => (e, params.generation),
                },
                Err(e) => (e, before),
            };

            match err.failure_class() {
                FailureClass::Transient if transient_attempts < self.config.max_retries => {
                    let delay = self.config.backoff(transient_attempts);
                    transient_attempts += 1;
                    log::warn!(
                        "{label}: {err}; retry {transient_attempts}/{} in {}ms",
                        self.config.max_retries,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                FailureClass::Auth if !reauthenticated => {
                    log::warn!("{label}: {err}");
                    self.reauthenticate(seen_generation, scope).await?;
                    reauthenticated = true;
                }
                _ => {
                    log::debug!("{label}: giving up: {err}");
                    return Err(err);
                }
            }
        }
    }

    /// POST a form request and return the response body.
    pub async fn fetch(&self, scope: &BatchScope, request: &FormRequest) -> Result<String> {
        let label = request.endpoint;
        self.run(scope, label, |params| {
            let form = request.form(&params);
            let portal = self.portal.clone();
            async move { check_response(portal.post_form(request.endpoint, &form).await?) }
        })
        .await
    }

    /// Re-establish the session after a caller holding parameters of
    /// `seen_generation` hit an auth failure. Callers that arrive while a
    /// reauthentication for the same generation is in flight wait for it and
    /// share its result.
    async fn reauthenticate(&self, seen_generation: u64, scope: &BatchScope) -> Result<()> {
        let mut state = self.reauth.lock().await;
        if let Some((trigger, outcome)) = &state.last {
            if *trigger >= seen_generation {
                return outcome.clone().map_err(Error::ReauthenticationFailed);
            }
        }
        if scope.reauth_spent.swap(true, Ordering::SeqCst) {
            return Err(Error::SessionExpired(
                "session expired again after reauthentication".into(),
            ));
        }

        log::info!("Session expired; signing in again");
        self.reauth_count.fetch_add(1, Ordering::SeqCst);
        let outcome = match self.login().await {
            Ok(()) => Ok(()),
            Err(Error::ReauthenticationFailed(message)) => Err(message),
            Err(e) => Err(e.to_string()),
        };
        state.last = Some((seen_generation, outcome.clone()));
        outcome.map_err(Error::ReauthenticationFailed)
    }

    async fn login(&self) -> Result<()> {
        let creds = self.credentials.credentials().await?;
        if !self
            .portal
            .reauthenticate(&creds.username, &creds.password)
            .await?
        {
            return Err(Error::ReauthenticationFailed(format!(
                "portal rejected credentials for {}",
                creds.username
            )));
        }
        self.session.invalidate().await;
        let fresh = self.session.get().await?;
        log::info!("Signed in again (session generation {})", fresh.generation);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portal::StaticCredentials;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use tokio_util::sync::CancellationToken;

    use crate::sync::fetch::fetch_all;

    /// Portal whose session is valid only after a login; the token in the
    /// page changes with each login.
    struct ExpiringPortal {
        logins: AtomicUsize,
        accept_login: bool,
        posts: StdMutex<Vec<String>>,
    }

    impl ExpiringPortal {
        fn new(accept_login: bool) -> Self {
            Self {
                logins: AtomicUsize::new(0),
                accept_login,
                posts: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RemotePortal for ExpiringPortal {
        async fn current_markup(&self) -> Result<String> {
            Ok(format!("lname={}", 100 + self.logins.load(Ordering::SeqCst)))
        }

        async fn post_form(&self, _endpoint: &str, params: &[(String, String)]) -> Result<PortalResponse> {
            let lname = params
                .iter()
                .find(|(k, _)| k == "lname")
                .map(|(_, v)| v.clone())
                .unwrap_or_default();
            let q = params
                .iter()
                .find(|(k, _)| k == "q")
                .map(|(_, v)| v.clone())
                .unwrap_or_default();
            self.posts.lock().unwrap().push(format!("{q}@{lname}"));
            tokio::time::sleep(Duration::from_millis(5)).await;
            if lname == "100" {
                Ok(PortalResponse {
                    status: 200,
                    url: "https://portal/login".into(),
                    body: String::new(),
                })
            } else {
                Ok(PortalResponse::ok(format!("homework for {q}")))
            }
        }

        async fn reauthenticate(&self, _u: &str, _p: &str) -> Result<bool> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.accept_login {
                self.logins.fetch_add(1, Ordering::SeqCst);
            }
            Ok(self.accept_login)
        }

        fn current_cookies(&self) -> HashMap<String, String> {
            HashMap::new()
        }
    }

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            jitter: false,
        }
    }

    fn policy_for(portal: Arc<ExpiringPortal>) -> RetryReauthPolicy {
        let session = Arc::new(SessionParameterProvider::new(portal.clone()));
        RetryReauthPolicy::new(
            portal,
            session,
            Arc::new(StaticCredentials::new("rokur", "pw")),
            fast_config(),
        )
    }

    #[tokio::test]
    async fn test_reauth_once_for_concurrent_expiry() {
        let portal = Arc::new(ExpiringPortal::new(true));
        let policy = policy_for(portal.clone());
        let scope = BatchScope::new();
        let cancel = CancellationToken::new();

        let keys: Vec<String> = (0..10).map(|i| format!("L{i}")).collect();
        let batch = fetch_all(keys.clone(), 10, &cancel, |key| {
            let policy = &policy;
            let scope = &scope;
            async move { policy.fetch(scope, &FormRequest::homework(&key)).await }
        })
        .await;

        assert_eq!(policy.reauth_count(), 1);
        assert_eq!(batch.succeeded.len(), 10);
        assert!(batch.failed.is_empty());

        let posts = portal.posts.lock().unwrap().clone();
        assert_eq!(posts.len(), 20);
        let retried: HashSet<&String> = posts.iter().filter(|p| p.ends_with("@101")).collect();
        assert_eq!(retried.len(), 10);
    }

    #[tokio::test]
    async fn test_failed_reauth_aborts_batch() {
        let portal = Arc::new(ExpiringPortal::new(false));
        let policy = policy_for(portal);
        let scope = BatchScope::new();
        let cancel = CancellationToken::new();

        let batch = fetch_all(0..6u32, 3, &cancel, |k| {
            let policy = &policy;
            let scope = &scope;
            async move {
                policy
                    .fetch(scope, &FormRequest::homework(&format!("L{k}")))
                    .await
            }
        })
        .await;

        assert_eq!(policy.reauth_count(), 1);
        assert!(matches!(batch.aborted, Some(Error::ReauthenticationFailed(_))));
        assert!(batch.succeeded.is_empty());
    }

    /// Portal with no session at all until someone logs in.
    struct ColdPortal {
        signed_in: AtomicBool,
    }

    #[async_trait]
    impl RemotePortal for ColdPortal {
        async fn current_markup(&self) -> Result<String> {
            if self.signed_in.load(Ordering::SeqCst) {
                Ok("lname=7 timer=1".into())
            } else {
                Err(Error::SessionExpired("timetable page redirected to login".into()))
            }
        }

        async fn post_form(&self, _endpoint: &str, params: &[(String, String)]) -> Result<PortalResponse> {
            assert!(params.iter().any(|(k, v)| k == "lname" && v == "7"));
            Ok(PortalResponse::ok("<p>Heimaarbeiði<br>Les s. 3</p>"))
        }

        async fn reauthenticate(&self, _u: &str, _p: &str) -> Result<bool> {
            self.signed_in.store(true, Ordering::SeqCst);
            Ok(true)
        }

        fn current_cookies(&self) -> HashMap<String, String> {
            HashMap::new()
        }
    }

    #[tokio::test]
    async fn test_cold_start_signs_in_before_first_fetch() {
        let portal = Arc::new(ColdPortal {
            signed_in: AtomicBool::new(false),
        });
        let session = Arc::new(SessionParameterProvider::new(portal.clone()));
        let policy = RetryReauthPolicy::new(
            portal.clone(),
            session.clone(),
            Arc::new(StaticCredentials::new("rokur", "pw")),
            fast_config(),
        );
        let scope = BatchScope::new();

        let body = policy
            .fetch(&scope, &FormRequest::homework("L1"))
            .await
            .unwrap();
        assert!(body.contains("Les s. 3"));
        assert_eq!(policy.reauth_count(), 1);
        assert_eq!(session.generation(), 1);
        assert!(scope.reauth_spent());
    }

    #[tokio::test]
    async fn test_cold_start_concurrent_callers_share_one_login() {
        let portal = Arc::new(ColdPortal {
            signed_in: AtomicBool::new(false),
        });
        let session = Arc::new(SessionParameterProvider::new(portal.clone()));
        let policy = RetryReauthPolicy::new(
            portal,
            session,
            Arc::new(StaticCredentials::new("rokur", "pw")),
            fast_config(),
        );
        let scope = BatchScope::new();
        let cancel = CancellationToken::new();

        let batch = fetch_all(0..8u32, 8, &cancel, |k| {
            let policy = &policy;
            let scope = &scope;
            async move {
                policy
                    .fetch(scope, &FormRequest::homework(&format!("L{k}")))
                    .await
            }
        })
        .await;

        assert!(batch.is_complete());
        assert_eq!(batch.succeeded.len(), 8);
        assert_eq!(policy.reauth_count(), 1);
    }

    /// Main page that fails with a transient error on its first load.
    struct FlakyPagePortal {
        reads: AtomicUsize,
    }

    #[async_trait]
    impl RemotePortal for FlakyPagePortal {
        async fn current_markup(&self) -> Result<String> {
            if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::TransientFetch("HTTP 503".into()))
            } else {
                Ok("lname=9".into())
            }
        }

        async fn post_form(&self, _endpoint: &str, _params: &[(String, String)]) -> Result<PortalResponse> {
            Ok(PortalResponse::ok("ok"))
        }

        async fn reauthenticate(&self, _u: &str, _p: &str) -> Result<bool> {
            Ok(true)
        }

        fn current_cookies(&self) -> HashMap<String, String> {
            HashMap::new()
        }
    }

    #[tokio::test]
    async fn test_transient_page_load_is_retried() {
        let portal = Arc::new(FlakyPagePortal {
            reads: AtomicUsize::new(0),
        });
        let session = Arc::new(SessionParameterProvider::new(portal.clone()));
        let policy = RetryReauthPolicy::new(
            portal.clone(),
            session,
            Arc::new(StaticCredentials::new("rokur", "pw")),
            fast_config(),
        );
        let scope = BatchScope::new();

        let body = policy
            .fetch(&scope, &FormRequest::homework("L1"))
            .await
            .unwrap();
        assert_eq!(body, "ok");
        assert_eq!(portal.reads.load(Ordering::SeqCst), 2);
        assert_eq!(policy.reauth_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_retries_then_succeeds() {
        let portal = Arc::new(ExpiringPortal::new(true));
        let policy = policy_for(portal);
        let scope = BatchScope::new();
        let attempts = AtomicUsize::new(0);

        let value = policy
            .run(&scope, "flaky", |_params| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::TransientFetch("reset".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 2);
        assert_eq!(policy.reauth_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_gives_up_after_max_retries() {
        let portal = Arc::new(ExpiringPortal::new(true));
        let policy = policy_for(portal);
        let scope = BatchScope::new();
        let attempts = AtomicUsize::new(0);

        let err = policy
            .run(&scope, "down", |_params| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::TransientFetch("503".into())) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransientFetch(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let portal = Arc::new(ExpiringPortal::new(true));
        let policy = policy_for(portal);
        let scope = BatchScope::new();
        let attempts = AtomicUsize::new(0);

        let err = policy
            .run(&scope, "bad", |_params| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(Error::Rejected {
                        status: 404,
                        message: "not found".into(),
                    })
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rejected { status: 404, .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_check_response_classification() {
        assert_eq!(check_response(PortalResponse::ok("x")).unwrap(), "x");

        let err = check_response(PortalResponse {
            status: 503,
            url: String::new(),
            body: String::new(),
        })
        .unwrap_err();
        assert!(matches!(err, Error::TransientFetch(_)));

        let err = check_response(PortalResponse {
            status: 401,
            url: String::new(),
            body: String::new(),
        })
        .unwrap_err();
        assert!(matches!(err, Error::SessionExpired(_)));

        let err = check_response(PortalResponse {
            status: 400,
            url: String::new(),
            body: "bad".into(),
        })
        .unwrap_err();
        assert!(matches!(err, Error::Rejected { status: 400, .. }));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        };
        assert_eq!(config.backoff(0), Duration::from_millis(500));
        assert_eq!(config.backoff(1), Duration::from_millis(1000));
        assert_eq!(config.backoff(3), Duration::from_secs(4));
        assert_eq!(config.backoff(10), Duration::from_secs(8));
    }
}
