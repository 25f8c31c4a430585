use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::cookie::{CookieStore, Jar};
use url::Url;

use super::cookies::{parse_cookie_header, CookieFile};
use super::requests::TIMETABLE_PAGE;
use super::{PortalResponse, RemotePortal};
use crate::error::{Error, Result};
use crate::sync::retry::check_response;

pub const DEFAULT_BASE_URL: &str = "https://tg.glasir.fo";
const USER_AGENT: &str = concat!("glasirsync/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub base_url: String,
    /// Form endpoint accepting `username` / `password`. Without one the
    /// portal can only run on imported cookies.
    pub login_url: Option<String>,
    pub timetable_path: String,
    pub request_timeout: Duration,
    /// Where cookies are loaded from at startup and saved after a login.
    pub cookie_file: Option<PathBuf>,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            login_url: None,
            timetable_path: TIMETABLE_PAGE.to_string(),
            request_timeout: Duration::from_secs(30),
            cookie_file: None,
        }
    }
}

/// Plain-HTTP portal client sharing one cookie jar across all requests.
pub struct HttpPortal {
    client: reqwest::Client,
    jar: Arc<Jar>,
    base: Url,
    config: PortalConfig,
}

impl HttpPortal {
    pub fn new(config: PortalConfig) -> Result<Self> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| Error::Config(format!("invalid base_url {}: {e}", config.base_url)))?;
        let jar = Arc::new(Jar::default());
        let client = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .timeout(config.request_timeout)
            .user_agent(USER_AGENT)
            .build()?;

        let portal = Self {
            client,
            jar,
            base,
            config,
        };
        portal.load_cookies()?;
        Ok(portal)
    }

    fn load_cookies(&self) -> Result<()> {
        let Some(path) = &self.config.cookie_file else {
            return Ok(());
        };
        let Some(file) = CookieFile::load(path)? else {
            return Ok(());
        };
        if !file.is_valid_at(chrono::Utc::now()) {
            log::warn!("Cookies in {} have expired; ignoring them", path.display());
            return Ok(());
        }
        for cookie in &file.cookies {
            let header = format!("{}={}; Path={}", cookie.name, cookie.value, cookie.path);
            self.jar.add_cookie_str(&header, &self.base);
        }
        log::info!("Loaded {} cookies from {}", file.cookies.len(), path.display());
        Ok(())
    }

    fn save_cookies(&self) -> Result<()> {
        let Some(path) = &self.config.cookie_file else {
            return Ok(());
        };
        let domain = self.base.host_str().unwrap_or_default();
        CookieFile::from_map(&self.current_cookies(), domain).save(path)
    }

    fn endpoint_url(&self, endpoint: &str) -> Result<Url> {
        self.base
            .join(endpoint)
            .map_err(|e| Error::Config(format!("invalid endpoint {endpoint}: {e}")))
    }

    async fn into_response(resp: reqwest::Response) -> Result<PortalResponse> {
        let status = resp.status().as_u16();
        let url = resp.url().to_string();
        let body = resp.text().await?;
        Ok(PortalResponse { status, url, body })
    }
}

#[async_trait]
impl RemotePortal for HttpPortal {
    async fn current_markup(&self) -> Result<String> {
        let url = self.endpoint_url(&self.config.timetable_path)?;
        let resp = Self::into_response(self.client.get(url).send().await?).await?;
        check_response(resp)
    }

    async fn post_form(&self, endpoint: &str, params: &[(String, String)]) -> Result<PortalResponse> {
        let url = self.endpoint_url(endpoint)?;
        let referer = self.endpoint_url(&self.config.timetable_path)?;
        log::trace!("POST {url}");
        let resp = self
            .client
            .post(url)
            .header(reqwest::header::REFERER, referer.as_str())
            .header("X-Requested-With", "XMLHttpRequest")
            .form(params)
            .send()
            .await?;
        Self::into_response(resp).await
    }

    async fn reauthenticate(&self, username: &str, password: &str) -> Result<bool> {
        let Some(login_url) = &self.config.login_url else {
            return Err(Error::Config(
                "no login_url configured; cannot sign in again".to_string(),
            ));
        };
        log::info!("Signing in to {login_url} as {username}");
        let resp = self
            .client
            .post(login_url)
            .form(&[("username", username), ("password", password)])
            .send()
            .await?;
        let resp = Self::into_response(resp).await?;
        if !resp.is_success() {
            log::warn!("Login returned HTTP {}", resp.status);
            return Ok(false);
        }

        // The login form accepts anything; the timetable page tells us whether it worked.
        match self.current_markup().await {
            Ok(_) => {
                self.save_cookies()?;
                Ok(true)
            }
            Err(Error::SessionExpired(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn current_cookies(&self) -> HashMap<String, String> {
        self.jar
            .cookies(&self.base)
            .and_then(|header| header.to_str().ok().map(parse_cookie_header))
            .unwrap_or_default()
    }
}
