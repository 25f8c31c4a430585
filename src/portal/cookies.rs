use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// How long a saved login is trusted before a fresh login is forced.
pub const COOKIE_LIFETIME_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_path() -> String {
    "/".to_string()
}

/// On-disk cookie file written after a successful login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieFile {
    pub cookies: Vec<StoredCookie>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CookieFile {
    pub fn from_map(cookies: &HashMap<String, String>, domain: &str) -> Self {
        let now = Utc::now();
        let mut cookies: Vec<StoredCookie> = cookies
            .iter()
            .map(|(name, value)| StoredCookie {
                name: name.clone(),
                value: value.clone(),
                domain: domain.to_string(),
                path: default_path(),
            })
            .collect();
        cookies.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            cookies,
            created_at: now,
            expires_at: now + Duration::hours(COOKIE_LIFETIME_HOURS),
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Load a cookie file. A missing file is `Ok(None)`; a malformed one is an error.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            log::info!("Cookie file not found: {}", path.display());
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        log::info!("Saved {} cookies to {}", self.cookies.len(), path.display());
        Ok(())
    }
}

/// Parse a `Cookie:` header value (`a=1; b=2`) into a map.
pub fn parse_cookie_header(header: &str) -> HashMap<String, String> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}
