pub mod cookies;
pub mod credentials;
pub mod http;
pub mod requests;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;

pub use credentials::{AccountFile, CredentialSource, Credentials, EnvCredentials, StaticCredentials};
pub use http::{HttpPortal, PortalConfig};
pub use requests::FormRequest;

/// A raw response from the portal. Classification into success, transient,
/// auth or fatal failure is left to the retry policy.
#[derive(Debug, Clone)]
pub struct PortalResponse {
    pub status: u16,
    /// Final URL after redirects.
    pub url: String,
    pub body: String,
}

impl PortalResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            url: String::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The authenticated remote portal. Implementations may drive a browser or
/// speak raw HTTP; the sync engine only sees these four operations.
#[async_trait]
pub trait RemotePortal: Send + Sync {
    /// Markup of the portal's main authenticated page.
    async fn current_markup(&self) -> Result<String>;

    /// Form-encoded POST to a portal endpoint (path relative to the portal root).
    async fn post_form(&self, endpoint: &str, params: &[(String, String)]) -> Result<PortalResponse>;

    /// Log in again. `Ok(false)` means the portal refused the credentials.
    async fn reauthenticate(&self, username: &str, password: &str) -> Result<bool>;

    fn current_cookies(&self) -> HashMap<String, String>;
}

/// True when a response is the portal's login page rather than the
/// requested content, which is how an expired session shows up.
pub fn is_login_page(response: &PortalResponse) -> bool {
    let url = response.url.to_ascii_lowercase();
    if url.contains("/login") || url.contains("login.microsoftonline.com") {
        return true;
    }
    let body = &response.body;
    body.contains("type=\"password\"")
        || body.contains("type='password'")
        || body.contains("login.microsoftonline.com")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_page_by_url() {
        let resp = PortalResponse {
            status: 200,
            url: "https://tg.glasir.fo/login.asp?ReturnUrl=/132n/".into(),
            body: "<html></html>".into(),
        };
        assert!(is_login_page(&resp));
    }

    #[test]
    fn test_login_page_by_body() {
        let resp = PortalResponse::ok(r#"<form><input type="password" name="pw"></form>"#);
        assert!(is_login_page(&resp));
    }

    #[test]
    fn test_regular_fragment_is_not_login() {
        let resp = PortalResponse::ok("<p><b>Heimaarbeiði</b><br>Les s. 12-14</p>");
        assert!(!is_login_page(&resp));
        assert!(resp.is_success());
    }
}
