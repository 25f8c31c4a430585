use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Error, Result};

pub const USERNAME_ENV: &str = "GLASIR_USERNAME";
pub const PASSWORD_ENV: &str = "GLASIR_PASSWORD";

#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Supplies login credentials when the session has to be re-established.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn credentials(&self) -> Result<Credentials>;
}

/// Reads `GLASIR_USERNAME` / `GLASIR_PASSWORD` at the moment they are needed.
pub struct EnvCredentials;

#[async_trait]
impl CredentialSource for EnvCredentials {
    async fn credentials(&self) -> Result<Credentials> {
        let username = std::env::var(USERNAME_ENV)
            .map_err(|_| Error::Config(format!("{USERNAME_ENV} is not set")))?;
        let password = std::env::var(PASSWORD_ENV)
            .map_err(|_| Error::Config(format!("{PASSWORD_ENV} is not set")))?;
        Ok(Credentials { username, password })
    }
}

/// A JSON account file: `{"username": "...", "password": "..."}`.
pub struct AccountFile {
    path: PathBuf,
}

impl AccountFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CredentialSource for AccountFile {
    async fn credentials(&self) -> Result<Credentials> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            Error::Config(format!("cannot read account file {}: {e}", self.path.display()))
        })?;
        let creds: Credentials = serde_json::from_str(&raw)?;
        if creds.username.is_empty() {
            return Err(Error::Config(format!(
                "account file {} has an empty username",
                self.path.display()
            )));
        }
        Ok(creds)
    }
}

pub struct StaticCredentials(pub Credentials);

impl StaticCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self(Credentials {
            username: username.into(),
            password: password.into(),
        })
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn credentials(&self) -> Result<Credentials> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_password() {
        let creds = Credentials {
            username: "rokur".into(),
            password: "hunter2".into(),
        };
        let dbg = format!("{creds:?}");
        assert!(dbg.contains("rokur"));
        assert!(!dbg.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_account_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("account.json");
        std::fs::write(&path, r#"{"username": "rokur", "password": "pw"}"#).unwrap();

        let creds = AccountFile::new(&path).credentials().await.unwrap();
        assert_eq!(creds.username, "rokur");
        assert_eq!(creds.password, "pw");
    }

    #[tokio::test]
    async fn test_account_file_missing() {
        let err = AccountFile::new("/nonexistent/account.json")
            .credentials()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
