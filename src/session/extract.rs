use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

static MY_UPDATE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"MyUpdate\('[^']*','[^']*','[^']*',(\d+),").unwrap());
static MY_UPDATE_NONCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"MyUpdate\('[^']*','[^']*','[^']*',\d+,(\d+)\)").unwrap());
static XHR_SEND_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"xmlhttp\.send\("[^"]*lname=([^&"'\s]+)"#).unwrap());
static QUERY_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"lname=([^&"'\s<>]+)"#).unwrap());
static QUERY_NONCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"timer\s*=\s*(\d+)").unwrap());
static SCRIPT_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'lname':\s*'([^']+)'").unwrap());
static SCRIPT_NONCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'timer':\s*'(\d+)'").unwrap());
static INPUT_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"name=['"]lname['"]\s*value=['"]([^'"]+)['"]"#).unwrap());
static INPUT_NONCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"name=['"]timer['"]\s*value=['"](\d+)['"]"#).unwrap());

/// One way the portal embeds its session parameters in a page. Tried in
/// `ExtractionStrategy::ALL` order; the first match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStrategy {
    /// Arguments of the page's `MyUpdate('..','..','..',lname,timer)` call.
    MyUpdateCall,
    /// The form body assembled by `xmlhttp.send("...lname=...")`.
    XhrSend,
    /// `lname=` / `timer=` anywhere in the page, e.g. a query string.
    QueryParam,
    InlineScriptData,
    HiddenInput,
}

impl ExtractionStrategy {
    pub const ALL: [ExtractionStrategy; 5] = [
        ExtractionStrategy::MyUpdateCall,
        ExtractionStrategy::XhrSend,
        ExtractionStrategy::QueryParam,
        ExtractionStrategy::InlineScriptData,
        ExtractionStrategy::HiddenInput,
    ];

    fn token_pattern(self) -> &'static Regex {
        match self {
            ExtractionStrategy::MyUpdateCall => &MY_UPDATE_TOKEN,
            ExtractionStrategy::XhrSend => &XHR_SEND_TOKEN,
            ExtractionStrategy::QueryParam => &QUERY_TOKEN,
            ExtractionStrategy::InlineScriptData => &SCRIPT_TOKEN,
            ExtractionStrategy::HiddenInput => &INPUT_TOKEN,
        }
    }

    fn nonce_pattern(self) -> Option<&'static Regex> {
        match self {
            ExtractionStrategy::MyUpdateCall => Some(&MY_UPDATE_NONCE),
            ExtractionStrategy::XhrSend => None,
            ExtractionStrategy::QueryParam => Some(&QUERY_NONCE),
            ExtractionStrategy::InlineScriptData => Some(&SCRIPT_NONCE),
            ExtractionStrategy::HiddenInput => Some(&INPUT_NONCE),
        }
    }

    pub fn token(self, markup: &str) -> Option<String> {
        capture(self.token_pattern(), markup)
    }

    pub fn nonce(self, markup: &str) -> Option<String> {
        self.nonce_pattern().and_then(|re| capture(re, markup))
    }
}

fn capture(re: &Regex, haystack: &str) -> Option<String> {
    re.captures(haystack)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub token: String,
    pub token_strategy: ExtractionStrategy,
    /// `None` when no strategy found a nonce; the caller synthesises one.
    pub nonce: Option<String>,
}

/// Run the strategy list over `markup`. A missing token is fatal; there is
/// no safe substitute for it.
pub fn extract(markup: &str) -> Result<Extracted> {
    let (token_strategy, token) = ExtractionStrategy::ALL
        .iter()
        .find_map(|s| s.token(markup).map(|t| (*s, t)))
        .ok_or_else(|| {
            Error::ParameterExtractionFailed(format!(
                "no session token in {} bytes of markup",
                markup.len()
            ))
        })?;
    let nonce = ExtractionStrategy::ALL.iter().find_map(|s| s.nonce(markup));
    log::debug!("Session token found via {token_strategy:?}");
    Ok(Extracted {
        token,
        token_strategy,
        nonce,
    })
}
