pub mod glasir;

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use scraper::Html;

use crate::error::Result;
use crate::model::{WeekControl, WeekPage};

pub use glasir::GlasirParser;

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static HOMEWORK_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Heimaarbeiði\s*:?\s*").unwrap());

/// Turns portal markup into structured records. Implementations own every
/// selector and markup quirk; the sync engine only sees the results.
pub trait HtmlParser: Send + Sync {
    /// Every navigation control in the week selector.
    fn parse_week_controls(&self, markup: &str) -> Result<Vec<WeekControl>>;

    fn parse_week(&self, markup: &str) -> Result<WeekPage>;

    /// Plain homework text from a note response, `None` when the note is empty.
    fn parse_homework(&self, body: &str) -> Option<String>;

    fn parse_student_id(&self, markup: &str) -> Option<String>;

    /// Teacher initials to full name.
    fn parse_teacher_map(&self, markup: &str) -> HashMap<String, String>;
}

/// Reduce a homework fragment to plain text: tags and entities resolved,
/// whitespace collapsed, the `Heimaarbeiði` label dropped.
pub fn clean_homework(body: &str) -> Option<String> {
    let fragment = Html::parse_fragment(body);
    let text: Vec<&str> = fragment.root_element().text().collect();
    let text = text.join(" ");
    let text = WHITESPACE.replace_all(text.trim(), " ");
    let text = HOMEWORK_LABEL.replace(&text, "");
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}
