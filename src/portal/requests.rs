use rand::Rng;

use crate::session::SessionParameters;

pub const TIMETABLE_PAGE: &str = "/132n/";
pub const WEEK_ENDPOINT: &str = "/i/udvalg.asp";
pub const HOMEWORK_ENDPOINT: &str = "/i/note.asp";
pub const TEACHERS_ENDPOINT: &str = "/i/teachers.asp";

/// A form POST against one of the portal's fragment endpoints. Session
/// fields are appended at send time so a retried request after reauth
/// carries the fresh token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormRequest {
    pub endpoint: &'static str,
    params: Vec<(String, String)>,
}

impl FormRequest {
    fn new(endpoint: &'static str) -> Self {
        Self {
            endpoint,
            params: Vec::new(),
        }
    }

    fn param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.push((key.to_string(), value.into()));
        self
    }

    /// The timetable for the week at `offset` relative to the current week.
    pub fn week(student_id: &str, offset: i32) -> Self {
        Self::new(WEEK_ENDPOINT)
            .param("MyInsertAreaId", "MyWindowMain")
            .param("q", "stude")
            .param("id", student_id)
            .param("v", offset.to_string())
    }

    /// The current week's view, which carries the week selector.
    pub fn week_selector(student_id: &str) -> Self {
        Self::week(student_id, 0)
    }

    /// The homework note attached to one lesson.
    pub fn homework(lesson_id: &str) -> Self {
        Self::new(HOMEWORK_ENDPOINT)
            .param("MyInsertAreaId", "GlasirAPI")
            .param("q", lesson_id)
            .param("MyFunktion", "ReadNotesToLessonWithLessonRID")
    }

    /// The teacher directory (full names by initials).
    pub fn teachers() -> Self {
        Self::new(TEACHERS_ENDPOINT)
            .param("MyInsertAreaId", "MyWindowMain")
            .param("q", "teach")
            .param("v", "0")
            .param("id", "a")
    }

    /// Final form fields with the session token and nonce filled in.
    pub fn form(&self, session: &SessionParameters) -> Vec<(String, String)> {
        let rnd: f64 = rand::thread_rng().gen();
        let mut form = vec![
            ("fname".to_string(), "Henry".to_string()),
            ("timex".to_string(), session.request_nonce.clone()),
            ("rnd".to_string(), rnd.to_string()),
            ("lname".to_string(), session.session_token.clone()),
        ];
        form.extend(self.params.iter().cloned());
        form
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(form: &'a [(String, String)], key: &str) -> Option<&'a str> {
        form.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_week_form() {
        let session = SessionParameters::new("Ford62860,32", "1712345678901", 1);
        let form = FormRequest::week("ABC-123", -2).form(&session);
        assert_eq!(lookup(&form, "lname"), Some("Ford62860,32"));
        assert_eq!(lookup(&form, "timex"), Some("1712345678901"));
        assert_eq!(lookup(&form, "q"), Some("stude"));
        assert_eq!(lookup(&form, "id"), Some("ABC-123"));
        assert_eq!(lookup(&form, "v"), Some("-2"));
        assert_eq!(lookup(&form, "fname"), Some("Henry"));
        assert!(lookup(&form, "rnd").is_some());
    }

    #[test]
    fn test_homework_form() {
        let session = SessionParameters::new("29", "1", 1);
        let req = FormRequest::homework("E5A1-77");
        assert_eq!(req.endpoint, HOMEWORK_ENDPOINT);
        let form = req.form(&session);
        assert_eq!(lookup(&form, "q"), Some("E5A1-77"));
        assert_eq!(
            lookup(&form, "MyFunktion"),
            Some("ReadNotesToLessonWithLessonRID")
        );
    }
}
