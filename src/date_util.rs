use chrono::{Datelike, Duration, IsoWeek, NaiveDate};

/// Monday of the ISO week containing `d`.
pub fn monday_of(d: NaiveDate) -> NaiveDate {
    d - Duration::days(d.weekday().num_days_from_monday() as i64)
}

/// Monday of the week `offset` weeks away from the week containing `today`.
pub fn monday_at_offset(today: NaiveDate, offset: i32) -> NaiveDate {
    monday_of(today) + Duration::weeks(offset as i64)
}

/// The ISO week labelled `week_number` nearest to the week at `offset`.
/// The portal's selector shows bare week numbers; the offset pins down
/// which year's week it is.
pub fn resolve_week(today: NaiveDate, offset: i32, week_number: u32) -> IsoWeek {
    let anchor = monday_at_offset(today, offset);
    for delta in [0i64, -1, 1, -2, 2, -3, 3] {
        let candidate = anchor + Duration::weeks(delta);
        if candidate.iso_week().week() == week_number {
            return candidate.iso_week();
        }
    }
    anchor.iso_week()
}

/// Parse the portal's `dd.mm.yyyy` dates.
pub fn parse_dotted(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%d.%m.%Y").ok()
}

/// Resolve a yearless `DD/MM` day header to the date inside
/// `[week_start, week_start + 6]`, falling back to `fallback_year`.
pub fn resolve_day_month(s: &str, week_start: Option<NaiveDate>, fallback_year: i32) -> Option<NaiveDate> {
    let (day, month) = s.trim().split_once('/')?;
    let day: u32 = day.trim().parse().ok()?;
    let month: u32 = month.trim().parse().ok()?;
    if let Some(start) = week_start {
        let end = start + Duration::days(6);
        for year in [start.year(), end.year()] {
            if let Some(d) = NaiveDate::from_ymd_opt(year, month, day) {
                if d >= start && d <= end {
                    return Some(d);
                }
            }
        }
    }
    NaiveDate::from_ymd_opt(fallback_year, month, day)
}

/// `"2425"` -> `"2024-2025"`; anything else is returned unchanged.
pub fn academic_year(code: &str) -> String {
    if code.len() == 4 && code.chars().all(|c| c.is_ascii_digit()) {
        format!("20{}-20{}", &code[..2], &code[2..])
    } else {
        code.to_string()
    }
}

/// English weekday for a Faroese day name.
pub fn english_day(faroese: &str) -> Option<&'static str> {
    match faroese {
        "Mánadagur" => Some("Monday"),
        "Týsdagur" => Some("Tuesday"),
        "Mikudagur" => Some("Wednesday"),
        "Hósdagur" => Some("Thursday"),
        "Fríggjadagur" => Some("Friday"),
        "Leygardagur" => Some("Saturday"),
        "Sunnudagur" => Some("Sunday"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_monday_of() {
        assert_eq!(monday_of(d(2025, 3, 20)), d(2025, 3, 17));
        assert_eq!(monday_of(d(2025, 3, 17)), d(2025, 3, 17));
        assert_eq!(monday_of(d(2025, 3, 23)), d(2025, 3, 17));
    }

    #[test]
    fn test_resolve_week_across_new_year() {
        // Thursday 2 Jan 2025 is ISO 2025-W01.
        let today = d(2025, 1, 2);
        let w = resolve_week(today, -1, 52);
        assert_eq!((w.year(), w.week()), (2024, 52));
        let w = resolve_week(today, 0, 1);
        assert_eq!((w.year(), w.week()), (2025, 1));
    }

    #[test]
    fn test_resolve_week_tolerates_drift() {
        // Selector says week 12 but the offset lands on week 13.
        let w = resolve_week(d(2025, 3, 24), 0, 12);
        assert_eq!((w.year(), w.week()), (2025, 12));
    }

    #[test]
    fn test_parse_dotted() {
        assert_eq!(parse_dotted("17.03.2025"), Some(d(2025, 3, 17)));
        assert_eq!(parse_dotted("2025-03-17"), None);
    }

    #[test]
    fn test_resolve_day_month_in_cross_year_week() {
        let start = d(2024, 12, 30);
        assert_eq!(resolve_day_month("30/12", Some(start), 2025), Some(d(2024, 12, 30)));
        assert_eq!(resolve_day_month("02/01", Some(start), 2024), Some(d(2025, 1, 2)));
        assert_eq!(resolve_day_month("5/5", None, 2025), Some(d(2025, 5, 5)));
        assert_eq!(resolve_day_month("nope", None, 2025), None);
    }

    #[test]
    fn test_academic_year() {
        assert_eq!(academic_year("2425"), "2024-2025");
        assert_eq!(academic_year("22y"), "22y");
    }

    #[test]
    fn test_english_day() {
        assert_eq!(english_day("Hósdagur"), Some("Thursday"));
        assert_eq!(english_day("Monday"), None);
    }
}
