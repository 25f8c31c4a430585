use std::fmt;

use crate::error::{Error, Result};
use crate::model::WeekControl;
use crate::parse::HtmlParser;
use crate::portal::requests::FormRequest;

use super::retry::{BatchScope, RetryReauthPolicy};

/// Which weeks a run targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeekSelection {
    /// Only the current week.
    Current,
    /// `backward` weeks back through `forward` weeks ahead, including the current one.
    Range { backward: u32, forward: u32 },
    /// Every week the selector offers.
    All,
    /// The current week and every later one the selector offers.
    Forward,
}

impl WeekSelection {
    pub fn needs_range(&self) -> bool {
        matches!(self, WeekSelection::All | WeekSelection::Forward)
    }

    /// Offsets to sync, nearest to the current week first.
    pub fn offsets(&self, controls: &[WeekControl]) -> Result<Vec<i32>> {
        let mut offsets: Vec<i32> = match self {
            WeekSelection::Current => vec![0],
            WeekSelection::Range { backward, forward } => {
                let span = |weeks: u32| {
                    i32::try_from(weeks)
                        .map_err(|_| Error::Config(format!("week range {weeks} is too large")))
                };
                (-span(*backward)?..=span(*forward)?).collect()
            }
            WeekSelection::All => {
                let (min, max) = range_of(controls)?;
                (min..=max).collect()
            }
            WeekSelection::Forward => {
                let (min, max) = range_of(controls)?;
                (min.max(0)..=max).collect()
            }
        };
        offsets.sort_by_key(|o| (o.abs(), *o));
        offsets.dedup();
        Ok(offsets)
    }
}

impl fmt::Display for WeekSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeekSelection::Current => write!(f, "current"),
            WeekSelection::Range { backward, forward } => write!(f, "range:-{backward}..+{forward}"),
            WeekSelection::All => write!(f, "all"),
            WeekSelection::Forward => write!(f, "forward"),
        }
    }
}

/// `(min, max)` over the controls' offsets.
pub fn range_of(controls: &[WeekControl]) -> Result<(i32, i32)> {
    let min = controls.iter().map(|c| c.offset).min();
    let max = controls.iter().map(|c| c.offset).max();
    match (min, max) {
        (Some(min), Some(max)) => Ok((min, max)),
        _ => Err(Error::NoOffsetsFound),
    }
}

/// Reads the week selector from the current week's view. Read-only: it
/// never navigates.
pub struct WeekRangeDiscovery<'a> {
    policy: &'a RetryReauthPolicy,
    parser: &'a dyn HtmlParser,
    student_id: &'a str,
}

impl<'a> WeekRangeDiscovery<'a> {
    pub fn new(policy: &'a RetryReauthPolicy, parser: &'a dyn HtmlParser, student_id: &'a str) -> Self {
        Self {
            policy,
            parser,
            student_id,
        }
    }

    /// All navigation controls; may be empty.
    pub async fn discover(&self) -> Result<Vec<WeekControl>> {
        let scope = BatchScope::new();
        let markup = self
            .policy
            .fetch(&scope, &FormRequest::week_selector(self.student_id))
            .await?;
        let controls = self.parser.parse_week_controls(&markup)?;
        log::info!("Week selector offers {} weeks", controls.len());
        Ok(controls)
    }

    pub async fn discover_range(&self) -> Result<(i32, i32)> {
        range_of(&self.discover().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(offset: i32) -> WeekControl {
        WeekControl {
            offset,
            slot_key: format!("K{offset}"),
            week_number: 10,
            is_current: offset == 0,
        }
    }

    #[test]
    fn test_range_of() {
        let controls = vec![control(3), control(-7), control(0)];
        assert_eq!(range_of(&controls).unwrap(), (-7, 3));
        assert!(matches!(range_of(&[]), Err(Error::NoOffsetsFound)));
    }

    #[test]
    fn test_offsets_nearest_first() {
        let sel = WeekSelection::Range {
            backward: 2,
            forward: 1,
        };
        assert_eq!(sel.offsets(&[]).unwrap(), vec![0, -1, 1, -2]);
        assert_eq!(WeekSelection::Current.offsets(&[]).unwrap(), vec![0]);
    }

    #[test]
    fn test_oversized_range_is_config_error() {
        let sel = WeekSelection::Range {
            backward: u32::MAX,
            forward: 0,
        };
        assert!(matches!(sel.offsets(&[]), Err(Error::Config(_))));
        let sel = WeekSelection::Range {
            backward: 0,
            forward: i32::MAX as u32 + 1,
        };
        assert!(matches!(sel.offsets(&[]), Err(Error::Config(_))));
    }

    #[test]
    fn test_all_and_forward_need_controls() {
        let controls = vec![control(-2), control(0), control(2)];
        assert_eq!(
            WeekSelection::All.offsets(&controls).unwrap(),
            vec![0, -1, 1, -2, 2]
        );
        assert_eq!(
            WeekSelection::Forward.offsets(&controls).unwrap(),
            vec![0, 1, 2]
        );
        assert!(matches!(
            WeekSelection::All.offsets(&[]),
            Err(Error::NoOffsetsFound)
        ));
        assert!(WeekSelection::Forward.needs_range());
        assert!(!WeekSelection::Current.needs_range());
    }
}
