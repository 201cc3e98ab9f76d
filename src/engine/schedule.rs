use crate::limits::MAX_INTERVALS_PER_DAY;
use crate::model::*;

use super::conflict::validate_disjoint;
use super::EngineError;

/// Parse `HH:MM` endpoints into a validated span.
pub fn parse_time_range(start: &str, end: &str) -> Result<Span, EngineError> {
    let (Some(s), Some(e)) = (parse_hhmm(start), parse_hhmm(end)) else {
        return Err(EngineError::InvalidTimeRange(format!(
            "expected HH:MM, got {start:?} - {end:?}"
        )));
    };
    Span::try_new(s, e)
        .ok_or_else(|| EngineError::InvalidTimeRange(format!("{start} is not before {end}")))
}

pub fn parse_interval(start: &str, end: &str, available: bool) -> Result<HoursInterval, EngineError> {
    Ok(HoursInterval {
        span: parse_time_range(start, end)?,
        available,
    })
}

/// A coach's recurring weekly availability: one interval list per weekday,
/// each sorted by start and free of overlaps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WeeklySchedule {
    days: [Vec<HoursInterval>; 7],
}

impl WeeklySchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check one day's intervals and return them sorted by start.
    pub fn validate_day(intervals: &[HoursInterval]) -> Result<Vec<HoursInterval>, EngineError> {
        if intervals.len() > MAX_INTERVALS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many intervals on one day"));
        }
        for iv in intervals {
            // Deserialized spans bypass the constructor.
            if iv.span.start >= iv.span.end || iv.span.end >= 24 * 60 {
                return Err(EngineError::InvalidTimeRange(format!(
                    "{}-{} is not a valid interval",
                    format_hhmm(iv.span.start),
                    format_hhmm(iv.span.end)
                )));
            }
        }
        let mut sorted = intervals.to_vec();
        sorted.sort_by_key(|iv| iv.span.start);
        let spans: Vec<Span> = sorted.iter().map(|iv| iv.span).collect();
        validate_disjoint(&spans)?;
        Ok(sorted)
    }

    /// Replace the intervals of `day`. Nothing changes on error.
    pub fn set_day(&mut self, day: DayOfWeek, intervals: &[HoursInterval]) -> Result<(), EngineError> {
        let sorted = Self::validate_day(intervals)?;
        self.days[day.index()] = sorted;
        Ok(())
    }

    /// Replace all seven days at once. `week[d]` is day `d` (Sunday = 0).
    pub fn replace_week(&mut self, week: &[Vec<HoursInterval>]) -> Result<(), EngineError> {
        let validated = Self::validate_week(week)?;
        self.days = validated;
        Ok(())
    }

    pub fn validate_week(week: &[Vec<HoursInterval>]) -> Result<[Vec<HoursInterval>; 7], EngineError> {
        if week.len() != 7 {
            return Err(EngineError::InvalidTimeRange(format!(
                "a week has 7 days, got {}",
                week.len()
            )));
        }
        let mut days: [Vec<HoursInterval>; 7] = Default::default();
        for (slot, intervals) in days.iter_mut().zip(week) {
            *slot = Self::validate_day(intervals)?;
        }
        Ok(days)
    }

    /// Intervals of `day`, ascending by start.
    pub fn get_day(&self, day: DayOfWeek) -> &[HoursInterval] {
        &self.days[day.index()]
    }

    pub fn clear_day(&mut self, day: DayOfWeek) {
        self.days[day.index()].clear();
    }

    pub fn clear_all(&mut self) {
        for d in &mut self.days {
            d.clear();
        }
    }

    /// True if `span` fits inside one available interval of `day`.
    pub fn covers(&self, day: DayOfWeek, span: &Span) -> bool {
        self.get_day(day)
            .iter()
            .any(|iv| iv.available && iv.span.contains_span(span))
    }

    pub fn is_empty(&self) -> bool {
        self.days.iter().all(Vec::is_empty)
    }

    pub fn to_week(&self) -> Vec<Vec<HoursInterval>> {
        self.days.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iv(start: &str, end: &str) -> HoursInterval {
        parse_interval(start, end, true).unwrap()
    }

    #[test]
    fn set_day_sorts_intervals() {
        let mut w = WeeklySchedule::new();
        w.set_day(DayOfWeek::MONDAY, &[iv("14:00", "16:00"), iv("09:00", "12:00")])
            .unwrap();
        let day = w.get_day(DayOfWeek::MONDAY);
        assert_eq!(day.len(), 2);
        assert_eq!(day[0].span, Span::parse("09:00", "12:00").unwrap());
        assert_eq!(day[1].span, Span::parse("14:00", "16:00").unwrap());
    }

    #[test]
    fn set_day_overlap_rejected_and_prior_kept() {
        let mut w = WeeklySchedule::new();
        w.set_day(DayOfWeek::MONDAY, &[iv("13:00", "15:00")]).unwrap();

        let result = w.set_day(DayOfWeek::MONDAY, &[iv("09:00", "10:00"), iv("09:30", "10:30")]);
        match result {
            Err(EngineError::Overlap { conflicting }) => {
                assert_eq!(conflicting, Span::parse("09:00", "10:00").unwrap());
            }
            other => panic!("expected Overlap, got {other:?}"),
        }
        assert_eq!(w.get_day(DayOfWeek::MONDAY), &[iv("13:00", "15:00")]);
    }

    #[test]
    fn set_day_back_to_back_allowed() {
        let mut w = WeeklySchedule::new();
        w.set_day(DayOfWeek::TUESDAY, &[iv("10:00", "11:00"), iv("09:00", "10:00")])
            .unwrap();
        assert_eq!(w.get_day(DayOfWeek::TUESDAY).len(), 2);
    }

    #[test]
    fn unavailable_intervals_also_checked_for_overlap() {
        let mut w = WeeklySchedule::new();
        let closed = parse_interval("09:30", "10:00", false).unwrap();
        let result = w.set_day(DayOfWeek::FRIDAY, &[iv("09:00", "12:00"), closed]);
        assert!(matches!(result, Err(EngineError::Overlap { .. })));
    }

    #[test]
    fn malformed_times_rejected() {
        assert!(matches!(
            parse_interval("9:00", "10:00", true),
            Err(EngineError::InvalidTimeRange(_))
        ));
        assert!(matches!(
            parse_interval("10:00", "09:00", true),
            Err(EngineError::InvalidTimeRange(_))
        ));
        assert!(matches!(
            parse_interval("10:00", "10:00", true),
            Err(EngineError::InvalidTimeRange(_))
        ));
    }

    #[test]
    fn inverted_raw_span_rejected() {
        let mut w = WeeklySchedule::new();
        let bad = HoursInterval {
            span: Span { start: 600, end: 540 },
            available: true,
        };
        match w.set_day(DayOfWeek::MONDAY, &[bad]) {
            Err(EngineError::InvalidTimeRange(msg)) => assert!(msg.contains("10:00-09:00"), "{msg}"),
            other => panic!("expected InvalidTimeRange, got {other:?}"),
        }
        assert!(w.is_empty());
    }

    #[test]
    fn too_many_intervals_rejected() {
        let mut w = WeeklySchedule::new();
        let many: Vec<HoursInterval> = (0..(MAX_INTERVALS_PER_DAY as Min + 1))
            .map(|i| HoursInterval::open(Span::new(i * 10, i * 10 + 5)))
            .collect();
        assert!(matches!(
            w.set_day(DayOfWeek::MONDAY, &many),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn clear_day_and_all() {
        let mut w = WeeklySchedule::new();
        w.set_day(DayOfWeek::MONDAY, &[iv("09:00", "12:00")]).unwrap();
        w.set_day(DayOfWeek::WEDNESDAY, &[iv("09:00", "12:00")]).unwrap();
        w.clear_day(DayOfWeek::MONDAY);
        assert!(w.get_day(DayOfWeek::MONDAY).is_empty());
        assert_eq!(w.get_day(DayOfWeek::WEDNESDAY).len(), 1);
        w.clear_all();
        assert!(w.is_empty());
    }

    #[test]
    fn replace_week_is_atomic() {
        let mut w = WeeklySchedule::new();
        w.set_day(DayOfWeek::MONDAY, &[iv("09:00", "12:00")]).unwrap();

        let mut week = vec![Vec::new(); 7];
        week[2] = vec![iv("08:00", "09:00")];
        week[4] = vec![iv("08:00", "09:00"), iv("08:30", "10:00")];
        assert!(w.replace_week(&week).is_err());
        assert_eq!(w.get_day(DayOfWeek::MONDAY).len(), 1);
        assert!(w.get_day(DayOfWeek::TUESDAY).is_empty());

        week[4] = vec![iv("08:00", "09:00")];
        w.replace_week(&week).unwrap();
        assert!(w.get_day(DayOfWeek::MONDAY).is_empty());
        assert_eq!(w.get_day(DayOfWeek::TUESDAY).len(), 1);
        assert_eq!(w.get_day(DayOfWeek::THURSDAY).len(), 1);

        assert!(w.replace_week(&week[..6]).is_err());
    }

    #[test]
    fn covers_only_available_intervals() {
        let mut w = WeeklySchedule::new();
        w.set_day(
            DayOfWeek::MONDAY,
            &[iv("09:00", "12:00"), parse_interval("13:00", "14:00", false).unwrap()],
        )
        .unwrap();
        assert!(w.covers(DayOfWeek::MONDAY, &Span::parse("09:00", "09:20").unwrap()));
        assert!(w.covers(DayOfWeek::MONDAY, &Span::parse("11:40", "12:00").unwrap()));
        assert!(!w.covers(DayOfWeek::MONDAY, &Span::parse("11:50", "12:10").unwrap()));
        assert!(!w.covers(DayOfWeek::MONDAY, &Span::parse("13:00", "13:20").unwrap()));
        assert!(!w.covers(DayOfWeek::TUESDAY, &Span::parse("09:00", "09:20").unwrap()));
    }
}
