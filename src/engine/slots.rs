use crate::model::*;

use super::conflict::overlaps;

/// Tile the available intervals of one weekday into `lesson_minutes` slots.
///
/// Each interval is walked from its start; a trailing remainder shorter than
/// one lesson is dropped. A slot is `Unavailable` iff it intersects one of the
/// `occupied` spans. Output is sorted by start. Closed intervals produce
/// nothing.
pub fn generate_slots(hours: &[HoursInterval], occupied: &[Span], lesson_minutes: Min) -> Vec<TimeSlot> {
    if lesson_minutes == 0 {
        return Vec::new();
    }
    let label = format!("{lesson_minutes}min");
    let mut slots = Vec::new();

    for iv in hours.iter().filter(|iv| iv.available) {
        let mut start = iv.span.start;
        while start + lesson_minutes <= iv.span.end {
            let span = Span::new(start, start + lesson_minutes);
            let status = if occupied.iter().any(|o| overlaps(o, &span)) {
                SlotStatus::Unavailable
            } else {
                SlotStatus::Available
            };
            slots.push(TimeSlot {
                span,
                status,
                duration_label: Some(label.clone()),
            });
            start += lesson_minutes;
        }
    }

    slots.sort_by_key(|s| s.span.start);
    slots
}

/// Coarse part of the day a slot starts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DayPeriod {
    Morning,
    Afternoon,
    Evening,
}

impl DayPeriod {
    const NOON: Min = 12 * 60;
    const SIX_PM: Min = 18 * 60;

    pub fn of(start: Min) -> Self {
        if start < Self::NOON {
            DayPeriod::Morning
        } else if start < Self::SIX_PM {
            DayPeriod::Afternoon
        } else {
            DayPeriod::Evening
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DayPeriod::Morning => "morning",
            DayPeriod::Afternoon => "afternoon",
            DayPeriod::Evening => "evening",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeriodGroups {
    pub morning: Vec<TimeSlot>,
    pub afternoon: Vec<TimeSlot>,
    pub evening: Vec<TimeSlot>,
}

impl PeriodGroups {
    pub fn get(&self, period: DayPeriod) -> &[TimeSlot] {
        match period {
            DayPeriod::Morning => &self.morning,
            DayPeriod::Afternoon => &self.afternoon,
            DayPeriod::Evening => &self.evening,
        }
    }
}

pub fn group_by_period(slots: &[TimeSlot]) -> PeriodGroups {
    let mut groups = PeriodGroups::default();
    for slot in slots {
        let bucket = match DayPeriod::of(slot.span.start) {
            DayPeriod::Morning => &mut groups.morning,
            DayPeriod::Afternoon => &mut groups.afternoon,
            DayPeriod::Evening => &mut groups.evening,
        };
        bucket.push(slot.clone());
    }
    groups
}
