use crate::model::*;

use super::store::DayBook;
use super::EngineError;

/// Half-open overlap: back-to-back spans do not collide.
pub fn overlaps(a: &Span, b: &Span) -> bool {
    a.start < b.end && b.start < a.end
}

/// Reject `candidate` if it overlaps any span in `existing`.
pub fn validate_no_overlap(candidate: &Span, existing: &[Span]) -> Result<(), EngineError> {
    match existing.iter().find(|s| overlaps(candidate, s)) {
        Some(hit) => Err(EngineError::Overlap { conflicting: *hit }),
        None => Ok(()),
    }
}

/// Reject a set of spans in which any two overlap. Reports the earlier span
/// of the first colliding pair.
pub fn validate_disjoint(spans: &[Span]) -> Result<(), EngineError> {
    let mut sorted = spans.to_vec();
    sorted.sort_by_key(|s| (s.start, s.end));
    for pair in sorted.windows(2) {
        if overlaps(&pair[0], &pair[1]) {
            return Err(EngineError::Overlap { conflicting: pair[0] });
        }
    }
    Ok(())
}

/// Fail if an occupying reservation on `book` overlaps `span`. `skip` excludes
/// one reservation from the check (used when re-confirming it).
pub(crate) fn check_no_conflict(
    book: &DayBook,
    span: &Span,
    pending_occupies: bool,
    skip: Option<ulid::Ulid>,
) -> Result<(), EngineError> {
    for r in book.overlapping(span) {
        if Some(r.id) == skip || !r.status.occupies_slot(pending_occupies) {
            continue;
        }
        return Err(EngineError::SlotUnavailable {
            conflicting: Some(r.id),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(s: &str, e: &str) -> Span {
        Span::parse(s, e).unwrap()
    }

    #[test]
    fn overlap_is_half_open() {
        assert!(overlaps(&span("09:00", "10:00"), &span("09:59", "10:30")));
        assert!(!overlaps(&span("09:00", "10:00"), &span("10:00", "10:30")));
        assert!(!overlaps(&span("10:00", "10:30"), &span("09:00", "10:00")));
        assert!(overlaps(&span("09:00", "12:00"), &span("10:00", "10:20")));
    }

    #[test]
    fn validate_no_overlap_reports_hit() {
        let existing = vec![span("08:00", "09:00"), span("09:30", "10:00")];
        assert!(validate_no_overlap(&span("09:00", "09:30"), &existing).is_ok());
        match validate_no_overlap(&span("09:20", "09:40"), &existing) {
            Err(EngineError::Overlap { conflicting }) => {
                assert_eq!(conflicting, span("09:30", "10:00"))
            }
            other => panic!("expected Overlap, got {other:?}"),
        }
    }

    #[test]
    fn validate_disjoint_unsorted_input() {
        assert!(validate_disjoint(&[span("13:00", "14:00"), span("09:00", "10:00")]).is_ok());
        assert!(validate_disjoint(&[]).is_ok());
        match validate_disjoint(&[span("13:00", "14:00"), span("12:30", "13:30")]) {
            Err(EngineError::Overlap { conflicting }) => {
                assert_eq!(conflicting, span("12:30", "13:30"))
            }
            other => panic!("expected Overlap, got {other:?}"),
        }
    }
}
