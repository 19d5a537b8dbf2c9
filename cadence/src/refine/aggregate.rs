//! Ordering of review findings before they reach the refine producer.

use std::cmp::Ordering;

use crate::core::types::{FindingDraft, FocusArea};

/// Category order when validation fails: fix correctness before coverage.
const PROMOTED: [FocusArea; 6] = [
    FocusArea::Quality,
    FocusArea::EdgeCases,
    FocusArea::Gaps,
    FocusArea::Integration,
    FocusArea::Security,
    FocusArea::Performance,
];

/// Position of `category` in the priority order; unknown categories last.
pub fn category_priority(category: &str, previous_validation_failed: bool) -> usize {
    let order: &[FocusArea] = if previous_validation_failed {
        &PROMOTED
    } else {
        &FocusArea::ALL
    };
    FocusArea::parse(category)
        .and_then(|area| order.iter().position(|candidate| *candidate == area))
        .unwrap_or(order.len())
}

/// Union of all producers' findings in rank order: severity (HIGH first),
/// category priority, file path, line, then description. Missing locations
/// sort after present ones.
pub fn aggregate(
    mut findings: Vec<FindingDraft>,
    previous_validation_failed: bool,
) -> Vec<FindingDraft> {
    findings.sort_by(|a, b| compare(a, b, previous_validation_failed));
    findings
}

fn compare(a: &FindingDraft, b: &FindingDraft, promoted: bool) -> Ordering {
    a.severity
        .cmp(&b.severity)
        .then_with(|| {
            category_priority(&a.category, promoted).cmp(&category_priority(&b.category, promoted))
        })
        .then_with(|| none_last(a.file_path.as_ref(), b.file_path.as_ref()))
        .then_with(|| none_last(a.line_number.as_ref(), b.line_number.as_ref()))
        .then_with(|| a.description.cmp(&b.description))
        .then_with(|| a.focus_area.cmp(&b.focus_area))
}

fn none_last<T: Ord>(a: Option<T>, b: Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
