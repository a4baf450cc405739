//! "Natural" ordering for directory listings: directories first, then names
//! compared case-insensitively with embedded numbers compared by value, so
//! `file2` sorts before `file10`.

use std::cmp::Ordering;

use crate::entry::EntryDescriptor;

/// Listing order for two entries of the same directory.
pub fn compare_entries(a: &EntryDescriptor, b: &EntryDescriptor) -> Ordering {
    // `true` must come first, so compare the flags reversed.
    b.is_directory
        .cmp(&a.is_directory)
        .then_with(|| natural_compare(&a.name, &b.name))
}

/// Case-insensitive natural comparison of two names.
///
/// Names are split into alternating runs of ASCII digits and non-digits and
/// the run sequences are compared lexicographically. Ties (e.g. `a01` vs
/// `a1`) fall back to the lowercased names, then to the raw names, so only
/// identical names compare equal.
pub fn natural_compare(a: &str, b: &str) -> Ordering {
    let a_lower = a.to_lowercase();
    let b_lower = b.to_lowercase();

    let a_runs = partition_by_digitness(&a_lower);
    let b_runs = partition_by_digitness(&b_lower);

    a_runs
        .iter()
        .zip(b_runs.iter())
        .map(|(x, y)| compare_runs(x, y))
        .find(|ordering| ordering.is_ne())
        .unwrap_or_else(|| a_runs.len().cmp(&b_runs.len()))
        .then_with(|| a_lower.cmp(&b_lower))
        .then_with(|| a.cmp(b))
}

/// Splits `s` into maximal runs of digits and non-digits, in order.
/// `"file12b"` becomes `["file", "12", "b"]`; an empty string has no runs.
fn partition_by_digitness(s: &str) -> Vec<&str> {
    let mut runs = Vec::new();
    let mut start = 0;
    let mut last_was_digit = None;

    for (i, c) in s.char_indices() {
        let is_digit = c.is_ascii_digit();
        if last_was_digit.is_some_and(|last| last != is_digit) {
            runs.push(&s[start..i]);
            start = i;
        }
        last_was_digit = Some(is_digit);
    }
    if start < s.len() {
        runs.push(&s[start..]);
    }

    runs
}

fn is_digit_run(run: &str) -> bool {
    run.bytes().next().is_some_and(|b| b.is_ascii_digit())
}

fn compare_runs(a: &str, b: &str) -> Ordering {
    if !(is_digit_run(a) && is_digit_run(b)) {
        return a.cmp(b);
    }

    // Digit runs that don't fit in a u64 are compared as text against each
    // other rather than pulling in arbitrary precision. They are always larger
    // than any run that does fit, which keeps the order transitive.
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}
