//! Fuzzy matching between configured label names and a tracker's live
//! label set.
//!
//! Trackers spell the same label many ways (`status::in-progress`,
//! `In Progress`, `in_progress`). Matching runs three passes over the
//! available labels and returns the first hit of the strictest pass:
//!
//! 1. exact, ignoring case
//! 2. ignoring case and the delimiters ` `, `-`, `_`, `.`, `/`, `:`
//! 3. scope aware: `scope::value` matches a bare `value` (either side), but
//!    two different scopes never match each other

const SCOPE_SEPARATOR: &str = "::";

fn is_delimiter(c: char) -> bool {
    matches!(c, ' ' | '-' | '_' | '.' | '/' | ':')
}

/// Lowercase with all delimiters removed.
pub fn normalize_label(label: &str) -> String {
    label
        .trim()
        .chars()
        .filter(|c| !is_delimiter(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Split `scope::value` into its parts. Labels without a scope return `None`.
pub fn split_scoped(label: &str) -> (Option<&str>, &str) {
    match label.split_once(SCOPE_SEPARATOR) {
        Some((scope, value)) if !scope.trim().is_empty() && !value.trim().is_empty() => {
            (Some(scope.trim()), value.trim())
        }
        _ => (None, label.trim()),
    }
}

fn scoped_match(target: &str, candidate: &str) -> bool {
    let (target_scope, target_value) = split_scoped(target);
    let (candidate_scope, candidate_value) = split_scoped(candidate);
    if normalize_label(target_value) != normalize_label(candidate_value) {
        return false;
    }
    match (target_scope, candidate_scope) {
        (Some(a), Some(b)) => normalize_label(a) == normalize_label(b),
        _ => true,
    }
}

/// Find the label in `available` that best matches `target`.
pub fn find_matching_label<'a, S: AsRef<str>>(target: &str, available: &'a [S]) -> Option<&'a str> {
    let target = target.trim();
    if target.is_empty() {
        return None;
    }

    let lowered = target.to_lowercase();
    if let Some(hit) = available
        .iter()
        .map(AsRef::as_ref)
        .find(|l| l.trim().to_lowercase() == lowered)
    {
        return Some(hit);
    }

    let normalized = normalize_label(target);
    if let Some(hit) = available
        .iter()
        .map(AsRef::as_ref)
        .find(|l| normalize_label(l) == normalized)
    {
        return Some(hit);
    }

    available
        .iter()
        .map(AsRef::as_ref)
        .find(|l| scoped_match(target, l))
}

/// Whether two label spellings refer to the same label.
pub fn labels_match(a: &str, b: &str) -> bool {
    find_matching_label(a, &[b]).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_target_matches_bare_remote_label() {
        let remote = vec!["bug".to_string(), "In Progress".to_string()];
        assert_eq!(
            find_matching_label("status::in-progress", &remote),
            Some("In Progress")
        );
    }

    #[test]
    fn test_exact_match_wins_over_fuzzy() {
        let remote = ["in-progress", "In Progress", "status::in-progress"];
        assert_eq!(
            find_matching_label("status::in-progress", &remote),
            Some("status::in-progress")
        );
        assert_eq!(find_matching_label("IN PROGRESS", &remote), Some("In Progress"));
    }

    #[test]
    fn test_delimiter_insensitive_match() {
        let remote = ["needs_review", "wontfix"];
        assert_eq!(find_matching_label("Needs Review", &remote), Some("needs_review"));
        assert_eq!(find_matching_label("needs.review", &remote), Some("needs_review"));
    }

    #[test]
    fn test_bare_target_matches_scoped_remote_label() {
        let remote = ["priority::high", "status::in-review"];
        assert_eq!(find_matching_label("in review", &remote), Some("status::in-review"));
    }

    #[test]
    fn test_different_scopes_do_not_match() {
        let remote = ["priority::high"];
        assert_eq!(find_matching_label("status::high", &remote), None);
    }

    #[test]
    fn test_no_match_and_empty_target() {
        let remote = ["bug", "enhancement"];
        assert_eq!(find_matching_label("status::done", &remote), None);
        assert_eq!(find_matching_label("   ", &remote), None);
        let empty: [&str; 0] = [];
        assert_eq!(find_matching_label("bug", &empty), None);
    }

    #[test]
    fn test_split_scoped() {
        assert_eq!(split_scoped("status::done"), (Some("status"), "done"));
        assert_eq!(split_scoped("done"), (None, "done"));
        assert_eq!(split_scoped("::done"), (None, "::done"));
    }

    #[test]
    fn test_labels_match() {
        assert!(labels_match("status::testing", "Testing"));
        assert!(!labels_match("status::testing", "bug"));
    }
}
