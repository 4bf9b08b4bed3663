//! Default job priority derived from card labels. Lower is more urgent.

pub const PRIORITY_CRITICAL: i32 = 0;
pub const PRIORITY_HIGH: i32 = 1;
pub const PRIORITY_MEDIUM: i32 = 2;
pub const PRIORITY_LOW: i32 = 3;

pub const DEFAULT_PRIORITY: i32 = PRIORITY_MEDIUM;
pub const DEFAULT_PRIORITY_FIELD: &str = "priority";

fn level(value: &str) -> Option<i32> {
    match value.trim().to_lowercase().as_str() {
        "critical" | "urgent" | "p0" => Some(PRIORITY_CRITICAL),
        "high" | "p1" => Some(PRIORITY_HIGH),
        "medium" | "normal" | "p2" => Some(PRIORITY_MEDIUM),
        "low" | "p3" => Some(PRIORITY_LOW),
        _ => None,
    }
}

/// Value part of a `field::value`, `field:value` or `field/value` label.
fn field_value<'a>(label: &'a str, field: &str) -> Option<&'a str> {
    let label = label.trim();
    let head = label.get(..field.len())?;
    if !head.eq_ignore_ascii_case(field) {
        return None;
    }
    let rest = &label[field.len()..];
    ["::", ":", "/", "-", " "]
        .iter()
        .find_map(|sep| rest.strip_prefix(sep))
}

/// Priority for a card carrying `labels`.
///
/// Labels of the form `<field>::<level>` are consulted first, then bare
/// `p0`..`p3` labels. The most urgent level found wins; cards without any
/// priority label get [`DEFAULT_PRIORITY`].
pub fn priority_from_labels<S: AsRef<str>>(labels: &[S], field: Option<&str>) -> i32 {
    let field = field
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .unwrap_or(DEFAULT_PRIORITY_FIELD);

    let scoped = labels
        .iter()
        .filter_map(|l| field_value(l.as_ref(), field))
        .filter_map(level)
        .min();
    if let Some(p) = scoped {
        return p;
    }

    labels
        .iter()
        .map(|l| l.as_ref().trim().to_lowercase())
        .filter(|l| matches!(l.as_str(), "p0" | "p1" | "p2" | "p3"))
        .filter_map(|l| level(&l))
        .min()
        .unwrap_or(DEFAULT_PRIORITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_priority_label() {
        assert_eq!(priority_from_labels(&["bug", "priority::high"], None), PRIORITY_HIGH);
        assert_eq!(priority_from_labels(&["Priority: Critical"], None), PRIORITY_CRITICAL);
        assert_eq!(priority_from_labels(&["priority/low"], None), PRIORITY_LOW);
    }

    #[test]
    fn test_bare_p_labels() {
        assert_eq!(priority_from_labels(&["P0"], None), PRIORITY_CRITICAL);
        assert_eq!(priority_from_labels(&["p3", "docs"], None), PRIORITY_LOW);
    }

    #[test]
    fn test_custom_field() {
        let labels = ["severity::urgent", "priority::low"];
        assert_eq!(priority_from_labels(&labels, Some("severity")), PRIORITY_CRITICAL);
        assert_eq!(priority_from_labels(&labels, None), PRIORITY_LOW);
    }

    #[test]
    fn test_most_urgent_wins() {
        assert_eq!(
            priority_from_labels(&["priority::low", "priority::high"], None),
            PRIORITY_HIGH
        );
    }

    #[test]
    fn test_default_when_no_priority_label() {
        let empty: [&str; 0] = [];
        assert_eq!(priority_from_labels(&empty, None), DEFAULT_PRIORITY);
        assert_eq!(priority_from_labels(&["bug", "priority::whenever"], None), DEFAULT_PRIORITY);
        assert_eq!(priority_from_labels(&["priorityhigh"], None), DEFAULT_PRIORITY);
    }
}
