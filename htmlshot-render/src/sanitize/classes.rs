//! Utility-class attribute merging.

/// Attribute names treated as class lists. Matched case-insensitively.
const CLASS_ATTRIBUTES: &[&str] = &["class", "classname", "tw"];

pub fn is_class_attribute(name: &str) -> bool {
    CLASS_ATTRIBUTES
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(name))
}

/// Merge every class-like attribute value into one space-separated list,
/// deduplicated, first occurrence wins.
pub fn merge_class_lists<'a, I>(values: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen: Vec<&str> = Vec::new();
    for value in values {
        for class in value.split_whitespace() {
            if !seen.contains(&class) {
                seen.push(class);
            }
        }
    }
    if seen.is_empty() {
        None
    } else {
        Some(seen.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_attribute_names() {
        for name in ["class", "className", "classname", "CLASS", "tw", "TW"] {
            assert!(is_class_attribute(name), "{}", name);
        }
        assert!(!is_class_attribute("style"));
    }

    #[test]
    fn test_merge_preserves_first_seen_order() {
        let merged = merge_class_lists(["flex p-4", "  p-4 text-xl ", "flex bg-white"]);
        assert_eq!(merged.as_deref(), Some("flex p-4 text-xl bg-white"));
        assert_eq!(merge_class_lists(["   "]), None);
    }
}
