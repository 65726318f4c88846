//! Small shared helpers.

use std::collections::HashSet;

/// Deduplicates strings preserving first-seen order.
pub(crate) fn unique_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_preserving_order() {
        let items = vec![
            "192.0.2.1".to_string(),
            "192.0.2.2".to_string(),
            "192.0.2.1".to_string(),
            "2001:db8::1".to_string(),
        ];
        assert_eq!(
            unique_preserving_order(items),
            vec!["192.0.2.1", "192.0.2.2", "2001:db8::1"]
        );
    }

    #[test]
    fn test_unique_empty() {
        assert!(unique_preserving_order(Vec::new()).is_empty());
    }
}
