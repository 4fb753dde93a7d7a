//! Identifier fallback for multi-component catalog entries.
//!
//! Some products are indexed under a base identifier while the dashboard reports
//! a component suffix, e.g. `112571916-A` is catalogued as `112571916`.

/// Base identifier with the trailing `-<component>` removed, if there is one.
#[must_use]
pub fn fallback_identifier(raw: &str) -> Option<String> {
    let (base, suffix) = raw.trim().rsplit_once('-')?;
    let base = base.trim();
    (!base.is_empty() && !suffix.trim().is_empty()).then(|| base.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("112571916-A", Some("112571916"))]
    #[case("112571916-B2", Some("112571916"))]
    #[case("100-200-C", Some("100-200"))]
    #[case(" 42-X ", Some("42"))]
    #[case("112571916", None)]
    #[case("-A", None)]
    #[case("112571916-", None)]
    fn test_fallback_identifier(#[case] raw: &str, #[case] expected: Option<&str>) {
        assert_eq!(fallback_identifier(raw).as_deref(), expected);
    }
}
