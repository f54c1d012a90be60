//! Shared `/`-segment wildcard matcher used by the change bus (§4.4) and
//! the ACL engine (§4.6): `*` matches exactly one additional segment,
//! `**` matches any suffix including empty.

/// Returns true if `pattern` matches `key`, applying Konsul's wildcard rules.
pub fn matches(pattern: &str, key: &str) -> bool {
    let pat_segs: Vec<&str> = split_segments(pattern);
    let key_segs: Vec<&str> = split_segments(key);
    matches_segments(&pat_segs, &key_segs)
}

fn split_segments(s: &str) -> Vec<&str> {
    if s.is_empty() {
        Vec::new()
    } else {
        s.split('/').collect()
    }
}

fn matches_segments(pat: &[&str], key: &[&str]) -> bool {
    match pat.first() {
        None => key.is_empty(),
        Some(&"**") => true,
        Some(&"*") => {
            !key.is_empty() && matches_segments(&pat[1..], &key[1..])
        }
        Some(seg) => {
            !key.is_empty() && *seg == key[0] && matches_segments(&pat[1..], &key[1..])
        }
    }
}

/// Length of the longest literal (non-wildcard) prefix shared between the
/// pattern and a matching key — used by the ACL engine to rank rules within
/// a policy (longest-prefix-match wins).
pub fn specificity(pattern: &str) -> usize {
    split_segments(pattern)
        .iter()
        .take_while(|s| **s != "*" && **s != "**")
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_literal_match() {
        assert!(matches("app/a", "app/a"));
        assert!(!matches("app/a", "app/b"));
    }

    #[test]
    fn single_star_matches_one_segment() {
        assert!(matches("app/*", "app/a"));
        assert!(matches("app/*", "app/b"));
        assert!(!matches("app/*", "app/x/y"));
        assert!(!matches("app/*", "other/a"));
    }

    #[test]
    fn double_star_matches_any_suffix_including_empty() {
        assert!(matches("app/**", "app"));
        assert!(matches("app/**", "app/a"));
        assert!(matches("app/**", "app/x/y"));
        assert!(matches("**", "anything/at/all"));
        assert!(matches("**", ""));
    }

    #[test]
    fn scenario_four_wildcard_match() {
        let pattern = "app/*";
        assert!(matches(pattern, "app/a"));
        assert!(matches(pattern, "app/b"));
        assert!(!matches(pattern, "app/x/y"));
        assert!(!matches(pattern, "other/a"));
    }

    #[test]
    fn specificity_ranks_literal_prefix_length() {
        assert!(specificity("app/secret/**") > specificity("app/**"));
        assert_eq!(specificity("**"), 0);
        assert_eq!(specificity("app/config"), 2);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn segment() -> impl Strategy<Value = String> {
        "[a-z]{1,4}"
    }

    fn path(max_len: usize) -> impl Strategy<Value = String> {
        proptest::collection::vec(segment(), 1..=max_len).prop_map(|segs| segs.join("/"))
    }

    proptest! {
        /// A pattern with no wildcard segments matches only its own literal key.
        #[test]
        fn literal_pattern_matches_only_itself(p in path(4), q in path(4)) {
            prop_assert_eq!(matches(&p, &q), p == q);
        }

        /// `<prefix>/**` matches any key sharing that literal prefix, and no key
        /// that diverges from it.
        #[test]
        fn double_star_matches_exactly_the_shared_prefix(prefix in path(3), suffix in path(3)) {
            let pattern = format!("{prefix}/**");
            let key = format!("{prefix}/{suffix}");
            prop_assert!(matches(&pattern, &key));
            prop_assert!(matches(&pattern, &prefix));
        }

        /// `**` alone matches any key, including the empty one.
        #[test]
        fn bare_double_star_matches_anything(key in path(5)) {
            prop_assert!(matches("**", &key));
        }

        /// Specificity is monotone in the literal-segment prefix length.
        #[test]
        fn specificity_never_exceeds_segment_count(p in path(5)) {
            let segs = p.split('/').count();
            prop_assert!(specificity(&p) <= segs);
        }
    }
}
