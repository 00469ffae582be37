//! Equality matching rules used for attribute value lookups.
//!
//! Three levels are available: exact byte comparison ([`OctetStringMatch`]),
//! case-insensitive string comparison ([`CaseIgnoreStringMatch`]) and any
//! caller-supplied comparator. Closures of type `Fn(&[u8], &[u8]) -> bool`
//! implement [`MatchingRule`] directly.

pub trait MatchingRule: Send + Sync {
    fn values_match(&self, a: &[u8], b: &[u8]) -> bool;
}

impl<F> MatchingRule for F
where
    F: Fn(&[u8], &[u8]) -> bool + Send + Sync,
{
    fn values_match(&self, a: &[u8], b: &[u8]) -> bool {
        self(a, b)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OctetStringMatch;

impl MatchingRule for OctetStringMatch {
    fn values_match(&self, a: &[u8], b: &[u8]) -> bool {
        a == b
    }
}

/// caseIgnoreMatch: lowercase, trim, and collapse inner whitespace runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaseIgnoreStringMatch;

impl CaseIgnoreStringMatch {
    pub fn normalize(value: &[u8]) -> String {
        String::from_utf8_lossy(value)
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }
}

impl MatchingRule for CaseIgnoreStringMatch {
    fn values_match(&self, a: &[u8], b: &[u8]) -> bool {
        a == b || Self::normalize(a) == Self::normalize(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_octet_string_match() {
        assert!(OctetStringMatch.values_match(b"abc", b"abc"));
        assert!(!OctetStringMatch.values_match(b"abc", b"ABC"));
    }

    #[test]
    fn test_case_ignore_match() {
        let rule = CaseIgnoreStringMatch;
        assert!(rule.values_match(b"John  Doe", b"john doe"));
        assert!(rule.values_match(b" ADMIN ", b"admin"));
        assert!(!rule.values_match(b"admin", b"admins"));
    }

    #[test]
    fn test_closure_rule() {
        let numeric = |a: &[u8], b: &[u8]| {
            let parse = |v: &[u8]| std::str::from_utf8(v).ok().and_then(|s| s.trim().parse::<i64>().ok());
            matches!((parse(a), parse(b)), (Some(x), Some(y)) if x == y)
        };
        assert!(numeric.values_match(b"007", b"7"));
        assert!(!numeric.values_match(b"7", b"8"));
    }
}
