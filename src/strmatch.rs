//! Glob matching tuned for scans over sorted key ranges
//!
//! `glob_compare` reports where a key stands relative to the set of keys a
//! pattern can match, so a caller walking keys in sorted order can stop as
//! soon as the scan runs past the matching range.

use std::cmp::Ordering;

/// Match `key` against a glob `pattern` (`*` any run, `?` any single byte)
pub fn glob_match(pattern: &[u8], key: &[u8]) -> bool {
    let mut p = 0;
    let mut k = 0;
    // Backtrack targets for the most recent '*'
    let mut star_p: Option<usize> = None;
    let mut star_k = 0;

    while k < key.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == key[k]) {
            p += 1;
            k += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star_p = Some(p);
            star_k = k;
            p += 1;
        } else if let Some(sp) = star_p {
            // Let the last '*' swallow one more byte and retry
            p = sp + 1;
            star_k += 1;
            k = star_k;
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&b| b == b'*')
}

/// Compare a key against the sorted range a pattern can match.
///
/// Returns `Equal` when the key matches, `Less` when the key sorts before
/// the end of the matching range (keep scanning), `Greater` once the key
/// has sorted past every possible match (stop scanning).
pub fn glob_compare(pattern: &[u8], key: &[u8]) -> Ordering {
    let lit_len = pattern
        .iter()
        .position(|&b| b == b'*' || b == b'?')
        .unwrap_or(pattern.len());
    let lit = &pattern[..lit_len];

    let shared = lit.len().min(key.len());
    match key[..shared].cmp(&lit[..shared]) {
        Ordering::Less => return Ordering::Less,
        Ordering::Greater => return Ordering::Greater,
        Ordering::Equal => {}
    }

    if key.len() < lit.len() {
        // Proper prefix of the literal part sorts before any match
        return Ordering::Less;
    }

    if lit_len == pattern.len() {
        // Pure literal pattern: only the exact key matches, and any key
        // extending the literal sorts after it
        return if key.len() == lit.len() {
            Ordering::Equal
        } else {
            Ordering::Greater
        };
    }

    if glob_match(pattern, key) {
        Ordering::Equal
    } else {
        Ordering::Less
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_match() {
        assert!(glob_match(b"alpha", b"alpha"));
        assert!(!glob_match(b"alpha", b"alphabet"));
        assert!(!glob_match(b"alpha", b"alph"));
    }

    #[test]
    fn test_star() {
        assert!(glob_match(b"*", b""));
        assert!(glob_match(b"*", b"anything"));
        assert!(glob_match(b"a*", b"a"));
        assert!(glob_match(b"a*c", b"abc"));
        assert!(glob_match(b"a*c", b"abbbc"));
        assert!(!glob_match(b"a*c", b"abd"));
        assert!(glob_match(b"a**", b"a"));
    }

    #[test]
    fn test_question() {
        assert!(glob_match(b"a?c", b"abc"));
        assert!(!glob_match(b"a?c", b"ac"));
        assert!(!glob_match(b"a?", b"a"));
    }

    #[test]
    fn test_compare_ordering() {
        assert_eq!(glob_compare(b"b*", b"aardvark"), Ordering::Less);
        assert_eq!(glob_compare(b"b*", b"banana"), Ordering::Equal);
        assert_eq!(glob_compare(b"b*", b"cat"), Ordering::Greater);
    }

    #[test]
    fn test_compare_literal() {
        assert_eq!(glob_compare(b"banana", b"banana"), Ordering::Equal);
        assert_eq!(glob_compare(b"banana", b"ban"), Ordering::Less);
        assert_eq!(glob_compare(b"banana", b"bananas"), Ordering::Greater);
    }

    #[test]
    fn test_compare_within_prefix_range() {
        // Same literal prefix but no glob match: keep scanning
        assert_eq!(glob_compare(b"doc-*-v2", b"doc-17-v1"), Ordering::Less);
        assert_eq!(glob_compare(b"doc-*-v2", b"doc-17-v2"), Ordering::Equal);
    }
}
