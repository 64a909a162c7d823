//! Common utility functions
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Seconds since 1970.
#[must_use]
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|x| x.as_secs())
        .unwrap_or(0)
}

/// Check if a string contains only hex characters.
#[must_use]
pub fn is_hex(s: &str) -> bool {
    s.chars().all(|x| char::is_ascii_hexdigit(&x))
}

/// Check if a string contains only lower-case hex chars.
#[must_use]
pub fn is_lower_hex(s: &str) -> bool {
    s.chars()
        .all(|x| char::is_ascii_hexdigit(&x) && (char::is_numeric(x) || char::is_lowercase(x)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lower_hex() {
        let hexstr = "abcd0123";
        assert!(is_lower_hex(hexstr));
    }

    #[test]
    fn mixed_hex() {
        assert!(is_hex("ABCD0123ef"));
        assert!(!is_lower_hex("ABCD0123ef"));
    }

    #[test]
    fn non_hex() {
        assert!(!is_hex("abcdefgh"));
    }
}
