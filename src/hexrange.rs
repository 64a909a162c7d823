//! Utilities for searching hexadecimal prefixes with byte-ordered keys
use crate::utils::is_hex;
use hex;

/// Types of hexadecimal queries against 32-byte fields.
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum HexSearch {
    // when no range is needed, exact 32-byte value
    Exact(Vec<u8>),
    // lower (inclusive) and upper bound (exclusive) for a prefix scan
    Range(Vec<u8>, Vec<u8>),
    // lower bound only, upper bound is the end of the table
    LowerOnly(Vec<u8>),
}

/// Compute the byte bounds selected by a hex prefix of up to 64 chars.
///
/// An even-length prefix maps directly onto a byte prefix; an odd
/// final nibble widens the last byte to its sixteen completions.
#[must_use]
pub fn hex_range(s: &str) -> Option<HexSearch> {
    if !is_hex(s) || s.len() > 64 {
        return None;
    }
    // exact match
    if s.len() == 64 {
        return hex::decode(s).ok().map(HexSearch::Exact);
    }
    // an odd-length prefix keeps its trailing nibble out of the
    // byte-decoded portion and handles it by hand.
    let odd = s.len() % 2 != 0;
    let base = if odd { &s[..s.len() - 1] } else { s };
    let mut lower = hex::decode(base).ok()?;
    let mut upper = lower.clone();
    if odd {
        let nibble = u8::from_str_radix(&s[s.len() - 1..], 16).ok()?;
        lower.push(nibble << 4);
        // the next prefix after 0xf? requires a carry into the
        // preceding bytes.
        if nibble == 0xf {
            if let Some(u) = increment(&upper) {
                upper = u;
            } else {
                return Some(HexSearch::LowerOnly(lower));
            }
        } else {
            upper.push((nibble + 1) << 4);
        }
    } else {
        match increment(&upper) {
            Some(u) => upper = u,
            None => return Some(HexSearch::LowerOnly(lower)),
        }
    }
    Some(HexSearch::Range(lower, upper))
}

/// Add one to a big-endian byte string, or `None` on overflow.
fn increment(b: &[u8]) -> Option<Vec<u8>> {
    let mut out = b.to_vec();
    for i in (0..out.len()).rev() {
        if out[i] == 0xff {
            out[i] = 0;
        } else {
            out[i] += 1;
            return Some(out);
        }
    }
    None
}

/// Pad a bound out to `len` bytes, filling with `fill`.
#[must_use]
pub fn pad(b: &[u8], len: usize, fill: u8) -> Vec<u8> {
    let mut out = b.to_vec();
    out.resize(len, fill);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_64() {
        let hex = "a".repeat(64);
        match hex_range(&hex).unwrap() {
            HexSearch::Exact(e) => assert_eq!(e.len(), 32),
            _ => panic!("expected exact"),
        }
    }

    #[test]
    fn even_prefix() {
        match hex_range("abcd").unwrap() {
            HexSearch::Range(l, u) => {
                assert_eq!(l, vec![0xab, 0xcd]);
                assert_eq!(u, vec![0xab, 0xce]);
            }
            _ => panic!("expected range"),
        }
    }

    #[test]
    fn odd_prefix() {
        match hex_range("abc").unwrap() {
            HexSearch::Range(l, u) => {
                assert_eq!(l, vec![0xab, 0xc0]);
                assert_eq!(u, vec![0xab, 0xd0]);
            }
            _ => panic!("expected range"),
        }
    }

    #[test]
    fn odd_prefix_carry() {
        match hex_range("abf").unwrap() {
            HexSearch::Range(l, u) => {
                assert_eq!(l, vec![0xab, 0xf0]);
                assert_eq!(u, vec![0xac]);
            }
            _ => panic!("expected range"),
        }
    }

    #[test]
    fn all_ff() {
        match hex_range("ffff").unwrap() {
            HexSearch::LowerOnly(l) => assert_eq!(l, vec![0xff, 0xff]),
            _ => panic!("expected lower-only"),
        }
    }

    #[test]
    fn non_hex_rejected() {
        assert_eq!(hex_range("xyz"), None);
    }
}
