//! Response pattern matching for expect rules.

use common::{Error, Result};
use regex::Regex;
use std::fmt;

/// Pattern an expect rule matches against the response buffer.
///
/// String and binary patterns are compared over their declared byte length,
/// never delimiter-terminated, so embedded NUL bytes are fine on both sides.
#[derive(Clone)]
pub enum Pattern {
    /// Literal text matched as a substring anywhere in the buffer.
    String(String),
    /// Literal byte sequence matched as a subslice anywhere in the buffer.
    Binary(Vec<u8>),
    /// Regular expression over the textual rendering of the buffer.
    Regex(Regex),
    /// Regular expression over the lowercase-hex rendering of the buffer.
    RegexBinary(Regex),
}

/// Outcome of one pattern evaluation.
#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    pub matched: bool,
    /// Capture groups, in order, when requested and matched.
    pub captures: Vec<String>,
}

impl Pattern {
    /// Compile a regex pattern for text responses.
    pub fn regex(expr: &str) -> Result<Self> {
        Ok(Pattern::Regex(Regex::new(expr).map_err(Error::pattern)?))
    }

    /// Compile a regex pattern applied to the hex rendering of the response.
    pub fn regex_binary(expr: &str) -> Result<Self> {
        Ok(Pattern::RegexBinary(Regex::new(expr).map_err(Error::pattern)?))
    }

    /// Evaluate this pattern against a response buffer.
    ///
    /// Inversion is the caller's business; this only reports the raw match.
    pub fn matches(&self, data: &[u8], with_capture: bool) -> MatchOutcome {
        match self {
            Pattern::String(s) => MatchOutcome {
                matched: find_subslice(data, s.as_bytes()),
                captures: Vec::new(),
            },
            Pattern::Binary(b) => MatchOutcome {
                matched: find_subslice(data, b),
                captures: Vec::new(),
            },
            Pattern::Regex(re) => {
                let text = String::from_utf8_lossy(data);
                regex_outcome(re, &text, with_capture)
            }
            Pattern::RegexBinary(re) => {
                let hex = hex_encode(data);
                regex_outcome(re, &hex, with_capture)
            }
        }
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::String(s) => write!(f, "String({s:?})"),
            Pattern::Binary(b) => write!(f, "Binary({} bytes)", b.len()),
            Pattern::Regex(re) => write!(f, "Regex({:?})", re.as_str()),
            Pattern::RegexBinary(re) => write!(f, "RegexBinary({:?})", re.as_str()),
        }
    }
}

fn regex_outcome(re: &Regex, text: &str, with_capture: bool) -> MatchOutcome {
    if !with_capture {
        return MatchOutcome { matched: re.is_match(text), captures: Vec::new() };
    }
    match re.captures(text) {
        Some(caps) => MatchOutcome {
            matched: true,
            captures: caps
                .iter()
                .skip(1)
                .map(|c| c.map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect(),
        },
        None => MatchOutcome::default(),
    }
}

/// Length-delimited subslice search.
fn find_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Lowercase-hex rendering used by binary regex patterns.
fn hex_encode(data: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Expand `$1`..`$9` capture references in an annotation template.
pub fn expand_captures(template: &str, captures: &[String]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' {
            if let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                chars.next();
                if d >= 1 {
                    if let Some(cap) = captures.get(d as usize - 1) {
                        out.push_str(cap);
                    }
                }
                continue;
            }
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_match_anywhere() {
        let p = Pattern::String("PONG".to_string());
        assert!(p.matches(b"some PONG reply", false).matched);
        assert!(!p.matches(b"some PING reply", false).matched);
    }

    #[test]
    fn test_binary_match_with_embedded_nul() {
        let p = Pattern::Binary(vec![0x00, 0xff, 0x00]);
        assert!(p.matches(&[0x01, 0x00, 0xff, 0x00, 0x02], false).matched);
        assert!(!p.matches(&[0x01, 0x00, 0xff, 0x01], false).matched);
    }

    #[test]
    fn test_literal_with_nul_in_pattern() {
        let p = Pattern::Binary(b"ab\0cd".to_vec());
        assert!(p.matches(b"xxab\0cdyy", false).matched);
        assert!(!p.matches(b"xxabcdyy", false).matched);
    }

    #[test]
    fn test_regex_match_and_captures() {
        let p = Pattern::regex(r"HTTP/1\.\d (\d{3}) (\w+)").unwrap();
        let outcome = p.matches(b"HTTP/1.1 200 OK\r\n", true);
        assert!(outcome.matched);
        assert_eq!(outcome.captures, vec!["200".to_string(), "OK".to_string()]);

        let outcome = p.matches(b"HTTP/1.1 200 OK\r\n", false);
        assert!(outcome.matched);
        assert!(outcome.captures.is_empty());
    }

    #[test]
    fn test_regex_binary_over_hex_rendering() {
        // 0xdeadbeef anywhere in the payload.
        let p = Pattern::regex_binary("deadbeef").unwrap();
        assert!(p.matches(&[0x01, 0xde, 0xad, 0xbe, 0xef, 0x02], false).matched);
        assert!(!p.matches(&[0xde, 0xad, 0xbe, 0xee], false).matched);
    }

    #[test]
    fn test_invalid_regex_is_config_error() {
        assert!(Pattern::regex("(unclosed").is_err());
    }

    #[test]
    fn test_expand_captures() {
        let caps = vec!["503".to_string(), "Service Unavailable".to_string()];
        assert_eq!(
            expand_captures("got status $1 ($2)", &caps),
            "got status 503 (Service Unavailable)"
        );
        assert_eq!(expand_captures("no refs", &caps), "no refs");
        // Out-of-range references expand to nothing.
        assert_eq!(expand_captures("x$5x", &caps), "xx");
    }
}
