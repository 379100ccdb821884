//! Quote-aware scanning helpers.
//!
//! Operators are only recognised outside quoted regions. A quote character
//! opens a region only at a token boundary (start of input, whitespace, `=`,
//! `:`, or an opening bracket), so apostrophes inside plain words such as
//! `don't` never swallow the rest of the command.
//!
//! A region is searched for its closing quote up to the next `key="` token or
//! the end of input. Inside that window, embedded pairs like `"hi"` stay part
//! of the value: the closing quote is the first one that ends a word and
//! leaves the remaining quotes balanced.

use std::sync::LazyLock;

use regex::Regex;

/// Start of the next quoted `key=` argument, which bounds a quoted value.
pub(crate) static NEXT_QUOTED_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\s+[A-Za-z_][A-Za-z0-9_-]*=["'`]"#).expect("next key regex should compile")
});

/// Whitespace requirements around an operator occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spacing {
    /// Match anywhere outside quotes.
    Any,
    /// Must be at the start of input or preceded by whitespace.
    Before,
    /// Must be surrounded by whitespace (or input boundaries).
    Around,
}

fn is_quote(c: u8) -> bool {
    matches!(c, b'"' | b'\'' | b'`')
}

fn opens_token(prev: Option<u8>) -> bool {
    match prev {
        None => true,
        Some(p) => p.is_ascii_whitespace() || matches!(p, b'=' | b':' | b'(' | b'[' | b'{' | b','),
    }
}

/// Where a quoted region that opened just before `body` ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteEnd {
    /// Offset of the closing quote within `body`.
    Closed(usize),
    /// No closing quote; the value runs up to this offset.
    Unterminated(usize),
}

/// Find the quote closing a region whose content starts at `body`.
pub fn closing_quote(body: &str, quote: u8) -> QuoteEnd {
    let window_end = NEXT_QUOTED_KEY
        .find(body)
        .map(|m| m.start())
        .unwrap_or(body.len());
    let bytes = &body.as_bytes()[..window_end];

    let mut candidates = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i] == quote {
            candidates.push(i);
        }
        i += 1;
    }

    let ends_word = |at: usize| {
        bytes
            .get(at + 1)
            .is_none_or(|next| !(next.is_ascii_alphanumeric() || *next == b'_'))
    };
    candidates
        .iter()
        .enumerate()
        .find(|(n, at)| ends_word(**at) && (candidates.len() - n - 1) % 2 == 0)
        .map(|(_, at)| *at)
        .or_else(|| candidates.last().copied())
        .map_or(QuoteEnd::Unterminated(window_end), QuoteEnd::Closed)
}

/// Per-byte flags: `true` when the byte sits inside a quoted region
/// (quote characters included).
pub fn quoted_mask(text: &str) -> Vec<bool> {
    let bytes = text.as_bytes();
    let mut mask = vec![false; bytes.len()];
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        let prev = if i == 0 { None } else { Some(bytes[i - 1]) };
        if !(is_quote(b) && opens_token(prev)) {
            i += 1;
            continue;
        }
        let body = i + 1;
        let end = match closing_quote(&text[body..], b) {
            QuoteEnd::Closed(close) => body + close + 1,
            QuoteEnd::Unterminated(until) => body + until,
        };
        mask[i..end].fill(true);
        i = end.max(i + 1);
    }
    mask
}

/// Byte offsets of every unquoted occurrence of `op` satisfying `spacing`.
pub fn find_top_level(text: &str, op: &str, spacing: Spacing) -> Vec<usize> {
    let mask = quoted_mask(text);
    let bytes = text.as_bytes();
    let mut found = Vec::new();
    let mut start = 0;
    while let Some(rel) = text[start..].find(op) {
        let at = start + rel;
        let end = at + op.len();
        let before_ok = at == 0 || bytes[at - 1].is_ascii_whitespace();
        let after_ok = end >= bytes.len() || bytes[end].is_ascii_whitespace();
        let spacing_ok = match spacing {
            Spacing::Any => true,
            Spacing::Before => before_ok,
            Spacing::Around => before_ok && after_ok,
        };
        if spacing_ok && !mask[at] {
            found.push(at);
            start = end;
        } else {
            start = at + op.len().max(1);
        }
        if start >= text.len() {
            break;
        }
    }
    found
}

/// Split `text` on unquoted occurrences of `op`, trimming every piece.
pub fn split_top_level<'a>(text: &'a str, op: &str, spacing: Spacing) -> Vec<&'a str> {
    let mut pieces = Vec::new();
    let mut last = 0;
    for at in find_top_level(text, op, spacing) {
        pieces.push(text[last..at].trim());
        last = at + op.len();
    }
    pieces.push(text[last..].trim());
    pieces
}

/// Remove one matching pair of surrounding quotes, if present.
pub fn unquote(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    if bytes.len() >= 2 && is_quote(bytes[0]) && bytes[bytes.len() - 1] == bytes[0] {
        Some(&text[1..text.len() - 1])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_chain_outside_quotes_only() {
        let text = r#">>a x="keep --> this" --> >>b"#;
        let pieces = split_top_level(text, "-->", Spacing::Any);
        assert_eq!(pieces, vec![r#">>a x="keep --> this""#, ">>b"]);
    }

    #[test]
    fn apostrophe_inside_word_does_not_open_quote() {
        let text = ">>a don't stop --> >>b";
        let pieces = split_top_level(text, "-->", Spacing::Any);
        assert_eq!(pieces.len(), 2);
    }

    #[test]
    fn gate_operator_requires_leading_space() {
        let text = r#">>a path=std::fs :: "be terse""#;
        let pieces = split_top_level(text, "::", Spacing::Before);
        assert_eq!(pieces, vec![">>a path=std::fs", r#""be terse""#]);
    }

    #[test]
    fn escaped_quote_stays_inside_region() {
        let text = r#"x="a \" --> b" --> y"#;
        let pieces = split_top_level(text, "-->", Spacing::Any);
        assert_eq!(pieces, vec![r#"x="a \" --> b""#, "y"]);
    }

    #[test]
    fn embedded_quotes_do_not_end_a_value() {
        let text = ">>doc content=\"She said \"hi\" | a | b |\nend\"";
        assert!(find_top_level(text, "|", Spacing::Around).is_empty());

        let text = r#">>doc content="say "go" --> now" --> >>b"#;
        let pieces = split_top_level(text, "-->", Spacing::Any);
        assert_eq!(pieces, vec![r#">>doc content="say "go" --> now""#, ">>b"]);
    }

    #[test]
    fn next_quoted_key_bounds_the_value() {
        let text = r#"x="1" :: "be terse" --> >>b y="2""#;
        assert_eq!(split_top_level(text, "-->", Spacing::Any).len(), 2);
        assert_eq!(split_top_level(text, "::", Spacing::Before).len(), 2);
    }

    #[test]
    fn closing_quote_skips_quoted_words() {
        assert_eq!(closing_quote(r#"a "b" c" rest"#, b'"'), QuoteEnd::Closed(7));
        assert_eq!(closing_quote(r#"it's fine' :: 'x'"#, b'\''), QuoteEnd::Closed(9));
        assert_eq!(closing_quote("open y=\"2\"", b'"'), QuoteEnd::Unterminated(4));
    }

    #[test]
    fn parallel_operator_needs_surrounding_space() {
        assert_eq!(find_top_level("a&b", "&", Spacing::Around), Vec::<usize>::new());
        assert_eq!(find_top_level("a & b", "&", Spacing::Around), vec![2]);
    }

    #[test]
    fn unquote_strips_matching_pair() {
        assert_eq!(unquote("\"hi\""), Some("hi"));
        assert_eq!(unquote("'hi'"), Some("hi"));
        assert_eq!(unquote("\"hi'"), None);
    }
}
