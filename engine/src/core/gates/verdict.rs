//! Gate review verdict parsing.
//!
//! Patterns are tried in a fixed order; the first match wins. Each pattern
//! declares which input channel it accepts, anchors at the start of the text
//! and requires a non-empty rationale after the separator.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Channel a candidate verdict arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    /// Dedicated `gate_verdict` parameter (trusted).
    GateVerdict,
    /// Free-text `user_response` (untrusted).
    UserResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedVerdict {
    pub verdict: Verdict,
    pub rationale: String,
    pub source: VerdictSource,
    pub pattern: &'static str,
}

/// One entry of the ordered pattern list.
pub struct VerdictPattern {
    pub label: &'static str,
    /// `None` accepts either channel.
    pub required_source: Option<VerdictSource>,
    regex: Regex,
}

impl VerdictPattern {
    fn new(label: &'static str, required_source: Option<VerdictSource>, pattern: &str) -> Self {
        Self {
            label,
            required_source,
            regex: Regex::new(pattern).expect("verdict regex should compile"),
        }
    }

    /// Match `text` against this pattern alone.
    pub fn parse(&self, text: &str, source: VerdictSource) -> Option<ParsedVerdict> {
        if self.required_source.is_some_and(|required| required != source) {
            return None;
        }
        let caps = self.regex.captures(text)?;
        let verdict = match caps.get(1)?.as_str().to_ascii_uppercase().as_str() {
            "PASS" => Verdict::Pass,
            "FAIL" => Verdict::Fail,
            _ => return None,
        };
        let rationale = caps.get(2)?.as_str().trim();
        if rationale.is_empty() {
            return None;
        }
        Some(ParsedVerdict {
            verdict,
            rationale: rationale.to_string(),
            source,
            pattern: self.label,
        })
    }
}

pub static VERDICT_PATTERNS: LazyLock<Vec<VerdictPattern>> = LazyLock::new(|| {
    vec![
        VerdictPattern::new(
            "gate-review-prefix",
            None,
            r"(?is)^GATE_REVIEW:\s*(PASS|FAIL)\s*[-:]\s*(.*)$",
        ),
        VerdictPattern::new("gate-prefix", None, r"(?is)^GATE\s+(PASS|FAIL)\s*[-:]\s*(.*)$"),
        VerdictPattern::new(
            "bare",
            Some(VerdictSource::GateVerdict),
            r"(?is)^(PASS|FAIL)\s*[-:]\s*(.*)$",
        ),
    ]
});

/// Parse a verdict from `text`, honouring per-pattern source restrictions.
pub fn parse_gate_verdict(text: &str, source: VerdictSource) -> Option<ParsedVerdict> {
    VERDICT_PATTERNS
        .iter()
        .find_map(|pattern| pattern.parse(text, source))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(label: &str) -> &'static VerdictPattern {
        VERDICT_PATTERNS
            .iter()
            .find(|p| p.label == label)
            .expect("pattern exists")
    }

    #[test]
    fn bare_verdict_accepted_from_gate_verdict() {
        let parsed = parse_gate_verdict("PASS - ok", VerdictSource::GateVerdict).expect("verdict");
        assert_eq!(parsed.verdict, Verdict::Pass);
        assert_eq!(parsed.rationale, "ok");
        assert_eq!(parsed.pattern, "bare");
    }

    #[test]
    fn bare_verdict_rejected_from_user_response() {
        assert_eq!(parse_gate_verdict("PASS - ok", VerdictSource::UserResponse), None);
    }

    #[test]
    fn missing_rationale_is_rejected() {
        assert_eq!(parse_gate_verdict("GATE PASS", VerdictSource::GateVerdict), None);
        assert_eq!(parse_gate_verdict("GATE_REVIEW: FAIL -   ", VerdictSource::GateVerdict), None);
    }

    #[test]
    fn prefixed_forms_accepted_from_either_channel() {
        for source in [VerdictSource::GateVerdict, VerdictSource::UserResponse] {
            let parsed = parse_gate_verdict("GATE_REVIEW: FAIL: missing tests", source)
                .expect("gate review prefix");
            assert_eq!(parsed.verdict, Verdict::Fail);
            assert_eq!(parsed.rationale, "missing tests");
            assert_eq!(parsed.pattern, "gate-review-prefix");

            let parsed = parse_gate_verdict("gate pass - fine", source).expect("gate prefix");
            assert_eq!(parsed.verdict, Verdict::Pass);
            assert_eq!(parsed.pattern, "gate-prefix");
        }
    }

    #[test]
    fn leading_whitespace_invalidates_match() {
        assert_eq!(parse_gate_verdict("  GATE PASS - ok", VerdictSource::GateVerdict), None);
    }

    #[test]
    fn prose_starting_with_pass_is_not_a_verdict() {
        let prose = "Passing the borrow checker requires care: lifetimes matter.";
        assert_eq!(parse_gate_verdict(prose, VerdictSource::UserResponse), None);
    }

    #[test]
    fn each_pattern_checks_its_own_source() {
        let bare = pattern("bare");
        assert!(bare.parse("FAIL: nope", VerdictSource::UserResponse).is_none());
        assert!(bare.parse("FAIL: nope", VerdictSource::GateVerdict).is_some());
        assert!(pattern("gate-prefix").parse("GATE FAIL - x", VerdictSource::UserResponse).is_some());
    }
}
