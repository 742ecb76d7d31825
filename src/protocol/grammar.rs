//! Reply grammar for the command protocol.
//!
//! A reply body (everything before the prompt sentinel) is zero or more lines, each
//! one of:
//!
//! ```text
//! key=value        explicit assignment echo
//! key value        knob echo, e.g. "TRANS_ACT:STATE IDLE"
//! token            single bare value without whitespace, e.g. "32"
//! ```
//!
//! `key` is `[A-Za-z_][A-Za-z0-9_:.\-]*`. A line starting with `ERROR` is a device
//! rejection. Anything else, including control characters, is out of grammar.

use regex::Regex;
use std::sync::OnceLock;

/// One parsed reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyLine {
    /// `key=value` or `key value`
    Pair { key: String, value: String },
    /// A single bare token
    Bare(String),
}

/// A parsed reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    raw: String,
    lines: Vec<ReplyLine>,
}

/// Why a reply body failed to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrammarError {
    /// Device answered with an `ERROR` line
    Rejected(String),
    /// Line did not match any production
    OutOfGrammar { line: usize, text: String },
}

impl std::fmt::Display for GrammarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GrammarError::Rejected(text) => write!(f, "device rejected command: {text}"),
            GrammarError::OutOfGrammar { line, text } => {
                write!(f, "line {line} out of grammar: {text:?}")
            }
        }
    }
}

fn pair_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"^([A-Za-z_][A-Za-z0-9_:.\-]*)(?:=| +)(.*)$").unwrap()
    })
}

fn bare_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"^[^\s=]+$").unwrap()
    })
}

fn is_rejection(line: &str) -> bool {
    line == "ERROR" || line.starts_with("ERROR:") || line.starts_with("ERROR ")
}

impl Reply {
    /// Parse a reply body.
    pub fn parse(body: &str) -> Result<Self, GrammarError> {
        let mut lines = Vec::new();
        for (idx, line) in body.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            if is_rejection(line) {
                return Err(GrammarError::Rejected(line.to_string()));
            }
            if line.chars().any(|c| c.is_control() && c != '\t') {
                return Err(GrammarError::OutOfGrammar {
                    line: idx + 1,
                    text: line.to_string(),
                });
            }
            if let Some(caps) = pair_re().captures(line) {
                lines.push(ReplyLine::Pair {
                    key: caps[1].to_string(),
                    value: caps[2].trim().to_string(),
                });
            } else if bare_re().is_match(line) {
                lines.push(ReplyLine::Bare(line.to_string()));
            } else {
                return Err(GrammarError::OutOfGrammar {
                    line: idx + 1,
                    text: line.to_string(),
                });
            }
        }
        Ok(Self {
            raw: body.to_string(),
            lines,
        })
    }

    /// Reply body as received.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Parsed lines.
    pub fn lines(&self) -> &[ReplyLine] {
        &self.lines
    }

    /// True when the device sent nothing before the prompt.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Value reported for `name`.
    ///
    /// Prefers a line keyed by `name`; falls back to a reply made of exactly one
    /// bare line, so firmware that answers with the value alone works.
    pub fn value_for(&self, name: &str) -> Option<&str> {
        let keyed = self.lines.iter().find_map(|line| match line {
            ReplyLine::Pair { key, value } if key == name => Some(value.as_str()),
            _ => None,
        });
        if keyed.is_some() {
            return keyed;
        }
        match self.lines.as_slice() {
            [ReplyLine::Bare(value)] => Some(value.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_knob_echo_and_assignment() {
        let reply = Reply::parse("TRANS_ACT:STATE IDLE\nshot=4\n").unwrap();
        assert_eq!(reply.value_for("TRANS_ACT:STATE"), Some("IDLE"));
        assert_eq!(reply.value_for("shot"), Some("4"));
        assert_eq!(reply.lines().len(), 2);
    }

    #[test]
    fn test_bare_value() {
        let reply = Reply::parse("32\r\n").unwrap();
        assert_eq!(reply.value_for("NCHAN"), Some("32"));
    }

    #[test]
    fn test_value_with_spaces_is_kept_whole() {
        let reply = Reply::parse("transient PRE=0 POST=1024 SOFT_TRIGGER=1").unwrap();
        assert_eq!(
            reply.value_for("transient"),
            Some("PRE=0 POST=1024 SOFT_TRIGGER=1")
        );
    }

    #[test]
    fn test_empty_reply() {
        let reply = Reply::parse("").unwrap();
        assert!(reply.is_empty());
        assert_eq!(reply.value_for("anything"), None);
    }

    #[test]
    fn test_error_line_is_rejection() {
        let err = Reply::parse("ERROR: no such knob").unwrap_err();
        assert!(matches!(err, GrammarError::Rejected(_)));
    }

    #[test]
    fn test_out_of_grammar_lines() {
        assert!(matches!(
            Reply::parse("12 34 56").unwrap_err(),
            GrammarError::OutOfGrammar { line: 1, .. }
        ));
        assert!(matches!(
            Reply::parse("ok\n\u{7}beep").unwrap_err(),
            GrammarError::OutOfGrammar { line: 2, .. }
        ));
        assert!(Reply::parse(" leading space").is_err());
    }
}
