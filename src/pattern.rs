//! Dataset URN pattern matching.
//!
//! Test results reference datasets by URN *pattern* rather than exact URN,
//! because testing tools and lineage producers rarely agree on one URN
//! format for the same dataset. A pattern is a URN with wildcards:
//!
//! - `*` matches one or more characters within a path segment (no `/`),
//! - `**` matches one or more characters across segments.
//!
//! Patterns are compiled to anchored regexes with all literal characters
//! escaped. Resolution against the set of concrete URNs known to the system
//! yields exactly one of: unmatched, a unique URN, or an ambiguous match
//! count. Only unique resolutions participate in correlation.

use regex::Regex;

/// Outcome of resolving one pattern against the known URN set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternResolution {
    /// No known URN matches the pattern.
    Unmatched,
    /// Exactly one known URN matches.
    Unique(String),
    /// More than one known URN matches; carries the match count.
    Ambiguous(usize),
}

/// A compiled dataset URN pattern.
#[derive(Debug, Clone)]
pub struct UrnPattern {
    raw: String,
    matcher: Matcher,
}

#[derive(Debug, Clone)]
enum Matcher {
    Literal,
    Wildcard(Regex),
}

impl UrnPattern {
    /// Compile a pattern string. Patterns without wildcards compare as
    /// plain string equality.
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        if !pattern.contains('*') {
            return Ok(Self {
                raw: pattern.to_string(),
                matcher: Matcher::Literal,
            });
        }

        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push('^');

        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '*' {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    expr.push_str(".+");
                } else {
                    expr.push_str("[^/]+");
                }
            } else {
                expr.push_str(&regex::escape(&c.to_string()));
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr)
            .map_err(|e| PatternError::new(pattern, e.to_string()))?;

        Ok(Self {
            raw: pattern.to_string(),
            matcher: Matcher::Wildcard(regex),
        })
    }

    /// The original pattern string.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// True when the pattern carries no wildcards.
    pub fn is_exact(&self) -> bool {
        matches!(self.matcher, Matcher::Literal)
    }

    pub fn matches(&self, urn: &str) -> bool {
        match &self.matcher {
            Matcher::Literal => self.raw == urn,
            Matcher::Wildcard(re) => re.is_match(urn),
        }
    }

    /// Resolve this pattern against the known concrete URNs.
    pub fn resolve<'a, I>(&self, known_urns: I) -> PatternResolution
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut matched: Option<&str> = None;
        let mut count = 0usize;

        for urn in known_urns {
            if self.matches(urn) {
                count += 1;
                if matched.is_none() {
                    matched = Some(urn);
                }
                // Literal patterns cannot match twice.
                if self.is_exact() {
                    break;
                }
            }
        }

        match (count, matched) {
            (0, _) => PatternResolution::Unmatched,
            (1, Some(urn)) => PatternResolution::Unique(urn.to_string()),
            (n, _) => PatternResolution::Ambiguous(n),
        }
    }
}

/// A pattern that could not be compiled.
#[derive(Debug, Clone)]
pub struct PatternError {
    pattern: String,
    detail: String,
}

impl PatternError {
    fn new(pattern: &str, detail: String) -> Self {
        Self { pattern: pattern.to_string(), detail }
    }
}

impl std::fmt::Display for PatternError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid dataset urn pattern {:?}: {}", self.pattern, self.detail)
    }
}

impl std::error::Error for PatternError {}
