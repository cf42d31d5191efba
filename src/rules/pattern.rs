//! URL pattern classification
//!
//! A pattern is a regex iff it starts with `^` or ends with `$`; otherwise
//! a `*`-glob (translated `.`→`\.`, `*`→`.*`) when it contains `*`, else a
//! plain substring. Patterns that fail to compile never match.

use regex::Regex;

#[derive(Debug)]
pub enum UrlPattern {
    /// Bare `*`: matches any URL
    Any,
    Regex(Regex),
    Substring(String),
}

impl UrlPattern {
    pub fn compile(pattern: &str) -> Option<Self> {
        if pattern == "*" {
            return Some(UrlPattern::Any);
        }
        if pattern.starts_with('^') || pattern.ends_with('$') {
            return match Regex::new(pattern) {
                Ok(re) => Some(UrlPattern::Regex(re)),
                Err(e) => {
                    tracing::debug!(pattern, "url pattern failed to compile: {e}");
                    None
                }
            };
        }
        if pattern.contains('*') {
            let translated = format!(
                "^{}$",
                pattern.replace('.', "\\.").replace('*', ".*")
            );
            return match Regex::new(&translated) {
                Ok(re) => Some(UrlPattern::Regex(re)),
                Err(e) => {
                    tracing::debug!(pattern, "glob pattern failed to compile: {e}");
                    None
                }
            };
        }
        Some(UrlPattern::Substring(pattern.to_string()))
    }

    pub fn matches(&self, url: &str) -> bool {
        match self {
            UrlPattern::Any => true,
            UrlPattern::Regex(re) => re.is_match(url),
            UrlPattern::Substring(needle) => url.contains(needle.as_str()),
        }
    }
}

/// A rule's compiled URL gate: absent patterns admit everything, invalid
/// patterns admit nothing.
#[derive(Debug)]
pub enum PatternGate {
    Absent,
    Valid(UrlPattern),
    Invalid,
}

impl PatternGate {
    pub fn compile(pattern: Option<&str>) -> Self {
        match pattern {
            None => PatternGate::Absent,
            Some(p) => match UrlPattern::compile(p) {
                Some(compiled) => PatternGate::Valid(compiled),
                None => PatternGate::Invalid,
            },
        }
    }

    pub fn admits(&self, url: &str) -> bool {
        match self {
            PatternGate::Absent => true,
            PatternGate::Valid(pattern) => pattern.matches(url),
            PatternGate::Invalid => false,
        }
    }
}
