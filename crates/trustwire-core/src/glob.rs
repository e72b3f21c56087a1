//! Shell-style glob matching shared by access evaluation and cache purge.
//!
//! Both "may we read this?" and "must we delete this?" go through
//! [`glob_matches`], so the two can never disagree about what a pattern
//! covers.
//!
//! Semantics follow shell `fnmatch`: `*` matches any run of characters
//! (including `/`), `?` matches one character, `[...]` is a character class.
//! Matching is case-sensitive. Runs of `*` collapse to one, so `memory**`
//! behaves like `memory*`. A pattern that fails to parse only matches itself
//! literally.

use glob::{MatchOptions, Pattern};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Check whether `name` matches the glob `pattern`.
pub fn glob_matches(pattern: &str, name: &str) -> bool {
    match Pattern::new(&collapse_stars(pattern)) {
        Ok(p) => p.matches_with(name, MATCH_OPTIONS),
        Err(_) => pattern == name,
    }
}

// `glob::Pattern` only accepts `**` as a whole path component.
fn collapse_stars(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if c == '*' && out.ends_with('*') {
            continue;
        }
        out.push(c);
    }
    out
}

/// Check whether `name` matches any of `patterns`.
pub fn matches_any<S: AsRef<str>>(patterns: &[S], name: &str) -> bool {
    patterns.iter().any(|p| glob_matches(p.as_ref(), name))
}
