//! Shell-style glob matching for sandbox search results.

use regex::Regex;

use super::error::{SandboxError, SandboxResult};

/// Translate a shell glob (`*`, `**`, `?`) into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> SandboxResult<Regex> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| SandboxError::Operation(format!("invalid glob: {e}")))
}

/// Matches absolute paths against a glob taken relative to `base`.
///
/// Absolute patterns are matched against the whole path instead.
#[derive(Debug, Clone)]
pub struct GlobFilter {
    re: Regex,
    absolute: bool,
    prefix: String,
}

impl GlobFilter {
    pub fn new(pattern: &str, base: &str) -> SandboxResult<Self> {
        Ok(Self {
            re: glob_to_regex(pattern)?,
            absolute: pattern.starts_with('/'),
            prefix: format!("{}/", base.trim_end_matches('/')),
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        if self.absolute {
            return self.re.is_match(path);
        }
        path.strip_prefix(&self.prefix)
            .is_some_and(|rel| self.re.is_match(rel))
    }
}
