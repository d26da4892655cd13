//! Shell-style glob patterns over archive paths.
//!
//! `*` matches within one segment, `?` matches one character, `[...]` is a
//! character class, and `**` matches any number of whole segments when
//! recursive mode is on. Patterns compile to a regular expression anchored
//! at both ends.

use regex::Regex;

use crate::error::{Error, Result};

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    regex: Regex,
}

impl GlobPattern {
    /// Compile a glob pattern. With `recursive`, a `**` segment matches any
    /// number of path segments (including none); otherwise `**` behaves
    /// like `*`.
    pub fn compile(pattern: &str, recursive: bool) -> Result<Self> {
        let mut re = String::with_capacity(pattern.len() * 2 + 8);
        re.push('^');

        let parts: Vec<&str> = pattern.split('/').filter(|p| !p.is_empty()).collect();
        let mut pending_sep = false;
        for (idx, part) in parts.iter().enumerate() {
            let last = idx + 1 == parts.len();
            if recursive && *part == "**" {
                if last {
                    if pending_sep {
                        // "a/**" matches "a" itself and every descendant
                        re.push_str("(?:/[^/]+)*");
                    } else {
                        re.push_str(".*");
                    }
                } else {
                    if pending_sep {
                        re.push('/');
                    }
                    // consumes the separator that follows
                    re.push_str("(?:[^/]+/)*");
                    pending_sep = false;
                }
                continue;
            }
            if pending_sep {
                re.push('/');
            }
            translate_segment(part, &mut re, pattern)?;
            pending_sep = true;
        }
        re.push('$');

        let regex = Regex::new(&re)
            .map_err(|e| Error::InvalidPath(format!("bad glob pattern {pattern:?}: {e}")))?;
        Ok(Self { regex })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

/// Translate one path segment of a glob into regex syntax.
fn translate_segment(segment: &str, out: &mut String, pattern: &str) -> Result<()> {
    let chars: Vec<char> = segment.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => {
                out.push_str("[^/]*");
                // collapse consecutive stars
                while i + 1 < chars.len() && chars[i + 1] == '*' {
                    i += 1;
                }
            }
            '?' => out.push_str("[^/]"),
            '[' => {
                let mut j = i + 1;
                let negate = j < chars.len() && chars[j] == '!';
                if negate {
                    j += 1;
                }
                let body_start = j;
                // a ']' in first position is literal content
                if j < chars.len() && chars[j] == ']' {
                    j += 1;
                }
                while j < chars.len() && chars[j] != ']' {
                    j += 1;
                }
                if j >= chars.len() {
                    // unterminated class, treat '[' literally
                    out.push_str("\\[");
                } else {
                    let body: String = chars[body_start..j].iter().collect();
                    if body.is_empty() {
                        return Err(Error::InvalidPath(format!(
                            "bad glob pattern {pattern:?}: empty character class"
                        )));
                    }
                    out.push('[');
                    if negate {
                        out.push('^');
                    }
                    for c in body.chars() {
                        match c {
                            '\\' | ']' | '[' => {
                                out.push('\\');
                                out.push(c);
                            }
                            '^' if out.ends_with('[') => out.push_str("\\^"),
                            _ => out.push(c),
                        }
                    }
                    out.push(']');
                    i = j;
                }
            }
            c => {
                if regex_syntax_char(c) {
                    out.push('\\');
                }
                out.push(c);
            }
        }
        i += 1;
    }
    Ok(())
}

fn regex_syntax_char(c: char) -> bool {
    matches!(
        c,
        '.' | '+' | '(' | ')' | '|' | '^' | '$' | '{' | '}' | '\\' | '[' | ']' | '*' | '?'
    )
}

/// The literal leading part of a pattern, up to the first metacharacter.
/// Used to narrow index scans to a common path prefix before the regex
/// filter runs.
pub fn literal_prefix(pattern: &str) -> &str {
    let end = pattern
        .find(['*', '?', '['])
        .unwrap_or(pattern.len());
    &pattern[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, recursive: bool, path: &str) -> bool {
        GlobPattern::compile(pattern, recursive).unwrap().matches(path)
    }

    #[test]
    fn test_star_stays_in_segment() {
        assert!(matches("*.txt", false, "a.txt"));
        assert!(!matches("*.txt", false, "dir/a.txt"));
        assert!(matches("dir/*.txt", false, "dir/a.txt"));
        assert!(!matches("dir/*.txt", false, "dir/sub/a.txt"));
    }

    #[test]
    fn test_question_mark() {
        assert!(matches("f?.bin", false, "f1.bin"));
        assert!(!matches("f?.bin", false, "f12.bin"));
        assert!(!matches("f?.bin", false, "f/.bin"));
    }

    #[test]
    fn test_character_class() {
        assert!(matches("f[0-9].bin", false, "f3.bin"));
        assert!(!matches("f[0-9].bin", false, "fx.bin"));
        assert!(matches("f[!0-9].bin", false, "fx.bin"));
        assert!(!matches("f[!0-9].bin", false, "f3.bin"));
        assert!(matches("[]a]x", false, "]x"));
        assert!(matches("[]a]x", false, "ax"));
    }

    #[test]
    fn test_doublestar_recursive() {
        assert!(matches("**/*.txt", true, "a.txt"));
        assert!(matches("**/*.txt", true, "x/y/a.txt"));
        assert!(matches("a/**/b", true, "a/b"));
        assert!(matches("a/**/b", true, "a/x/y/b"));
        assert!(!matches("a/**/b", true, "a/x/c"));
        assert!(matches("a/**", true, "a"));
        assert!(matches("a/**", true, "a/x/y"));
        assert!(!matches("a/**", true, "ab"));
        assert!(matches("**", true, "anything/at/all"));
    }

    #[test]
    fn test_doublestar_nonrecursive_is_star() {
        assert!(matches("**", false, "top"));
        assert!(!matches("**", false, "a/b"));
    }

    #[test]
    fn test_literal_chars_escaped() {
        assert!(matches("a+b.txt", false, "a+b.txt"));
        assert!(!matches("a+b.txt", false, "aab.txt"));
    }

    #[test]
    fn test_literal_prefix() {
        assert_eq!(literal_prefix("dir/sub/*.txt"), "dir/sub/");
        assert_eq!(literal_prefix("*.txt"), "");
        assert_eq!(literal_prefix("plain/path"), "plain/path");
        assert_eq!(literal_prefix("a/b[0-9]"), "a/b");
    }
}
