//! Ant-style path patterns, compiled once at load time.
//!
//! - `?`       one character other than `/`
//! - `*`       zero or more characters other than `/`
//! - `**`      any number of whole segments (`/x/**` also matches `/x`)
//! - `{name}`  exactly one non-empty segment
//!
//! Patterns without any of these are kept as plain strings and compared exactly.
use regex::Regex;

#[derive(Debug, Clone)]
pub enum PathPattern {
    Exact(String),
    Wildcard { source: String, regex: Regex },
}

impl PathPattern {
    pub fn compile(pattern: &str) -> Result<Self, regex::Error> {
        let pattern = pattern.trim();
        if !has_wildcard(pattern) {
            return Ok(Self::Exact(pattern.to_string()));
        }

        let regex = Regex::new(&to_regex(pattern))?;
        Ok(Self::Wildcard {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact(p) => p == path,
            Self::Wildcard { regex, .. } => regex.is_match(path),
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, Self::Exact(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Exact(p) => p,
            Self::Wildcard { source, .. } => source,
        }
    }
}

pub fn has_wildcard(pattern: &str) -> bool {
    pattern.contains(['*', '?', '{'])
}

/// Number of characters a pattern fixes literally. More specific patterns score higher.
pub fn literal_len(pattern: &str) -> usize {
    let mut len = 0;
    let mut in_var = false;
    for c in pattern.chars() {
        match c {
            '{' => in_var = true,
            '}' if in_var => in_var = false,
            '*' | '?' => {}
            _ if in_var => {}
            _ => len += 1,
        }
    }
    len
}

fn to_regex(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');

    let mut i = 0;
    while i < chars.len() {
        let rest = &chars[i..];
        match rest {
            // "/**" as a whole trailing or inner segment: zero or more further segments.
            ['/', '*', '*', tail @ ..] if tail.is_empty() || tail[0] == '/' => {
                out.push_str("(?:/.*)?");
                i += 3;
            }
            ['*', '*', ..] => {
                out.push_str(".*");
                i += 2;
            }
            ['*', ..] => {
                out.push_str("[^/]*");
                i += 1;
            }
            ['?', ..] => {
                out.push_str("[^/]");
                i += 1;
            }
            ['{', ..] => match rest.iter().position(|&c| c == '}') {
                Some(close) => {
                    out.push_str("[^/]+");
                    i += close + 1;
                }
                None => {
                    out.push_str(&regex::escape("{"));
                    i += 1;
                }
            },
            [c, ..] => {
                let mut buf = [0u8; 4];
                out.push_str(&regex::escape(c.encode_utf8(&mut buf)));
                i += 1;
            }
            [] => break,
        }
    }

    out.push('$');
    out
}
