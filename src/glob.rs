//! Glob pattern matching against the filesystem.
//!
//! Patterns support `*` (any run of characters within one path segment),
//! `**` (any number of segments, including none), `?` (one character), `[...]`
//! character classes, and brace expansion (`{a,b,c}`, nestable). A pattern
//! prefixed with `!` excludes previously-matched paths instead of adding to
//! them; patterns are applied in declaration order, so a later `!` removes
//! matches added by an earlier non-negated pattern, and a later non-negated
//! pattern can re-add paths an earlier `!` removed.

use std::collections::BTreeSet;

use regex::Regex;
use thiserror::Error;

use crate::path::{AbsDirPath, RelSomePath};

#[derive(Debug, Error)]
pub enum GlobError {
    #[error("invalid glob pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("unbalanced brace in pattern {0:?}")]
    UnbalancedBrace(String),
    #[error("walk {dir:?}: {source}")]
    Walk {
        dir: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The kind of filesystem entry a matched path refers to.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// A path matched by a [`GlobSet`], relative to the base directory it was
/// resolved against.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct MatchedEntry {
    pub path: RelSomePath,
    pub kind: EntryKind,
}

/// Directories excluded by default unless the caller opts out
/// (`allowUsuallyExcludedPaths` in the manifest schema).
pub const DEFAULT_EXCLUDED_DIRS: &[&str] = &[".git", ".hg", ".svn", ".wireit", ".yarn", "CVS", "node_modules"];

fn default_exclusion_patterns() -> Vec<String> {
    DEFAULT_EXCLUDED_DIRS
        .iter()
        .map(|dir| format!("!{dir}/**"))
        .collect()
}

struct CompiledPattern {
    negated: bool,
    regex: Regex,
}

/// An ordered set of glob patterns, compiled once and matched against a
/// directory tree as many times as needed.
pub struct GlobSet {
    compiled: Vec<CompiledPattern>,
}

impl GlobSet {
    /// Compile `patterns` in declaration order. If `patterns` is non-empty and
    /// `apply_default_exclusions` is true, the default exclusions (see
    /// [`DEFAULT_EXCLUDED_DIRS`]) are appended after the caller's patterns, so
    /// they can still be overridden by a later explicit include.
    ///
    /// Per the manifest schema, default exclusions are never applied when
    /// `patterns` is empty: an empty array means "match nothing", not "match
    /// everything except the defaults".
    pub fn compile(patterns: &[String], apply_default_exclusions: bool) -> Result<Self, GlobError> {
        let mut all = patterns.to_vec();
        if apply_default_exclusions && !patterns.is_empty() {
            all.extend(default_exclusion_patterns());
        }

        let mut compiled = Vec::with_capacity(all.len());
        for raw in &all {
            for expanded in expand_braces(raw)? {
                let negated = expanded.starts_with('!');
                let body = if negated { &expanded[1..] } else { expanded.as_str() };
                let regex_str = glob_to_regex(body);
                let regex = Regex::new(&regex_str).map_err(|e| GlobError::InvalidPattern {
                    pattern: raw.clone(),
                    reason: e.to_string(),
                })?;
                compiled.push(CompiledPattern { negated, regex });
            }
        }
        Ok(Self { compiled })
    }

    /// Resolve this set against every entry under `base`, returning matches
    /// in a stable (sorted by path) order.
    pub fn resolve(&self, base: &AbsDirPath) -> Result<Vec<MatchedEntry>, GlobError> {
        if self.compiled.is_empty() {
            return Ok(Vec::new());
        }

        let mut result: BTreeSet<MatchedEntry> = BTreeSet::new();
        for entry in walkdir::WalkDir::new(base.as_std_path())
            .min_depth(1)
            .follow_links(false)
        {
            let entry = entry.map_err(|e| GlobError::Walk {
                dir: base.as_std_path().to_owned(),
                source: std::io::Error::other(e),
            })?;
            let rel = entry
                .path()
                .strip_prefix(base.as_std_path())
                .expect("walkdir entries are under base");
            let rel_str = rel.to_string_lossy().replace('\\', "/");

            let file_type = entry.file_type();
            let kind = if file_type.is_symlink() {
                EntryKind::Symlink
            } else if file_type.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            };

            for pattern in &self.compiled {
                if !pattern.regex.is_match(&rel_str) {
                    continue;
                }
                let Ok(path) = RelSomePath::try_from(rel.to_owned()) else {
                    continue;
                };
                let matched = MatchedEntry { path, kind };
                if pattern.negated {
                    result.remove(&matched);
                } else {
                    result.insert(matched);
                }
            }
        }
        Ok(result.into_iter().collect())
    }
}

/// Match a single name (no path separators) against a single glob pattern,
/// with brace expansion but no filesystem access. Used to glob-match script
/// name patterns within a package.
pub fn matches_pattern(pattern: &str, candidate: &str) -> Result<bool, GlobError> {
    for expanded in expand_braces(pattern)? {
        let regex = Regex::new(&glob_to_regex(&expanded)).map_err(|e| GlobError::InvalidPattern {
            pattern: pattern.to_owned(),
            reason: e.to_string(),
        })?;
        if regex.is_match(candidate) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Expand brace groups (`{a,b,c}`, nestable) in a pattern into every literal
/// combination. A pattern with no braces expands to itself.
fn expand_braces(pattern: &str) -> Result<Vec<String>, GlobError> {
    let Some(open) = pattern.find('{') else {
        return Ok(vec![pattern.to_owned()]);
    };

    let bytes = pattern.as_bytes();
    let mut depth = 0usize;
    let mut close = None;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }
    let Some(close) = close else {
        return Err(GlobError::UnbalancedBrace(pattern.to_owned()));
    };

    let prefix = &pattern[..open];
    let body = &pattern[open + 1..close];
    let suffix = &pattern[close + 1..];

    let options = split_top_level_commas(body);
    let mut out = Vec::new();
    for option in options {
        let combined = format!("{prefix}{option}{suffix}");
        out.extend(expand_braces(&combined)?);
    }
    Ok(out)
}

fn split_top_level_commas(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in body.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&body[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&body[start..]);
    parts
}

/// Compile a single glob pattern (no braces, no leading `!`) to a regex
/// string anchored to match the whole path.
fn glob_to_regex(pattern: &str) -> String {
    let mut re = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // Consume an immediately following '/' so "**/x" also
                    // matches "x" at the root (zero segments).
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        re.push_str("(?:.*/)?");
                    } else {
                        re.push_str(".*");
                    }
                } else {
                    re.push_str("[^/]*");
                }
            }
            '?' => re.push_str("[^/]"),
            '.' | '+' | '(' | ')' | '|' | '^' | '$' => {
                re.push('\\');
                re.push(c);
            }
            '[' => {
                re.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    re.push('^');
                }
                for c in chars.by_ref() {
                    re.push(c);
                    if c == ']' {
                        break;
                    }
                }
            }
            '\\' => {
                if let Some(next) = chars.next() {
                    re.push('\\');
                    re.push(next);
                }
            }
            other => re.push(other),
        }
    }
    re.push('$');
    re
}

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;

    #[test_case("*.rs", "main.rs", true; "star matches within segment")]
    #[test_case("*.rs", "src/main.rs", false; "star does not cross segment")]
    #[test_case("**/*.rs", "src/lib/main.rs", true; "globstar crosses segments")]
    #[test_case("**/*.rs", "main.rs", true; "globstar matches zero segments")]
    #[test_case("src/?.rs", "src/a.rs", true; "question mark matches one char")]
    #[test_case("src/?.rs", "src/ab.rs", false; "question mark rejects two chars")]
    fn glob_matches(pattern: &str, path: &str, expected: bool) {
        let re = Regex::new(&glob_to_regex(pattern)).unwrap();
        assert_eq!(re.is_match(path), expected);
    }

    #[test]
    fn brace_expansion_flat() {
        let expanded = expand_braces("src/{a,b,c}.rs").unwrap();
        assert_eq!(expanded, vec!["src/a.rs", "src/b.rs", "src/c.rs"]);
    }

    #[test]
    fn brace_expansion_nested() {
        let expanded = expand_braces("{a,{b,c}}.rs").unwrap();
        assert_eq!(expanded, vec!["a.rs", "b.rs", "c.rs"]);
    }

    #[test]
    fn unbalanced_brace_errors() {
        assert!(expand_braces("src/{a,b.rs").is_err());
    }

    #[tokio::test]
    async fn resolve_applies_exclusion_in_order() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("src")).await.unwrap();
        tokio::fs::write(dir.path().join("src/a.rs"), b"").await.unwrap();
        tokio::fs::write(dir.path().join("src/a.test.rs"), b"").await.unwrap();

        let base = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        let set = GlobSet::compile(
            &["src/**/*.rs".to_string(), "!src/**/*.test.rs".to_string()],
            false,
        )
        .unwrap();
        let matches = set.resolve(&base).unwrap();
        let paths: Vec<_> = matches.iter().map(|m| m.path.as_str_lossy().into_owned()).collect();
        assert!(paths.iter().any(|p| p == "src/a.rs" || p == "src\\a.rs"));
        assert!(!paths.iter().any(|p| p.contains("a.test.rs")));
    }

    #[tokio::test]
    async fn empty_patterns_never_get_default_exclusions() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join(".git")).await.unwrap();

        let base = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        let set = GlobSet::compile(&[], true).unwrap();
        let matches = set.resolve(&base).unwrap();
        assert!(matches.is_empty());
    }
}
