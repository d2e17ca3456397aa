//! Dependency specifier grammar: `!`-inversion, path/npm/special package
//! forms, `#`/`:` script separators, and escape handling.
//!
//! A specifier names another script this one depends on, e.g. `../core#build`,
//! `<workspaces>#test`, or `!lint` (an exclusion within the enclosing
//! dependency list). See `compute_order`-adjacent callers in `analyzer` for
//! how a list of these is expanded into concrete script references.

use std::ops::Range;

use thiserror::Error;

/// A specifier's package half.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Package {
    /// `.`-prefixed relative path to another package directory.
    Path(String),
    /// A bare name, resolved as a package dependency by name.
    Npm(String),
    /// `<this>` — the declaring package.
    This,
    /// `<workspaces>` — every workspace of the declaring package.
    Workspaces,
    /// `<dependencies>` — the declaring package's runtime dependencies that
    /// share its workspace root.
    Dependencies,
}

/// A specifier's script half.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Script {
    Name(String),
    /// `<this>` — the declaring script's own name.
    This,
}

/// A single parsed dependency specifier.
#[derive(Clone, Debug)]
pub struct ParsedDependency {
    pub package: Package,
    pub script: Script,
    /// `!`-inverted: excludes previously matched references in the enclosing
    /// dependency list rather than adding to it.
    pub inverted: bool,
    pub package_range: Range<usize>,
    pub script_range: Range<usize>,
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum SpecifierError {
    #[error("trailing backslash at byte {0}")]
    TrailingBackslash(usize),
    #[error("unterminated special starting at byte {0}")]
    UnterminatedSpecial(usize),
    #[error("invalid escape sequence `\\{1}` at byte {0}")]
    InvalidEscape(usize, char),
    #[error("path-form dependency `{0}` is missing a script segment")]
    PathMissingScript(String),
    #[error("empty dependency specifier")]
    Empty,
}

const SPECIALS: [(&str, SpecialKind); 3] = [
    ("<this>", SpecialKind::This),
    ("<workspaces>", SpecialKind::Workspaces),
    ("<dependencies>", SpecialKind::Dependencies),
];

#[derive(Copy, Clone)]
enum SpecialKind {
    This,
    Workspaces,
    Dependencies,
}

/// Parse a single dependency specifier string.
pub fn parse(input: &str) -> Result<ParsedDependency, SpecifierError> {
    if input.is_empty() {
        return Err(SpecifierError::Empty);
    }

    let (inverted, start) = if input.starts_with('!') { (true, 1) } else { (false, 0) };
    let body = &input[start..];
    if body.is_empty() {
        return Err(SpecifierError::Empty);
    }

    let is_path_form = body.starts_with('.');

    let hash_pos = find_unescaped(body, '#');
    let (sep_pos, sep_char) = match hash_pos {
        Some(p) => (Some(p), '#'),
        None if is_path_form => match find_unescaped(body, ':') {
            Some(p) => (Some(p), ':'),
            None => (None, '#'),
        },
        None => (None, '#'),
    };

    let (package_raw, script_raw) = match sep_pos {
        Some(p) => (Some(&body[..p]), &body[p + 1..]),
        None => (None, body),
    };

    let package_offset = start;
    let script_offset = match sep_pos {
        Some(p) => start + p + 1,
        None => start,
    };

    let package = match package_raw {
        Some(raw) => Some(classify_package(raw, is_path_form, sep_char == ':', package_offset)?),
        None => None,
    };

    if is_path_form && package.is_none() {
        return Err(SpecifierError::PathMissingScript(input.to_owned()));
    }

    let script = classify_script(script_raw, sep_char, script_offset)?;

    let package_range = match package_raw {
        Some(raw) => package_offset..package_offset + raw.len(),
        None => package_offset..package_offset,
    };
    let script_range = script_offset..script_offset + script_raw.len();

    Ok(ParsedDependency {
        package: package.unwrap_or(Package::This),
        script,
        inverted,
        package_range,
        script_range,
    })
}

/// Find the byte index of the first unescaped occurrence of `target` in `s`.
fn find_unescaped(s: &str, target: char) -> Option<usize> {
    let mut chars = s.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\\' {
            chars.next();
            continue;
        }
        if c == target {
            return Some(i);
        }
    }
    None
}

fn classify_package(raw: &str, is_path_form: bool, legacy_colon: bool, offset: usize) -> Result<Package, SpecifierError> {
    if let Some(kind) = match_special(raw) {
        return Ok(match kind {
            SpecialKind::This => Package::This,
            SpecialKind::Workspaces => Package::Workspaces,
            SpecialKind::Dependencies => Package::Dependencies,
        });
    }
    ensure_no_unterminated_special(raw, offset)?;

    let unescaped = unescape_inner(raw, offset, true, legacy_colon)?;
    if is_path_form {
        Ok(Package::Path(unescaped))
    } else {
        Ok(Package::Npm(unescaped))
    }
}

fn classify_script(raw: &str, sep_char: char, offset: usize) -> Result<Script, SpecifierError> {
    if raw == "<this>" {
        return Ok(Script::This);
    }
    ensure_no_unterminated_special(raw, offset)?;
    let unescaped = unescape_with_colon(raw, offset, sep_char == ':')?;
    Ok(Script::Name(unescaped))
}

fn match_special(raw: &str) -> Option<SpecialKind> {
    SPECIALS.iter().find(|(name, _)| *name == raw).map(|(_, kind)| *kind)
}

/// A raw segment that starts with an unescaped `<` but isn't exactly one of
/// the known specials is a grammar error per spec rule 6.
fn ensure_no_unterminated_special(raw: &str, offset: usize) -> Result<(), SpecifierError> {
    if raw.starts_with('<') {
        return Err(SpecifierError::UnterminatedSpecial(offset));
    }
    Ok(())
}

fn unescape_with_colon(raw: &str, offset: usize, allow_colon: bool) -> Result<String, SpecifierError> {
    unescape_inner(raw, offset, false, allow_colon)
}

fn unescape_inner(raw: &str, offset: usize, allow_leading_bang_dot: bool, allow_colon: bool) -> Result<String, SpecifierError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.char_indices().peekable();
    let mut position = 0usize;
    while let Some((i, c)) = chars.next() {
        if c != '\\' {
            out.push(c);
            position += 1;
            continue;
        }
        match chars.next() {
            None => return Err(SpecifierError::TrailingBackslash(offset + i)),
            Some((_, next)) => match next {
                '\\' | '#' | '<' | '>' => out.push(next),
                '!' | '.' if position == 0 && allow_leading_bang_dot => out.push(next),
                ':' if allow_colon => out.push(next),
                other => return Err(SpecifierError::InvalidEscape(offset + i, other)),
            },
        }
        position += 1;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;

    #[test]
    fn parses_path_form_with_hash() {
        let dep = parse("../foo#build").unwrap();
        assert_eq!(dep.package, Package::Path("../foo".to_string()));
        assert_eq!(dep.script, Script::Name("build".to_string()));
        assert!(!dep.inverted);
    }

    #[test]
    fn parses_legacy_colon_for_path_form() {
        let dep = parse("./foo:build").unwrap();
        assert_eq!(dep.package, Package::Path("./foo".to_string()));
        assert_eq!(dep.script, Script::Name("build".to_string()));
    }

    #[test]
    fn colon_is_literal_for_npm_form() {
        // no leading `.`, so `:` is not a legacy separator; `#` must be used.
        let dep = parse("scope:pkg#build").unwrap();
        assert_eq!(dep.package, Package::Npm("scope:pkg".to_string()));
        assert_eq!(dep.script, Script::Name("build".to_string()));
    }

    #[test]
    fn bare_script_defaults_to_this_package() {
        let dep = parse("lint").unwrap();
        assert_eq!(dep.package, Package::This);
        assert_eq!(dep.script, Script::Name("lint".to_string()));
    }

    #[test]
    fn leading_bang_inverts() {
        let dep = parse("!lint").unwrap();
        assert!(dep.inverted);
        assert_eq!(dep.script, Script::Name("lint".to_string()));
    }

    #[test_case("<this>", SpecialKindTest::This; "this special")]
    #[test_case("<workspaces>", SpecialKindTest::Workspaces; "workspaces special")]
    #[test_case("<dependencies>", SpecialKindTest::Dependencies; "dependencies special")]
    fn parses_specials_as_package(raw: &str, expected: SpecialKindTest) {
        let dep = parse(&format!("{raw}#build")).unwrap();
        let actual = match dep.package {
            Package::This => SpecialKindTest::This,
            Package::Workspaces => SpecialKindTest::Workspaces,
            Package::Dependencies => SpecialKindTest::Dependencies,
            _ => panic!("expected a special package"),
        };
        assert_eq!(actual, expected);
    }

    #[derive(Eq, PartialEq, Debug)]
    enum SpecialKindTest {
        This,
        Workspaces,
        Dependencies,
    }

    #[test]
    fn this_script_special() {
        let dep = parse("../foo#<this>").unwrap();
        assert_eq!(dep.script, Script::This);
    }

    #[test]
    fn escapes_hash_and_backslash() {
        let dep = parse(r"weird\#name#build").unwrap();
        assert_eq!(dep.package, Package::Npm("weird#name".to_string()));
    }

    #[test]
    fn escaped_leading_dot_is_not_path_form() {
        let dep = parse(r"\.hidden#build").unwrap();
        assert_eq!(dep.package, Package::Npm(".hidden".to_string()));
    }

    #[test]
    fn escaped_leading_bang_is_not_inversion() {
        let dep = parse(r"\!urgent#build").unwrap();
        assert!(!dep.inverted);
        assert_eq!(dep.package, Package::Npm("!urgent".to_string()));
    }

    #[test]
    fn trailing_backslash_is_error() {
        assert!(matches!(parse(r"foo\"), Err(SpecifierError::TrailingBackslash(_))));
    }

    #[test]
    fn unterminated_special_is_error() {
        assert!(matches!(parse("<oops#build"), Err(SpecifierError::UnterminatedSpecial(_))));
    }

    #[test]
    fn unknown_bracket_form_is_error() {
        assert!(matches!(parse("<bogus>#build"), Err(SpecifierError::UnterminatedSpecial(_))));
    }

    #[test]
    fn empty_specifier_is_error() {
        assert_eq!(parse(""), Err(SpecifierError::Empty));
    }

    #[test]
    fn path_form_without_script_is_error() {
        assert!(matches!(parse("../foo"), Err(SpecifierError::PathMissingScript(_))));
    }
}
