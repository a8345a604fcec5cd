//! Version range grammar for catalog resolution.
//!
//! Parses the constraint dialect used by catalog version ranges: comparison
//! operators (`=`, `!=`, `>`, `<`, `>=`, `=>`, `<=`, `=<`, `~`, `~>`, `^`),
//! `v`-prefixed versions, `x`/`X`/`*` wildcards for the minor and patch
//! streams, AND composition via whitespace or commas, and OR composition via
//! `||`. Hyphen ranges, doubled operators, four-part versions, leading
//! zeros, trailing dots, and underscores in metadata are rejected.
//!
//! Matching follows the same dialect: a version that carries a prerelease
//! only matches comparators whose own pattern carries a prerelease.

use std::fmt;

use semver::{Prerelease, Version};

/// Error produced when a range expression does not parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version range {range:?}: {reason}")]
pub struct ConstraintError {
    /// The offending range expression.
    pub range: String,
    /// Human-readable parse failure.
    pub reason: String,
}

/// Comparison operator of a single comparator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Tilde,
    Caret,
}

/// One component of a version pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    /// Concrete numeric component.
    Num(u64),
    /// `x`, `X`, or `*` wildcard.
    Wild,
    /// Component not written, e.g. the patch in `1.2`.
    Absent,
}

impl Part {
    fn num(self) -> u64 {
        match self {
            Part::Num(n) => n,
            Part::Wild | Part::Absent => 0,
        }
    }

    fn is_open(self) -> bool {
        matches!(self, Part::Wild | Part::Absent)
    }
}

/// Version pattern of a comparator, possibly partial or wildcarded.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Pattern {
    major: Part,
    minor: Part,
    patch: Part,
    pre: Prerelease,
}

/// A single `op`+`pattern` comparator.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Comparator {
    op: Op,
    pattern: Pattern,
}

/// A parsed range: OR-composed groups of AND-composed comparators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraints {
    source: String,
    groups: Vec<Vec<Comparator>>,
}

impl fmt::Display for Constraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Constraints {
    /// What: Parse a range expression into its OR/AND comparator groups.
    ///
    /// Inputs:
    /// - `range`: The raw range string, e.g. `">=1.2.3, <2.0.0 || ^3.0.0"`.
    ///
    /// Output:
    /// - `Ok(Constraints)` for well-formed ranges, `Err(ConstraintError)`
    ///   naming the reason otherwise.
    pub fn parse(range: &str) -> Result<Self, ConstraintError> {
        let err = |reason: &str| ConstraintError {
            range: range.to_string(),
            reason: reason.to_string(),
        };
        if range.trim().is_empty() {
            return Err(err("empty range"));
        }
        let mut groups = Vec::new();
        for group_src in range.split("||") {
            let tokens = tokenize(group_src);
            if tokens.is_empty() {
                return Err(err("empty alternative"));
            }
            let mut comparators = Vec::new();
            let mut pending_op: Option<(Op, &str)> = None;
            for token in &tokens {
                if let Some((op, op_src)) = pending_op.take() {
                    let pattern = parse_pattern(token)
                        .map_err(|reason| err(&format!("after {op_src:?}: {reason}")))?;
                    comparators.push(Comparator { op, pattern });
                    continue;
                }
                let (op, rest, op_src) = split_op(token);
                if rest.is_empty() {
                    // Bare operator; the version must follow in the next token.
                    pending_op = Some((op, op_src));
                    continue;
                }
                let pattern = parse_pattern(rest).map_err(|reason| err(&reason))?;
                comparators.push(Comparator { op, pattern });
            }
            if pending_op.is_some() {
                return Err(err("operator without version"));
            }
            groups.push(comparators);
        }
        Ok(Constraints {
            source: range.to_string(),
            groups,
        })
    }

    /// What: Test a concrete version against the range.
    ///
    /// Inputs:
    /// - `version`: Fully parsed semantic version.
    ///
    /// Output:
    /// - `true` when at least one OR group is satisfied by every one of its
    ///   comparators.
    pub fn matches(&self, version: &Version) -> bool {
        self.groups
            .iter()
            .any(|group| group.iter().all(|c| c.matches(version)))
    }
}

/// Split a group on whitespace and commas; commas are pure separators.
fn tokenize(src: &str) -> Vec<String> {
    src.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Peel a leading operator off a token. Two-character operators are tried
/// first so that `>=1.0.0` does not parse as `>` followed by `=1.0.0`.
fn split_op(token: &str) -> (Op, &str, &str) {
    const TWO: &[(&str, Op)] = &[
        (">=", Op::Gte),
        ("=>", Op::Gte),
        ("<=", Op::Lte),
        ("=<", Op::Lte),
        ("!=", Op::Ne),
        ("~>", Op::Tilde),
    ];
    const ONE: &[(&str, Op)] = &[
        (">", Op::Gt),
        ("<", Op::Lt),
        ("=", Op::Eq),
        ("~", Op::Tilde),
        ("^", Op::Caret),
    ];
    for &(src, op) in TWO {
        if let Some(rest) = token.strip_prefix(src) {
            return (op, rest, src);
        }
    }
    for &(src, op) in ONE {
        if let Some(rest) = token.strip_prefix(src) {
            return (op, rest, src);
        }
    }
    (Op::Eq, token, "")
}

/// Parse one version pattern: optional `v` prefix, up to three dot-separated
/// core components (numeric or wildcard), optional prerelease and build.
fn parse_pattern(src: &str) -> Result<Pattern, String> {
    let src = src.strip_prefix('v').unwrap_or(src);
    if src.is_empty() {
        return Err("missing version".to_string());
    }
    // Split off build metadata first, then prerelease.
    let (core_pre, build) = match src.split_once('+') {
        Some((head, build)) => (head, Some(build)),
        None => (src, None),
    };
    if let Some(build) = build {
        validate_identifiers(build, false)
            .map_err(|reason| format!("invalid build metadata {build:?}: {reason}"))?;
    }
    let (core, pre) = match core_pre.split_once('-') {
        Some((head, pre)) => (head, Some(pre)),
        None => (core_pre, None),
    };
    let pre = match pre {
        Some(pre) => {
            validate_identifiers(pre, true)
                .map_err(|reason| format!("invalid prerelease {pre:?}: {reason}"))?;
            Prerelease::new(pre).map_err(|e| format!("invalid prerelease {pre:?}: {e}"))?
        }
        None => Prerelease::EMPTY,
    };
    let raw_parts: Vec<&str> = core.split('.').collect();
    if raw_parts.len() > 3 {
        return Err(format!("too many version components in {core:?}"));
    }
    let mut parts = [Part::Absent; 3];
    for (i, raw) in raw_parts.iter().enumerate() {
        parts[i] = parse_part(raw)?;
    }
    Ok(Pattern {
        major: parts[0],
        minor: parts[1],
        patch: parts[2],
        pre,
    })
}

fn parse_part(raw: &str) -> Result<Part, String> {
    match raw {
        "" => Err("empty version component".to_string()),
        "x" | "X" | "*" => Ok(Part::Wild),
        _ => {
            if raw.len() > 1 && raw.starts_with('0') {
                return Err(format!("leading zero in component {raw:?}"));
            }
            raw.parse::<u64>()
                .map(Part::Num)
                .map_err(|_| format!("invalid version component {raw:?}"))
        }
    }
}

/// Validate dot-separated prerelease/build identifiers: non-empty,
/// `[0-9A-Za-z-]` only, and (for prerelease) no leading zeros in numeric
/// identifiers.
fn validate_identifiers(src: &str, is_prerelease: bool) -> Result<(), String> {
    for ident in src.split('.') {
        if ident.is_empty() {
            return Err("empty identifier".to_string());
        }
        if !ident
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(format!("invalid character in identifier {ident:?}"));
        }
        if is_prerelease
            && ident.len() > 1
            && ident.starts_with('0')
            && ident.chars().all(|c| c.is_ascii_digit())
        {
            return Err(format!("leading zero in numeric identifier {ident:?}"));
        }
    }
    Ok(())
}

impl Pattern {
    /// Lowest version inside the pattern, open components zero-filled.
    fn floor(&self) -> Version {
        let mut v = Version::new(self.major.num(), self.minor.num(), self.patch.num());
        v.pre = self.pre.clone();
        v
    }

    /// First version above the span the pattern covers, or `None` when the
    /// pattern is fully concrete (spans a single version) or fully open.
    fn ceil(&self) -> Option<Version> {
        if self.major.is_open() {
            return None;
        }
        if self.minor.is_open() {
            return Some(Version::new(self.major.num() + 1, 0, 0));
        }
        if self.patch.is_open() {
            return Some(Version::new(self.major.num(), self.minor.num() + 1, 0));
        }
        None
    }

    fn is_concrete(&self) -> bool {
        matches!(
            (self.major, self.minor, self.patch),
            (Part::Num(_), Part::Num(_), Part::Num(_))
        )
    }

    fn any(&self) -> bool {
        self.major.is_open()
    }
}

impl Comparator {
    fn matches(&self, version: &Version) -> bool {
        // Prerelease gate: a prerelease version only matches comparators
        // that themselves mention a prerelease.
        if !version.pre.is_empty() && self.pattern.pre.is_empty() {
            return false;
        }
        let floor = self.pattern.floor();
        let in_span = |v: &Version| {
            if self.pattern.any() {
                return true;
            }
            if self.pattern.is_concrete() {
                return v.cmp_precedence(&floor).is_eq();
            }
            v.cmp_precedence(&floor).is_ge()
                && self
                    .pattern
                    .ceil()
                    .is_none_or(|ceil| v.cmp_precedence(&ceil).is_lt())
        };
        match self.op {
            Op::Eq => in_span(version),
            Op::Ne => !in_span(version),
            Op::Gte => self.pattern.any() || version.cmp_precedence(&floor).is_ge(),
            Op::Lt => !self.pattern.any() && version.cmp_precedence(&floor).is_lt(),
            Op::Gt => {
                if self.pattern.any() {
                    return false;
                }
                if self.pattern.is_concrete() {
                    return version.cmp_precedence(&floor).is_gt();
                }
                // Above the entire wildcard span.
                self.pattern
                    .ceil()
                    .is_some_and(|ceil| version.cmp_precedence(&ceil).is_ge())
            }
            Op::Lte => {
                if self.pattern.any() {
                    return true;
                }
                if self.pattern.is_concrete() {
                    return version.cmp_precedence(&floor).is_le();
                }
                self.pattern
                    .ceil()
                    .is_some_and(|ceil| version.cmp_precedence(&ceil).is_lt())
            }
            Op::Tilde => {
                if self.pattern.any() {
                    return true;
                }
                let ceil = if matches!(self.pattern.minor, Part::Num(_)) {
                    Version::new(self.pattern.major.num(), self.pattern.minor.num() + 1, 0)
                } else {
                    Version::new(self.pattern.major.num() + 1, 0, 0)
                };
                version.cmp_precedence(&floor).is_ge() && version.cmp_precedence(&ceil).is_lt()
            }
            Op::Caret => {
                if self.pattern.any() {
                    return true;
                }
                let ceil = caret_ceiling(&self.pattern);
                version.cmp_precedence(&floor).is_ge() && version.cmp_precedence(&ceil).is_lt()
            }
        }
    }
}

/// Upper bound of a caret range: the next release that may break, per the
/// zero-major rules of SemVer.
fn caret_ceiling(p: &Pattern) -> Version {
    let major = p.major.num();
    if major > 0 {
        return Version::new(major + 1, 0, 0);
    }
    match (p.minor, p.patch) {
        (Part::Num(m), _) if m > 0 => Version::new(0, m + 1, 0),
        (Part::Num(0), Part::Num(pt)) => Version::new(0, 0, pt + 1),
        (Part::Num(0), _) => Version::new(0, 1, 0),
        _ => Version::new(1, 0, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).expect("test version")
    }

    fn ok(range: &str) -> Constraints {
        Constraints::parse(range).expect("range should parse")
    }

    #[test]
    /// What: Accepted operator and wildcard forms parse
    ///
    /// - Input: Representative valid ranges from the admission grammar
    /// - Output: All parse successfully
    fn constraint_accepts_grammar() {
        for range in [
            "1.2.3",
            "=1.2.3",
            "v1.2.3",
            "!=1.2.3",
            ">1.2.3",
            ">=1.2.3",
            "=>1.2.3",
            "<1.2.3",
            "<=1.2.3",
            "=<1.2.3",
            "~1.2.3",
            "~>1.2.3",
            "^1.2.3",
            "1.x",
            "1.X",
            "1.*",
            "1.2.x",
            "1.2.X",
            "1.2.*",
            ">=1.2.3 <2.0.0",
            ">=1.2.3, <2.0.0",
            ">=1.2.3 <2.0.0 || >3.0.0",
            "= 2.1.3",
            "1.0.0-alpha.1",
            "1.0.0+meta-data",
        ] {
            assert!(Constraints::parse(range).is_ok(), "should accept {range}");
        }
    }

    #[test]
    /// What: Rejected forms fail to parse
    ///
    /// - Input: Doubled operators, hyphen range, metadata underscores,
    ///   leading zeros, trailing dot, four-part versions
    /// - Output: Every form is rejected
    fn constraint_rejects_grammar() {
        for range in [
            "<<1.2.3",
            ">>1.2.3",
            ">~1.2.3",
            "==1.2.3",
            "=!1.2.3",
            "!1.2.3",
            "1.0.0 - 2.0.0",
            ">=1.0.0 && <2.0.0",
            "1.0.0;2.0.0",
            "1.2.3-123abc_def",
            "1.1.x+123_456",
            "1.02.3",
            "1.2.3.",
            "1.2.3.4",
            "",
            ">=",
            "|| 1.0.0 ||",
        ] {
            assert!(Constraints::parse(range).is_err(), "should reject {range}");
        }
    }

    #[test]
    /// What: Exact, inequality, and negation comparators
    ///
    /// - Input: Concrete versions against `=`, `!=`, `<`, `>` ranges
    /// - Output: Standard comparison semantics
    fn constraint_basic_ops() {
        assert!(ok("1.2.3").matches(&v("1.2.3")));
        assert!(!ok("1.2.3").matches(&v("1.2.4")));
        assert!(ok("!=1.2.3").matches(&v("1.2.4")));
        assert!(!ok("!=1.2.3").matches(&v("1.2.3")));
        assert!(ok(">1.2.3").matches(&v("1.2.4")));
        assert!(!ok(">1.2.3").matches(&v("1.2.3")));
        assert!(ok("<=1.2.3").matches(&v("1.2.3")));
        assert!(ok(">=1.0.0, <2.0.0").matches(&v("1.9.9")));
        assert!(!ok(">=1.0.0 <2.0.0").matches(&v("2.0.0")));
        assert!(ok(">=1.0.0 <2.0.0 || >=3.0.0").matches(&v("3.1.0")));
    }

    #[test]
    /// What: Wildcard and partial patterns span their stream
    ///
    /// - Input: `1.2.x`, `1.x`, bare `1.2`, `*`
    /// - Output: Floor-inclusive, ceiling-exclusive spans
    fn constraint_wildcards() {
        assert!(ok("1.2.x").matches(&v("1.2.9")));
        assert!(!ok("1.2.x").matches(&v("1.3.0")));
        assert!(ok("1.x").matches(&v("1.9.9")));
        assert!(!ok("1.x").matches(&v("2.0.0")));
        assert!(ok("1.2").matches(&v("1.2.7")));
        assert!(ok("*").matches(&v("42.0.0")));
        assert!(ok(">=1.2.x").matches(&v("1.2.0")));
        assert!(ok(">1.2.x").matches(&v("1.3.0")));
        assert!(!ok(">1.2.x").matches(&v("1.2.9")));
    }

    #[test]
    /// What: Tilde allows patch-level movement only when minor is pinned
    ///
    /// - Input: `~1.2.3`, `~1.2`, `~1`
    /// - Output: Ceilings at next minor (or next major for bare major)
    fn constraint_tilde() {
        assert!(ok("~1.2.3").matches(&v("1.2.9")));
        assert!(!ok("~1.2.3").matches(&v("1.3.0")));
        assert!(ok("~1.2").matches(&v("1.2.0")));
        assert!(!ok("~1.2").matches(&v("1.3.0")));
        assert!(ok("~1").matches(&v("1.9.0")));
        assert!(!ok("~1").matches(&v("2.0.0")));
        assert!(ok("~>1.2.3").matches(&v("1.2.4")));
    }

    #[test]
    /// What: Caret honors zero-major SemVer rules
    ///
    /// - Input: `^1.2.3`, `^0.2.3`, `^0.0.3`, `^0.0`, `^0`
    /// - Output: Ceilings at the first potentially-breaking release
    fn constraint_caret() {
        assert!(ok("^1.2.3").matches(&v("1.9.0")));
        assert!(!ok("^1.2.3").matches(&v("2.0.0")));
        assert!(ok("^0.2.3").matches(&v("0.2.9")));
        assert!(!ok("^0.2.3").matches(&v("0.3.0")));
        assert!(ok("^0.0.3").matches(&v("0.0.3")));
        assert!(!ok("^0.0.3").matches(&v("0.0.4")));
        assert!(ok("^0.0").matches(&v("0.0.9")));
        assert!(!ok("^0.0").matches(&v("0.1.0")));
        assert!(ok("^0").matches(&v("0.9.9")));
        assert!(!ok("^0").matches(&v("1.0.0")));
    }

    #[test]
    /// What: Prerelease versions only match prerelease-bearing comparators
    ///
    /// - Input: `>=1.0.0` and `>=1.0.0-alpha` against `1.2.0-beta`
    /// - Output: Gate blocks the former, admits the latter
    fn constraint_prerelease_gate() {
        assert!(!ok(">=1.0.0").matches(&v("1.2.0-beta")));
        assert!(ok(">=1.0.0-alpha").matches(&v("1.2.0-beta")));
        assert!(ok("1.0.0-alpha").matches(&v("1.0.0-alpha")));
        assert!(!ok("1.0.0-alpha").matches(&v("1.0.0")));
    }
}
