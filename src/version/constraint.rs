//! Version constraint parsing and matching.
//!
//! Supported syntax:
//!
//! | Input | Meaning |
//! |---|---|
//! | `1.2.3`, `=1.2.3`, `v1.2.3` | exactly that version |
//! | `>1.2.3`, `>=1.2`, `<2`, `<=1.4` | comparator, partial versions allowed |
//! | `^1.2.3` | `>=1.2.3 <2.0.0` (`^0.2.3` → `<0.3.0`, `^0.0.3` → `<0.0.4`) |
//! | `~1.2.3` | `>=1.2.3 <1.3.0` |
//! | `*`, `x`, empty, `1.x`, `1.2.*` | wildcards |
//! | `1.0.0 - 2.0.0` | inclusive range |
//! | `>=1.0.0 <2.0.0` | conjunction |
//! | `^1.0.0 \|\| ^2.0.0` | disjunction |
//!
//! Pre-release versions only match when a comparator in the same set names a
//! pre-release on the same `major.minor.patch`, or when the caller opts in.

use std::cmp::Ordering;
use std::fmt;

use semver::{BuildMetadata, Prerelease, Version};

use super::PackageVersion;
use crate::error::PackageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Comparator {
    op: Op,
    version: Version,
}

impl Comparator {
    fn new(op: Op, version: Version) -> Self {
        Self { op, version }
    }

    fn matches(&self, v: &Version) -> bool {
        let ord = precedence(v, &self.version);
        match self.op {
            Op::Eq => ord == Ordering::Equal,
            Op::Gt => ord == Ordering::Greater,
            Op::Gte => ord != Ordering::Less,
            Op::Lt => ord == Ordering::Less,
            Op::Lte => ord != Ordering::Greater,
        }
    }
}

/// Build metadata never takes part in matching.
fn precedence(a: &Version, b: &Version) -> Ordering {
    (a.major, a.minor, a.patch)
        .cmp(&(b.major, b.minor, b.patch))
        .then_with(|| a.pre.cmp(&b.pre))
}

/// A parsed version constraint. Parsing is the only fallible step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    raw: String,
    /// Disjunction of conjunctions. An empty conjunction matches any stable release.
    sets: Vec<Vec<Comparator>>,
}

impl VersionConstraint {
    pub fn parse(input: &str) -> Result<Self, PackageError> {
        let raw = input.trim().to_string();
        let mut sets = Vec::new();
        for alternative in raw.split("||") {
            let set = parse_set(alternative.trim()).map_err(|reason| {
                PackageError::MalformedConstraint {
                    constraint: input.to_string(),
                    reason,
                }
            })?;
            sets.push(set);
        }
        Ok(Self { raw, sets })
    }

    /// Matches every stable release.
    pub fn any() -> Self {
        Self {
            raw: "*".to_string(),
            sets: vec![Vec::new()],
        }
    }

    /// Matches exactly `version`.
    pub fn exact(version: &Version) -> Self {
        Self {
            raw: version.to_string(),
            sets: vec![vec![Comparator::new(Op::Eq, version.clone())]],
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_any(&self) -> bool {
        self.sets.iter().any(|set| set.is_empty())
    }

    /// True when some comparator explicitly names a pre-release tag.
    pub fn names_prerelease(&self) -> bool {
        self.sets
            .iter()
            .flatten()
            .any(|c| !c.version.pre.is_empty() && c.version.pre.as_str() != "0")
    }

    /// Whether `version` satisfies the constraint, excluding pre-releases
    /// that the constraint does not name.
    pub fn satisfies(&self, version: &PackageVersion) -> bool {
        self.satisfies_with(version, false)
    }

    pub fn satisfies_with(&self, version: &PackageVersion, include_prerelease: bool) -> bool {
        match version {
            PackageVersion::Semver(v) => self
                .sets
                .iter()
                .any(|set| set_matches(set, v, include_prerelease)),
            PackageVersion::Ref(r) => self.is_any() || self.raw == *r,
        }
    }

    /// Highest candidate satisfying the constraint.
    pub fn pick_best<'a>(
        &self,
        candidates: &'a [PackageVersion],
        include_prerelease: bool,
    ) -> Option<&'a PackageVersion> {
        self.select(candidates, |v| v, include_prerelease)
    }

    /// Like [`pick_best`](Self::pick_best) over arbitrary items carrying a version.
    pub fn select<'a, T, F>(
        &self,
        candidates: &'a [T],
        version_of: F,
        include_prerelease: bool,
    ) -> Option<&'a T>
    where
        F: Fn(&T) -> &PackageVersion,
    {
        candidates
            .iter()
            .filter(|c| self.satisfies_with(version_of(c), include_prerelease))
            .max_by(|a, b| version_of(a).cmp(version_of(b)))
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.raw.is_empty() {
            write!(f, "*")
        } else {
            write!(f, "{}", self.raw)
        }
    }
}

fn set_matches(set: &[Comparator], v: &Version, include_prerelease: bool) -> bool {
    if !set.iter().all(|c| c.matches(v)) {
        return false;
    }
    if v.pre.is_empty() || include_prerelease {
        return true;
    }
    // A pre-release only matches if the set names a pre-release of the same triple.
    set.iter().any(|c| {
        !c.version.pre.is_empty()
            && c.version.major == v.major
            && c.version.minor == v.minor
            && c.version.patch == v.patch
    })
}

const OPERATORS: [&str; 8] = [">=", "<=", "~>", ">", "<", "=", "^", "~"];

fn parse_set(input: &str) -> Result<Vec<Comparator>, String> {
    let tokens: Vec<&str> = input.split_whitespace().collect();
    if tokens.is_empty() {
        return Ok(Vec::new());
    }

    if tokens.len() == 3 && tokens[1] == "-" {
        let low = parse_partial(tokens[0])?;
        let high = parse_partial(tokens[2])?;
        let mut set = desugar(Op::Gte, &low)?;
        set.extend(desugar(Op::Lte, &high)?);
        return Ok(set);
    }

    // Glue a bare operator to the version that follows it (`>= 1.2.0`).
    let mut glued = Vec::new();
    let mut pending: Option<&str> = None;
    for token in tokens {
        if OPERATORS.contains(&token) {
            if pending.is_some() {
                return Err(format!("dangling operator before '{}'", token));
            }
            pending = Some(token);
        } else if let Some(op) = pending.take() {
            glued.push(format!("{}{}", op, token));
        } else {
            glued.push(token.to_string());
        }
    }
    if let Some(op) = pending {
        return Err(format!("operator '{}' is missing a version", op));
    }

    let mut set = Vec::new();
    for token in glued {
        set.extend(parse_comparator(&token)?);
    }
    Ok(set)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Range {
    Exact,
    Caret,
    Tilde,
    Cmp(Op),
}

fn parse_comparator(token: &str) -> Result<Vec<Comparator>, String> {
    let (range, rest) = if let Some(rest) = token.strip_prefix(">=") {
        (Range::Cmp(Op::Gte), rest)
    } else if let Some(rest) = token.strip_prefix("<=") {
        (Range::Cmp(Op::Lte), rest)
    } else if let Some(rest) = token.strip_prefix("~>") {
        (Range::Tilde, rest)
    } else if let Some(rest) = token.strip_prefix('>') {
        (Range::Cmp(Op::Gt), rest)
    } else if let Some(rest) = token.strip_prefix('<') {
        (Range::Cmp(Op::Lt), rest)
    } else if let Some(rest) = token.strip_prefix('=') {
        (Range::Exact, rest)
    } else if let Some(rest) = token.strip_prefix('^') {
        (Range::Caret, rest)
    } else if let Some(rest) = token.strip_prefix('~') {
        (Range::Tilde, rest)
    } else {
        (Range::Exact, token)
    };

    let partial = parse_partial(rest.trim())?;
    match range {
        Range::Exact => desugar(Op::Eq, &partial),
        Range::Cmp(op) => desugar(op, &partial),
        Range::Caret => caret(&partial),
        Range::Tilde => tilde(&partial),
    }
}

/// A version with optional (wildcard) components.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Partial {
    major: Option<u64>,
    minor: Option<u64>,
    patch: Option<u64>,
    pre: Prerelease,
}

impl Partial {
    fn floor(&self) -> Version {
        Version {
            major: self.major.unwrap_or(0),
            minor: self.minor.unwrap_or(0),
            patch: self.patch.unwrap_or(0),
            pre: self.pre.clone(),
            build: BuildMetadata::EMPTY,
        }
    }
}

fn parse_partial(input: &str) -> Result<Partial, String> {
    if input.is_empty() {
        return Err("missing version".to_string());
    }
    let input = input
        .strip_prefix('v')
        .or_else(|| input.strip_prefix('V'))
        .unwrap_or(input);
    // Build metadata is ignored for matching.
    let input = input.split('+').next().unwrap_or(input);
    let (core, pre) = match input.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (input, None),
    };

    let parts: Vec<&str> = core.split('.').collect();
    if parts.len() > 3 {
        return Err(format!("too many components in '{}'", input));
    }

    let mut numbers = [None, None, None];
    let mut wildcard_seen = false;
    for (i, part) in parts.iter().enumerate() {
        if matches!(*part, "x" | "X" | "*") {
            wildcard_seen = true;
            continue;
        }
        if wildcard_seen {
            // `1.x.3` is treated as `1.x`
            continue;
        }
        let n = part
            .parse::<u64>()
            .map_err(|_| format!("invalid version component '{}' in '{}'", part, input))?;
        numbers[i] = Some(n);
    }

    let pre = match pre {
        Some(p) => {
            if numbers.iter().any(Option::is_none) {
                return Err(format!(
                    "pre-release tag requires a full version in '{}'",
                    input
                ));
            }
            Prerelease::new(p).map_err(|e| format!("invalid pre-release '{}': {}", p, e))?
        }
        None => Prerelease::EMPTY,
    };

    Ok(Partial {
        major: numbers[0],
        minor: numbers[1],
        patch: numbers[2],
        pre,
    })
}

/// `major.minor.patch-0`, the lowest version of that triple.
fn lowest(major: u64, minor: u64, patch: u64) -> Version {
    Version {
        major,
        minor,
        patch,
        pre: Prerelease::new("0").unwrap_or(Prerelease::EMPTY),
        build: BuildMetadata::EMPTY,
    }
}

fn nothing() -> Vec<Comparator> {
    vec![Comparator::new(Op::Lt, lowest(0, 0, 0))]
}

/// The component after `n`; the largest `u64` has no successor to bound a range with.
fn next(n: u64) -> Result<u64, String> {
    n.checked_add(1)
        .ok_or_else(|| format!("version component {} is too large", n))
}

fn desugar(op: Op, p: &Partial) -> Result<Vec<Comparator>, String> {
    let Some(major) = p.major else {
        return Ok(match op {
            Op::Gt | Op::Lt => nothing(),
            _ => Vec::new(),
        });
    };

    Ok(match (p.minor, p.patch) {
        (Some(_), Some(_)) => vec![Comparator::new(op, p.floor())],
        (Some(minor), None) => match op {
            Op::Eq => vec![
                Comparator::new(Op::Gte, p.floor()),
                Comparator::new(Op::Lt, lowest(major, next(minor)?, 0)),
            ],
            Op::Gt => vec![Comparator::new(Op::Gte, Version::new(major, next(minor)?, 0))],
            Op::Gte => vec![Comparator::new(Op::Gte, p.floor())],
            Op::Lt => vec![Comparator::new(Op::Lt, lowest(major, minor, 0))],
            Op::Lte => vec![Comparator::new(Op::Lt, lowest(major, next(minor)?, 0))],
        },
        (None, _) => match op {
            Op::Eq => vec![
                Comparator::new(Op::Gte, p.floor()),
                Comparator::new(Op::Lt, lowest(next(major)?, 0, 0)),
            ],
            Op::Gt => vec![Comparator::new(Op::Gte, Version::new(next(major)?, 0, 0))],
            Op::Gte => vec![Comparator::new(Op::Gte, p.floor())],
            Op::Lt => vec![Comparator::new(Op::Lt, lowest(major, 0, 0))],
            Op::Lte => vec![Comparator::new(Op::Lt, lowest(next(major)?, 0, 0))],
        },
    })
}

fn caret(p: &Partial) -> Result<Vec<Comparator>, String> {
    let Some(major) = p.major else {
        return Ok(Vec::new());
    };
    let upper = match (major, p.minor, p.patch) {
        (0, None, _) => lowest(1, 0, 0),
        (0, Some(minor), None) => lowest(0, next(minor)?, 0),
        (0, Some(0), Some(patch)) => lowest(0, 0, next(patch)?),
        (0, Some(minor), Some(_)) => lowest(0, next(minor)?, 0),
        (major, _, _) => lowest(next(major)?, 0, 0),
    };
    Ok(vec![
        Comparator::new(Op::Gte, p.floor()),
        Comparator::new(Op::Lt, upper),
    ])
}

fn tilde(p: &Partial) -> Result<Vec<Comparator>, String> {
    let Some(major) = p.major else {
        return Ok(Vec::new());
    };
    let upper = match p.minor {
        Some(minor) => lowest(major, next(minor)?, 0),
        None => lowest(next(major)?, 0, 0),
    };
    Ok(vec![
        Comparator::new(Op::Gte, p.floor()),
        Comparator::new(Op::Lt, upper),
    ])
}
