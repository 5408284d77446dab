//! Version directory matching for verlay.
//! verlay 的版本目錄比對。
//!
//! Version directories are named after semantic versions, optionally with a
//! leading `v` (`v1.2.0`). Requests use npm-style range syntax: a bare version
//! matches exactly, a partial one is an X-range (`1.2` is `1.2.x`),
//! comparators may be joined by spaces or commas (`>=1.0 <2.0`), `A - B` is an
//! inclusive range, and alternatives are joined with `||`.
//! 版本目錄以語意化版本命名（可帶 `v` 前綴）。查詢使用 npm 風格的範圍語法：單一版本為精確比對，
//! 比較子可用空白或逗號分隔，`A - B` 為含端點的區間，並可用 `||` 串接多個選項。

use std::cmp::Ordering;
use std::fmt;

use semver::{Version, VersionReq};
use thiserror::Error;
use tracing::warn;

/// Errors raised while parsing a version range.
/// 解析版本範圍時可能發生的錯誤。
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolverError {
    #[error("version range cannot be empty")]
    EmptyRange,
    #[error("invalid version range '{range}': {reason}")]
    InvalidRange { range: String, reason: String },
}

/// Parses a version directory name such as `v0.0.1` or `=1.2.3`.
/// 解析版本目錄名稱，例如 `v0.0.1` 或 `=1.2.3`。
pub fn parse_version(name: &str) -> Option<Version> {
    let trimmed = name.trim();
    let trimmed = trimmed.strip_prefix('=').unwrap_or(trimmed);
    let trimmed = trimmed
        .strip_prefix(|ch: char| ch == 'v' || ch == 'V')
        .unwrap_or(trimmed);
    Version::parse(trimmed).ok()
}

/// Orders version names highest first. Names that are not semantic versions
/// sort after every valid one, in reverse lexical order.
/// 依版本由高至低排序；非語意化版本的名稱排在最後，並以字典序反向排列。
pub fn compare_desc(a: &str, b: &str) -> Ordering {
    match (parse_version(a), parse_version(b)) {
        (Some(left), Some(right)) => right.cmp(&left).then_with(|| b.cmp(a)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b.cmp(a),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Alternative {
    Exact(Version),
    Requirement(VersionReq),
}

impl Alternative {
    fn matches(&self, version: &Version) -> bool {
        match self {
            Alternative::Exact(expected) => expected == version,
            Alternative::Requirement(req) => req.matches(version),
        }
    }
}

/// A parsed version request.
/// 已解析的版本範圍。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    source: String,
    alternatives: Vec<Alternative>,
}

impl VersionRange {
    pub fn parse(spec: &str) -> Result<Self, ResolverError> {
        let source = spec.trim();
        if source.is_empty() {
            return Err(ResolverError::EmptyRange);
        }
        let mut alternatives = Vec::new();
        for part in source.split("||") {
            let part = part.trim();
            if part.is_empty() {
                return Err(ResolverError::InvalidRange {
                    range: source.to_string(),
                    reason: "empty alternative".to_string(),
                });
            }
            let alternative = match parse_version(part) {
                Some(version) => Alternative::Exact(version),
                None => VersionReq::parse(&to_requirement(part))
                    .map(Alternative::Requirement)
                    .map_err(|err| ResolverError::InvalidRange {
                        range: source.to_string(),
                        reason: err.to_string(),
                    })?,
            };
            alternatives.push(alternative);
        }
        Ok(Self {
            source: source.to_string(),
            alternatives,
        })
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives
            .iter()
            .any(|alternative| alternative.matches(version))
    }

    /// Returns true when `name` parses as a version inside this range.
    pub fn matches_name(&self, name: &str) -> bool {
        parse_version(name).is_some_and(|version| self.matches(&version))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Rewrites one npm-style alternative into `semver` requirement syntax.
/// 將單一 npm 風格的範圍改寫為 `semver` 需求語法。
fn to_requirement(part: &str) -> String {
    let words: Vec<&str> = part.split_whitespace().collect();
    if let [low, "-", high] = words.as_slice() {
        return format!(">={}, <={}", strip_v(low), strip_v(high));
    }

    let mut comparators = Vec::new();
    let mut pending = String::new();
    let tokens = part
        .split(|ch: char| ch == ',' || ch.is_whitespace())
        .filter(|token| !token.is_empty());
    for token in tokens {
        let split = token
            .find(|ch: char| !is_operator(ch))
            .unwrap_or(token.len());
        let (op, operand) = token.split_at(split);
        pending.push_str(op);
        if operand.is_empty() {
            continue;
        }
        let operand = strip_v(operand);
        if pending.is_empty() && !is_wildcard(operand) {
            pending.push('=');
        }
        comparators.push(format!("{pending}{operand}"));
        pending.clear();
    }
    if !pending.is_empty() {
        comparators.push(pending);
    }
    comparators.join(", ")
}

fn is_operator(ch: char) -> bool {
    matches!(ch, '<' | '>' | '=' | '~' | '^')
}

fn is_wildcard(operand: &str) -> bool {
    operand
        .split('.')
        .any(|component| matches!(component, "*" | "x" | "X"))
}

fn strip_v(operand: &str) -> &str {
    operand
        .strip_prefix(|ch: char| ch == 'v' || ch == 'V')
        .unwrap_or(operand)
}

/// The version identifiers available on disk, highest first.
/// 磁碟上可用的版本識別碼，由高至低排列。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionSet {
    names: Vec<String>,
}

impl VersionSet {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort_by(|a, b| compare_desc(a, b));
        names.dedup();
        Self { names }
    }

    pub fn versions(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|candidate| candidate == name)
    }

    /// Finds the highest version satisfying `spec`.
    /// 尋找符合 `spec` 的最高版本。
    ///
    /// An absent or blank spec is not a request for any version and yields
    /// `None`, as does a spec that cannot be parsed (logged as a warning).
    pub fn find(&self, spec: Option<&str>) -> Option<&str> {
        let spec = spec.map(str::trim).filter(|spec| !spec.is_empty())?;
        match VersionRange::parse(spec) {
            Ok(range) => self.find_in(&range),
            Err(err) => {
                warn!(target: "verlay::resolver", error = %err, "ignoring unusable version range");
                None
            }
        }
    }

    pub fn find_in(&self, range: &VersionRange) -> Option<&str> {
        self.names
            .iter()
            .find(|name| range.matches_name(name))
            .map(String::as_str)
    }

    /// Every version inside `range`, highest first.
    pub fn matching<'a>(&'a self, range: &'a VersionRange) -> impl Iterator<Item = &'a str> + 'a {
        self.names
            .iter()
            .filter(move |name| range.matches_name(name))
            .map(String::as_str)
    }
}
