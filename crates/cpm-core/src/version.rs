//! Version algebra for packet versions.
//!
//! Versions are dotted segment sequences. Each segment has a base (alternating
//! numeric and textual runs) and optional `-`-separated qualifier tokens that
//! map to a stage rank (`alpha` < `beta` < `rc` < unqualified < `stable` <
//! `final`). Ordering is total: `compare` and `VersionKey` agree by
//! construction, and `latest` resolves through the same key.

use std::cmp::Ordering;

use crate::errors::{CpmError, CpmResult};

/// Stage rank assigned to a segment without any qualifier.
const STAGE_NONE: u32 = 50;

fn stage_rank(token: &str) -> Option<u32> {
    match token {
        "dev" | "snapshot" | "nightly" => Some(0),
        "a" | "alpha" => Some(10),
        "b" | "beta" => Some(20),
        "pre" | "preview" => Some(30),
        "rc" | "candidate" => Some(40),
        "stable" | "release" | "ga" => Some(90),
        "final" => Some(100),
        _ => None,
    }
}

/// One run of a segment base: numeric runs order before textual runs.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Num(u64),
    Text(String),
}

impl Ord for Token {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Token::Num(a), Token::Num(b)) => a.cmp(b),
            (Token::Text(a), Token::Text(b)) => a.cmp(b),
            (Token::Num(_), Token::Text(_)) => Ordering::Less,
            (Token::Text(_), Token::Num(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for Token {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Sortable key for one segment: base runs, stage rank, stage number, extras.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SegmentKey {
    base: Vec<Token>,
    stage: u32,
    stage_num: u64,
    extra: Vec<Token>,
}

/// Sortable key for a whole version. Shorter prefixes order before longer ones.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct VersionKey(Vec<SegmentKey>);

fn tokenize(s: &str) -> Vec<Token> {
    let mut out = Vec::new();
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let start = i;
        if bytes[i].is_ascii_digit() {
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            let run = &s[start..i];
            // Very long digit runs saturate instead of failing the parse.
            out.push(Token::Num(run.parse::<u64>().unwrap_or(u64::MAX)));
        } else {
            while i < bytes.len() && !bytes[i].is_ascii_digit() {
                i += 1;
            }
            out.push(Token::Text(s[start..i].to_lowercase()));
        }
    }
    out
}

fn qualifier_key(qualifiers: &[&str]) -> (u32, u64, Vec<Token>) {
    if qualifiers.is_empty() {
        return (STAGE_NONE, 0, Vec::new());
    }
    let mut flat: Vec<Token> = Vec::new();
    for q in qualifiers {
        flat.extend(tokenize(q));
    }

    let mut stage: Option<u32> = None;
    let mut stage_num: u64 = 0;
    let mut consumed_num = false;
    let mut extra: Vec<Token> = Vec::new();

    for token in flat {
        match &token {
            Token::Text(text) if stage.is_none() => {
                if let Some(rank) = stage_rank(text) {
                    stage = Some(rank);
                    continue;
                }
                extra.push(token);
            }
            Token::Num(n) if stage.is_some() && !consumed_num => {
                stage_num = *n;
                consumed_num = true;
            }
            _ => extra.push(token),
        }
    }

    (stage.unwrap_or(STAGE_NONE), stage_num, extra)
}

fn segment_key(segment: &str) -> SegmentKey {
    let mut pieces = segment.split('-').filter(|p| !p.is_empty());
    let base = pieces.next().unwrap_or("");
    let qualifiers: Vec<&str> = pieces.collect();
    let (stage, stage_num, extra) = qualifier_key(&qualifiers);
    SegmentKey {
        base: tokenize(base),
        stage,
        stage_num,
        extra,
    }
}

fn sanitize_segment(segment: &str) -> String {
    let replaced: String = segment
        .trim()
        .chars()
        .map(|c| match c {
            '\\' | '/' => '-',
            c if c.is_ascii_alphanumeric() => c,
            '.' | '_' | '-' | '+' | '@' => c,
            _ => '-',
        })
        .collect();
    replaced.trim_matches('-').to_string()
}

/// Split a version into sanitized dot segments.
///
/// Characters outside `[A-Za-z0-9._\-+@]` are replaced by `-`; empty segments
/// are dropped. Fails when the input is empty or sanitizes to nothing.
pub fn parts(version: &str) -> CpmResult<Vec<String>> {
    let v = version.trim();
    if v.is_empty() {
        return Err(CpmError::invalid_version("empty version"));
    }
    let segments: Vec<String> = v
        .split('.')
        .map(sanitize_segment)
        .filter(|s| !s.is_empty())
        .collect();
    if segments.is_empty() {
        return Err(CpmError::invalid_version(format!(
            "invalid version after sanitization: {v:?}"
        )));
    }
    Ok(segments)
}

/// Build the sortable key for a version string.
pub fn key(version: &str) -> VersionKey {
    let segments: Vec<SegmentKey> = version
        .trim()
        .split('.')
        .filter(|s| !s.is_empty())
        .map(segment_key)
        .collect();
    VersionKey(segments)
}

/// Three-way comparison of two version strings.
pub fn compare(a: &str, b: &str) -> Ordering {
    if a.trim() == b.trim() {
        return Ordering::Equal;
    }
    key(a).cmp(&key(b))
}

/// Normalize a `latest` request: trims, maps case-insensitive `latest` to the
/// canonical spelling, and maps blank input to `None`.
pub fn normalize_latest(version: Option<&str>) -> Option<String> {
    let v = version?.trim();
    if v.is_empty() {
        return None;
    }
    if v.eq_ignore_ascii_case("latest") {
        return Some("latest".to_string());
    }
    Some(v.to_string())
}

/// Greatest version of a slice by the version key.
pub fn latest<'a>(versions: &'a [String]) -> Option<&'a str> {
    versions
        .iter()
        .max_by(|a, b| compare(a, b))
        .map(|s| s.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_sanitizes() {
        assert_eq!(parts("1.2.0").unwrap(), vec!["1", "2", "0"]);
        assert_eq!(parts("1.2.0-rc1").unwrap(), vec!["1", "2", "0-rc1"]);
        assert_eq!(parts("1..2").unwrap(), vec!["1", "2"]);
        assert_eq!(parts("a b.2").unwrap(), vec!["a-b", "2"]);
    }

    #[test]
    fn parts_rejects_empty() {
        assert!(parts("").is_err());
        assert!(parts("   ").is_err());
        assert!(parts("...").is_err());
    }

    #[test]
    fn numeric_segments_order() {
        assert_eq!(compare("1.10.0", "1.9.0"), Ordering::Greater);
        assert_eq!(compare("1.2.0", "1.2.0"), Ordering::Equal);
        assert_eq!(compare("0.9.0", "1.0.0"), Ordering::Less);
    }

    #[test]
    fn shorter_prefix_is_less() {
        assert_eq!(compare("1.2", "1.2.0"), Ordering::Less);
    }

    #[test]
    fn qualifier_stages() {
        assert_eq!(compare("1.2.0-rc1", "1.2.0"), Ordering::Less);
        assert_eq!(compare("1.2.0", "1.2.0-final"), Ordering::Less);
        assert_eq!(compare("1.2.0-alpha", "1.2.0-beta"), Ordering::Less);
        assert_eq!(compare("1.2.0-beta", "1.2.0-rc1"), Ordering::Less);
        assert_eq!(compare("1.2.0-rc1", "1.2.0-rc2"), Ordering::Less);
        assert_eq!(compare("1.2.0-stable", "1.2.0-final"), Ordering::Less);
        assert_eq!(compare("1.2.0-dev", "1.2.0-alpha"), Ordering::Less);
    }

    #[test]
    fn numeric_run_orders_before_textual() {
        assert_eq!(compare("1.2.a", "1.2.3"), Ordering::Greater);
    }

    #[test]
    fn antisymmetry_and_transitivity_sample() {
        let vs = ["0.9.0", "1.0.0", "1.2.0-rc1", "1.2.0", "1.2.0-final", "1.10.0"];
        for a in vs {
            for b in vs {
                let ab = compare(a, b);
                let ba = compare(b, a);
                assert_eq!(ab, ba.reverse(), "{a} vs {b}");
            }
        }
        let mut sorted: Vec<&str> = vs.to_vec();
        sorted.sort_by(|a, b| compare(a, b));
        assert_eq!(
            sorted,
            vec!["0.9.0", "1.0.0", "1.2.0-rc1", "1.2.0", "1.2.0-final", "1.10.0"]
        );
    }

    #[test]
    fn normalize_latest_variants() {
        assert_eq!(normalize_latest(Some("LATEST")).as_deref(), Some("latest"));
        assert_eq!(normalize_latest(Some(" 1.0 ")).as_deref(), Some("1.0"));
        assert_eq!(normalize_latest(Some("")), None);
        assert_eq!(normalize_latest(None), None);
    }

    #[test]
    fn latest_picks_greatest() {
        let versions: Vec<String> = ["1.0.0", "1.2.0", "1.2.0-rc1"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(latest(&versions), Some("1.2.0"));
    }
}
