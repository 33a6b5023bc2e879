//! Executor version negotiation.
//!
//! Executors report their build version when they dequeue. Anything at or
//! above the configured gate receives the v2 job payload. Three shapes are
//! understood:
//!
//! - development builds (`dev`, `0.0.0+dev`), always supported
//! - insiders builds (`<build>_<YYYY-MM-DD>_<sha>`), compared by date
//! - semantic versions, parsed leniently (`v` prefix, missing minor/patch)

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use semver::Version;

use crate::config::VersionGate;

const INVALID_SEMVER: &str = "Invalid Semantic Version";

static INSIDERS_BUILD: LazyLock<Regex> = LazyLock::new(|| {
    // SAFETY: constant pattern
    Regex::new(r"^\d+_(\d{4}-\d{2}-\d{2})_(\d+\.\d+-)?[a-z0-9]{7,}(_patch)?$")
        .expect("insiders build pattern is valid")
});

fn is_dev_version(version: &str) -> bool {
    version == "dev" || version == "0.0.0+dev"
}

/// Parse a version the way executors report it, tolerating a `v` prefix and
/// a missing minor or patch component.
pub fn parse_lenient(version: &str) -> Result<Version, String> {
    let trimmed = version.strip_prefix('v').unwrap_or(version);

    let split_at = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(split_at);

    let parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty()
        || parts.len() > 3
        || parts
            .iter()
            .any(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()))
    {
        return Err(INVALID_SEMVER.to_string());
    }

    let mut padded = parts.join(".");
    for _ in parts.len()..3 {
        padded.push_str(".0");
    }
    padded.push_str(suffix);

    Version::parse(&padded).map_err(|_| INVALID_SEMVER.to_string())
}

/// Report whether `version` satisfies the gate.
///
/// Returns an error only when the version cannot be interpreted at all; an
/// old but well-formed version yields `Ok(false)`.
pub fn check_version(version: &str, gate: &VersionGate) -> Result<bool, String> {
    if is_dev_version(version) {
        return Ok(true);
    }

    if let Some(caps) = INSIDERS_BUILD.captures(version) {
        let date = NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d")
            .map_err(|e| format!("invalid build date: {e}"))?;
        return Ok(date >= gate.min_insiders_date);
    }

    let min = parse_lenient(&gate.min_version)?;
    let actual = parse_lenient(version)?;
    Ok(actual >= min)
}
