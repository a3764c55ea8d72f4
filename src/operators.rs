//! Clause operator semantics.
//!
//! Every operator is total: a value of the wrong type, an unparseable
//! date or version, or a bad regex is simply a non-match, never an error.

use crate::models::Op;
use regex::Regex;
use semver::Version;
use serde_json::Value;
use std::cmp::Ordering;

/// Apply a single operator to one user value and one clause value.
///
/// `segmentMatch` is resolved by the evaluator (it needs store access) and
/// always reports false here, as do operators this build does not know.
pub fn apply(op: Op, user_value: &Value, clause_value: &Value) -> bool {
    match op {
        Op::In => in_match(user_value, clause_value),
        Op::StartsWith => string_match(user_value, clause_value, |u, c| u.starts_with(c)),
        Op::EndsWith => string_match(user_value, clause_value, |u, c| u.ends_with(c)),
        Op::Contains => string_match(user_value, clause_value, |u, c| u.contains(c)),
        Op::Matches => regex_match(user_value, clause_value),
        Op::LessThan => numeric_match(user_value, clause_value, |u, c| u < c),
        Op::LessThanOrEqual => numeric_match(user_value, clause_value, |u, c| u <= c),
        Op::GreaterThan => numeric_match(user_value, clause_value, |u, c| u > c),
        Op::GreaterThanOrEqual => numeric_match(user_value, clause_value, |u, c| u >= c),
        Op::Before => time_match(user_value, clause_value, |u, c| u < c),
        Op::After => time_match(user_value, clause_value, |u, c| u > c),
        Op::SemVerEqual => semver_match(user_value, clause_value, |o| o == Ordering::Equal),
        Op::SemVerLessThan => semver_match(user_value, clause_value, |o| o == Ordering::Less),
        Op::SemVerGreaterThan => semver_match(user_value, clause_value, |o| o == Ordering::Greater),
        Op::SegmentMatch | Op::Unknown => false,
    }
}

/// Equality, with integers and floats comparing as numbers.
///
/// Numeric comparison happens in f64, so equality above 2^53 loses
/// precision; every implementation of the protocol shares that loss.
fn in_match(user_value: &Value, clause_value: &Value) -> bool {
    if let (Some(u), Some(c)) = (user_value.as_f64(), clause_value.as_f64()) {
        return u == c;
    }
    user_value == clause_value
}

fn string_match(user_value: &Value, clause_value: &Value, f: fn(&str, &str) -> bool) -> bool {
    match (user_value.as_str(), clause_value.as_str()) {
        (Some(u), Some(c)) => f(u, c),
        _ => false,
    }
}

/// The clause value is a pattern in the `regex` crate's syntax (no
/// look-around); a pattern that fails to compile matches nothing.
fn regex_match(user_value: &Value, clause_value: &Value) -> bool {
    match (user_value.as_str(), clause_value.as_str()) {
        (Some(u), Some(pattern)) => Regex::new(pattern)
            .map(|re| re.is_match(u))
            .unwrap_or(false),
        _ => false,
    }
}

fn numeric_match(user_value: &Value, clause_value: &Value, f: fn(f64, f64) -> bool) -> bool {
    match (user_value.as_f64(), clause_value.as_f64()) {
        (Some(u), Some(c)) => f(u, c),
        _ => false,
    }
}

fn time_match(user_value: &Value, clause_value: &Value, f: fn(f64, f64) -> bool) -> bool {
    match (parse_timestamp(user_value), parse_timestamp(clause_value)) {
        (Some(u), Some(c)) => f(u, c),
        _ => false,
    }
}

/// Timestamps are either RFC 3339 strings or numbers in unix milliseconds.
fn parse_timestamp(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis() as f64),
        _ => None,
    }
}

fn semver_match(user_value: &Value, clause_value: &Value, f: fn(Ordering) -> bool) -> bool {
    match (
        user_value.as_str().and_then(parse_semver),
        clause_value.as_str().and_then(parse_semver),
    ) {
        (Some(u), Some(c)) => f(u.cmp_precedence(&c)),
        _ => false,
    }
}

/// Parse a version, tolerating a missing minor and/or patch component
/// ("2" and "2.1" read as "2.0.0" and "2.1.0", suffixes preserved).
pub(crate) fn parse_semver(s: &str) -> Option<Version> {
    if let Ok(version) = Version::parse(s) {
        return Some(version);
    }
    let numeric_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or_else(|| s.len());
    let (numeric, suffix) = s.split_at(numeric_end);
    let padded = match numeric.chars().filter(|c| *c == '.').count() {
        0 => format!("{}.0.0{}", numeric, suffix),
        1 => format!("{}.0{}", numeric, suffix),
        _ => return None,
    };
    Version::parse(&padded).ok()
}
