//! Parses durations written in Go's `time.Duration` format, as found in
//! ServiceProfile timeouts and retry budget TTLs (e.g. `300ms`, `1m30s`).

use std::time::Duration;

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("empty duration")]
    Empty,

    #[error("negative durations are not supported")]
    Negative,

    #[error("missing a unit: {}", EXPECTED_UNITS)]
    NoUnit,

    #[error("invalid unit {0:?}: {expected}", expected = EXPECTED_UNITS)]
    InvalidUnit(String),

    #[error("invalid number: {0}")]
    NotANumber(#[from] std::num::ParseFloatError),
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', '\u{00b5}s', 'ms', 's', 'm', or 'h'";

pub fn parse(s: &str) -> Result<Duration, ParseError> {
    let s = s.trim();
    let mut rest = s.strip_prefix('+').unwrap_or(s);
    if rest.starts_with('-') {
        return Err(ParseError::Negative);
    }
    if rest.is_empty() {
        return Err(ParseError::Empty);
    }
    if rest == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let unit_at = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or(ParseError::NoUnit)?;
        let (value, tail) = rest.split_at(unit_at);
        let value = value.parse::<f64>()?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        total += unit_base(unit)?.mul_f64(value);
        rest = tail;
    }

    Ok(total)
}

fn unit_base(unit: &str) -> Result<Duration, ParseError> {
    let base = match unit {
        "ns" => Duration::from_nanos(1),
        // U+00B5 is the micro sign; U+03BC is the Greek letter mu.
        "us" | "\u{00b5}s" | "\u{03bc}s" => Duration::from_micros(1),
        "ms" => Duration::from_millis(1),
        "s" => Duration::from_secs(1),
        "m" => Duration::from_secs(60),
        "h" => Duration::from_secs(60 * 60),
        _ => return Err(ParseError::InvalidUnit(unit.to_string())),
    };
    Ok(base)
}
