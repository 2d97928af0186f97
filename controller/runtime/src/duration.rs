use std::{fmt, str::FromStr, time::Duration};

/// A positive duration parsed from a Go-style string like `10h` or `1m30s`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Period(Duration);

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum ParseError {
    #[error("invalid unit: {}", EXPECTED_UNITS)]
    InvalidUnit,

    #[error("missing a unit: {}", EXPECTED_UNITS)]
    NoUnit,

    #[error("invalid number: {0}")]
    NotANumber(#[from] std::num::ParseFloatError),

    #[error("duration must be positive")]
    NotPositive,

    #[error("duration is out of range")]
    OutOfRange,
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', '\u{00b5}s', 'ms', 's', 'm', or 'h'";

// === impl Period ===

impl From<Period> for Duration {
    fn from(Period(duration): Period) -> Self {
        duration
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl FromStr for Period {
    type Err = ParseError;

    /// Parses the format accepted by Go's `time.ParseDuration`: a sequence of
    /// decimal numbers, each with a unit suffix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with('-') {
            return Err(ParseError::NotPositive);
        }
        let mut rest = s.trim_start_matches('+');
        if rest == "0" {
            return Err(ParseError::NotPositive);
        }

        let mut total = Duration::ZERO;
        while !rest.is_empty() {
            let unit_start = rest
                .find(|c: char| c.is_alphabetic())
                .ok_or(ParseError::NoUnit)?;
            let (val, tail) = rest.split_at(unit_start);
            let unit_end = tail
                .find(|c: char| !c.is_alphabetic())
                .unwrap_or(tail.len());
            let (unit, tail) = tail.split_at(unit_end);
            let base = unit_duration(unit)?;
            let part = match val.parse::<u32>() {
                Ok(n) => base.checked_mul(n).ok_or(ParseError::OutOfRange)?,
                Err(_) => {
                    let val = val.parse::<f64>()?;
                    Duration::try_from_secs_f64(base.as_secs_f64() * val)
                        .map_err(|_| ParseError::OutOfRange)?
                }
            };
            total = total.checked_add(part).ok_or(ParseError::OutOfRange)?;
            rest = tail;
        }

        if total.is_zero() {
            return Err(ParseError::NotPositive);
        }
        Ok(Self(total))
    }
}

fn unit_duration(unit: &str) -> Result<Duration, ParseError> {
    const MINUTE: Duration = Duration::from_secs(60);
    let base = match unit {
        "ns" => Duration::from_nanos(1),
        // U+00B5 is the "micro sign" while U+03BC is "Greek letter mu"
        "us" | "\u{00b5}s" | "\u{03bc}s" => Duration::from_micros(1),
        "ms" => Duration::from_millis(1),
        "s" => Duration::from_secs(1),
        "m" => MINUTE,
        "h" => MINUTE * 60,
        _ => return Err(ParseError::InvalidUnit),
    };
    Ok(base)
}
