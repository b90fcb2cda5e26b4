//! # Duration Validation
//!
//! Parses the duration strings used for `ttl` and `expiryOffset`.
//!
//! Accepted forms: a bare number of seconds (`"90"`) or one or more
//! `<number><unit>` groups (`"15s"`, `"1h30m"`, `"2d"`, `"500ms"`), with units
//! `ms`, `s`, `m`, `h` and `d`.

use anyhow::Result;
use regex::Regex;
use std::time::Duration;

/// Parse a duration string into a [`Duration`].
///
/// Zero is accepted here; callers decide whether a zero value is meaningful.
pub fn parse_duration(duration_str: &str) -> Result<Duration> {
    let trimmed = duration_str.trim();

    if trimmed.is_empty() {
        return Err(anyhow::anyhow!("Duration string cannot be empty"));
    }

    if let Ok(seconds) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }

    let lowered = trimmed.to_lowercase();
    let full_regex = Regex::new(r"^(\d+(ms|s|m|h|d))+$")
        .map_err(|e| anyhow::anyhow!("Failed to compile regex: {e}"))?;
    if !full_regex.is_match(&lowered) {
        return Err(anyhow::anyhow!(
            "Invalid duration format '{trimmed}'. Expected <number><unit> groups (e.g., '15s', '1h30m', '2d')"
        ));
    }

    let group_regex = Regex::new(r"(?P<number>\d+)(?P<unit>ms|s|m|h|d)")
        .map_err(|e| anyhow::anyhow!("Failed to compile regex: {e}"))?;

    let mut total_millis: u64 = 0;
    for captures in group_regex.captures_iter(&lowered) {
        let number_str = captures
            .name("number")
            .ok_or_else(|| anyhow::anyhow!("Failed to extract number from duration '{trimmed}'"))?
            .as_str();
        let unit = captures
            .name("unit")
            .ok_or_else(|| anyhow::anyhow!("Failed to extract unit from duration '{trimmed}'"))?
            .as_str();

        let number: u64 = number_str.parse().map_err(|e| {
            anyhow::anyhow!("Invalid duration number '{number_str}' in '{trimmed}': {e}")
        })?;

        let unit_millis: u64 = match unit {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            _ => {
                return Err(anyhow::anyhow!(
                    "Invalid unit '{unit}' in duration '{trimmed}'. Expected: ms, s, m, h, or d"
                ));
            }
        };

        total_millis = number
            .checked_mul(unit_millis)
            .and_then(|millis| total_millis.checked_add(millis))
            .ok_or_else(|| anyhow::anyhow!("Duration '{trimmed}' is too large"))?;
    }

    Ok(Duration::from_millis(total_millis))
}
