// src/core/scheduler/timeparse.rs

//! Parser for interval strings of the form "Nw Nd Nh Nm Ns".
//!
//! Every unit is optional and the components are additive, so "1h 30m" and
//! "90m" describe the same interval.

use crate::core::errors::AceError;
use std::time::Duration;

const SECS_PER_UNIT: [(char, u64); 5] = [
    ('w', 604_800),
    ('d', 86_400),
    ('h', 3_600),
    ('m', 60),
    ('s', 1),
];

/// Parses an interval string into a `Duration`. Zero-length intervals are
/// rejected.
pub fn parse_time_string(input: &str) -> Result<Duration, AceError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AceError::Validation(
            "interval string cannot be empty".to_string(),
        ));
    }

    let mut total_secs: u64 = 0;
    for token in trimmed.split_whitespace() {
        let unit = token
            .chars()
            .last()
            .map(|c| c.to_ascii_lowercase())
            .unwrap_or_default();
        let multiplier = SECS_PER_UNIT
            .iter()
            .find(|(u, _)| *u == unit)
            .map(|(_, m)| *m)
            .ok_or_else(|| {
                AceError::Validation(format!("invalid interval component '{token}' in '{input}'"))
            })?;

        let digits = &token[..token.len() - 1];
        let value: u64 = digits.parse().map_err(|_| {
            AceError::Validation(format!("invalid interval component '{token}' in '{input}'"))
        })?;

        total_secs = total_secs.saturating_add(value.saturating_mul(multiplier));
    }

    if total_secs == 0 {
        return Err(AceError::Validation(format!(
            "interval '{input}' resolves to zero"
        )));
    }

    Ok(Duration::from_secs(total_secs))
}
