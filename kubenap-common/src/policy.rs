use std::collections::BTreeMap;
use std::time::Duration;

use crate::{
    ANNOTATION_IDLE_AFTER, ANNOTATION_INGRESS, ANNOTATION_REPLICA_COUNT, ANNOTATION_SERVICE,
};

pub const DEFAULT_IDLE_AFTER: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_REPLICA_COUNT: i32 = 1;

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {key} annotation '{value}': {reason}")]
    InvalidDuration {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid {key} annotation '{value}': expected a positive integer")]
    InvalidReplicaCount { key: &'static str, value: String },
}

/// Per-workload idle configuration.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IdlePolicy {
    pub idle_after: Duration,
    /// Replicas to restore when no durable marker exists.
    pub replica_count: i32,
    pub service_name: Option<String>,
    pub ingress_name: Option<String>,
}

impl Default for IdlePolicy {
    fn default() -> Self {
        Self {
            idle_after: DEFAULT_IDLE_AFTER,
            replica_count: DEFAULT_REPLICA_COUNT,
            service_name: None,
            ingress_name: None,
        }
    }
}

impl IdlePolicy {
    /// Reads the policy from workload annotations. Missing keys fall back to
    /// the defaults silently; malformed values fall back too and are returned
    /// alongside the policy so the caller can report them.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> (Self, Vec<ConfigError>) {
        let mut policy = IdlePolicy::default();
        let mut problems = Vec::new();

        if let Some(raw) = annotations.get(ANNOTATION_IDLE_AFTER) {
            match parse_duration(raw) {
                Ok(d) if !d.is_zero() => policy.idle_after = d,
                Ok(_) => problems.push(ConfigError::InvalidDuration {
                    key: ANNOTATION_IDLE_AFTER,
                    value: raw.clone(),
                    reason: "must be greater than zero".to_string(),
                }),
                Err(reason) => problems.push(ConfigError::InvalidDuration {
                    key: ANNOTATION_IDLE_AFTER,
                    value: raw.clone(),
                    reason,
                }),
            }
        }

        if let Some(raw) = annotations.get(ANNOTATION_REPLICA_COUNT) {
            match raw.trim().parse::<i32>() {
                Ok(n) if n > 0 => policy.replica_count = n,
                _ => problems.push(ConfigError::InvalidReplicaCount {
                    key: ANNOTATION_REPLICA_COUNT,
                    value: raw.clone(),
                }),
            }
        }

        policy.service_name = non_empty(annotations.get(ANNOTATION_SERVICE));
        policy.ingress_name = non_empty(annotations.get(ANNOTATION_INGRESS));

        (policy, problems)
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty()).map(str::to_string)
}

/// Parses durations such as `10m`, `1h30m`, `90s`, `1.5h` or `250ms`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("duration is empty".into());
    }
    if trimmed == "0" {
        return Ok(Duration::ZERO);
    }

    let mut nanos = 0f64;
    let mut rest = trimmed;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_end == 0 {
            return Err(format!("invalid duration '{}': expected number+unit", input));
        }
        let value: f64 = rest[..number_end]
            .parse()
            .map_err(|_| format!("invalid duration '{}': bad number", input))?;
        rest = &rest[number_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let per_unit = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(format!("invalid duration '{}': missing unit", input)),
            other => {
                return Err(format!(
                    "invalid duration '{}': unknown unit '{}' (ns|us|ms|s|m|h)",
                    input, other
                ));
            }
        };
        nanos += value * per_unit;
        rest = &rest[unit_end..];
    }

    Ok(Duration::from_nanos(nanos.round() as u64))
}
