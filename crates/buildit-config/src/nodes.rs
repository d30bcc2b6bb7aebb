//! Helper functions for extracting values from KDL nodes.

use crate::{ConfigError, ConfigResult};
use kdl::KdlNode;
use std::time::Duration;

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

pub(crate) fn get_u32_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u32>> {
    match node.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_integer()
            .and_then(|i| u32::try_from(i).ok())
            .map(Some)
            .ok_or_else(|| ConfigError::invalid(name, "expected a non-negative integer")),
    }
}

/// Durations are bare integers (seconds) or strings with a unit: `90s`, `10m`, `24h`.
pub(crate) fn get_duration_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<Duration>> {
    let Some(value) = node.get(name) else {
        return Ok(None);
    };
    if let Some(secs) = value.as_integer() {
        return u64::try_from(secs)
            .map(|s| Some(Duration::from_secs(s)))
            .map_err(|_| ConfigError::invalid(name, "duration must not be negative"));
    }
    match value.as_string() {
        Some(text) => parse_duration(text)
            .map(Some)
            .ok_or_else(|| ConfigError::invalid(name, format!("bad duration '{}'", text))),
        None => Err(ConfigError::invalid(name, "expected a duration")),
    }
}

pub(crate) fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    let split = text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let n: u64 = digits.parse().ok()?;
    let secs = match unit {
        "" | "s" => n,
        "m" => n.checked_mul(60)?,
        "h" => n.checked_mul(3600)?,
        "d" => n.checked_mul(86_400)?,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}
