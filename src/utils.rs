use crate::error::{RepairError, RepairResult};
use std::time::Duration;

pub fn tail(text: &str, max: usize) -> &str {
    let len = text.chars().count();
    if len <= max {
        return text;
    }
    let skip = len - max;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => "",
    }
}

pub fn indent(text: &str, prefix: &str) -> String {
    let mut out = String::new();
    for line in text.trim_end_matches('\n').lines() {
        out.push_str(prefix);
        out.push_str(line);
        out.push('\n');
    }
    out
}

pub fn is_root_user() -> bool {
    unsafe { libc::geteuid() == 0 }
}

pub fn require_root() -> RepairResult<()> {
    if !is_root_user() {
        return Err(RepairError::PrivilegeError(format!(
            "effective uid is {}, root is required",
            unsafe { libc::geteuid() }
        )));
    }
    Ok(())
}

/// Longest accepted `--timeout`.
pub const MAX_DURATION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Parses durations such as `20m`, `1h30m`, `90s` or `500ms`. A bare number
/// is taken as seconds.
pub fn parse_duration(input: &str) -> RepairResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(RepairError::InvalidArguments("empty duration".into()));
    }
    let mut total = Duration::ZERO;
    let mut rest = input;
    if let Ok(secs) = input.parse::<u64>() {
        total = Duration::from_secs(secs);
        rest = "";
    }

    let invalid = || RepairError::InvalidArguments(format!("invalid duration '{}'", input));
    let too_long = || {
        RepairError::InvalidArguments(format!(
            "duration '{}' exceeds the maximum of {}",
            input,
            format_duration(MAX_DURATION.as_secs())
        ))
    };
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let value: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];
        let part = match unit {
            "h" => value.checked_mul(3600).map(Duration::from_secs),
            "m" => value.checked_mul(60).map(Duration::from_secs),
            "s" => Some(Duration::from_secs(value)),
            "ms" => Some(Duration::from_millis(value)),
            _ => return Err(invalid()),
        };
        total = part
            .and_then(|part| total.checked_add(part))
            .ok_or_else(too_long)?;
    }
    if total.is_zero() {
        return Err(RepairError::InvalidArguments(
            "timeout must be greater than zero".into(),
        ));
    }
    if total > MAX_DURATION {
        return Err(too_long());
    }
    Ok(total)
}

pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        let hours = seconds / 3600;
        let minutes = (seconds % 3600) / 60;
        format!("{}h {}m", hours, minutes)
    }
}
