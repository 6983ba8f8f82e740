//! Human-friendly durations: short age strings for messages and Go-style
//! duration flags (`500ms`, `30s`, `1m30s`, `2h`).

use chrono::TimeDelta;
use std::time::Duration;

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// Renders a duration using at most `at_most` of its largest units.
///
/// Once the duration reaches one second, sub-second precision is dropped
/// first. Rendering starts at the largest non-zero unit among `h`, `m`, `s`
/// and keeps the following units even when they are zero, so `3h1m2.5s`
/// with `at_most = 2` becomes `3h1m` and `2h0m5s` becomes `2h0m`. Shorter
/// durations keep their fraction: `1.5ms`.
#[must_use]
pub fn pretty_duration(d: TimeDelta, at_most: usize) -> String {
    let total = i128::from(d.num_seconds()) * 1_000_000_000 + i128::from(d.subsec_nanos());
    let sign = if total < 0 { "-" } else { "" };
    let nanos = total.unsigned_abs();

    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < NANOS_PER_SECOND {
        return format!("{sign}{}", sub_second(nanos));
    }

    let secs = nanos / NANOS_PER_SECOND;
    let units = [(secs / 3600, 'h'), ((secs % 3600) / 60, 'm'), (secs % 60, 's')];
    let start = units.iter().position(|(v, _)| *v > 0).unwrap_or(units.len() - 1);
    let end = (start + at_most.max(1)).min(units.len());

    let mut out = sign.to_string();
    for (value, unit) in &units[start..end] {
        out.push_str(&value.to_string());
        out.push(*unit);
    }
    out
}

fn sub_second(nanos: u128) -> String {
    if nanos >= 1_000_000 {
        with_fraction(nanos, 1_000_000, "ms")
    } else if nanos >= 1_000 {
        with_fraction(nanos, 1_000, "µs")
    } else {
        format!("{nanos}ns")
    }
}

/// `value / scale` in decimal, trailing zeros of the fraction removed.
fn with_fraction(value: u128, scale: u128, unit: &str) -> String {
    let whole = value / scale;
    let frac = value % scale;
    if frac == 0 {
        return format!("{whole}{unit}");
    }
    let digits = scale.ilog10() as usize;
    let frac = format!("{frac:0digits$}");
    format!("{whole}.{}{unit}", frac.trim_end_matches('0'))
}

/// Parses a Go-style duration string such as `1m30s` or `1.5h`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total_nanos = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration {input:?}"))?;
        if number_len == 0 {
            return Err(format!("invalid duration {input:?}"));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|e| format!("invalid duration {input:?}: {e}"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            unit => return Err(format!("unknown unit {unit:?} in duration {input:?}")),
        };
        rest = &rest[unit_len..];
        total_nanos += value * scale;
    }

    Duration::try_from_secs_f64(total_nanos / 1e9).map_err(|e| format!("invalid duration {input:?}: {e}"))
}
