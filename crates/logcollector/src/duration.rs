// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Duration expressions as written by the applications' loggers, e.g.
//! `1.5s`, `250ms`, `1h30m` or `-3µs`.

const NANOS_PER_MILLI: i128 = 1_000_000;

fn unit_nanos(unit: &str) -> Option<i128> {
    match unit {
        "ns" => Some(1),
        "us" | "µs" | "μs" => Some(1_000),
        "ms" => Some(1_000_000),
        "s" => Some(1_000_000_000),
        "m" => Some(60 * 1_000_000_000),
        "h" => Some(3_600 * 1_000_000_000),
        _ => None,
    }
}

/// Parses a duration expression into whole milliseconds, truncated toward zero.
#[must_use]
pub fn parse_duration_millis(value: &str) -> Option<i64> {
    let (negative, mut rest) = match value.as_bytes().first()? {
        b'-' => (true, &value[1..]),
        b'+' => (false, &value[1..]),
        _ => (false, value),
    };
    if rest == "0" {
        return Some(0);
    }
    if rest.is_empty() {
        return None;
    }

    let mut total: i128 = 0;
    while !rest.is_empty() {
        let int_len = rest.bytes().take_while(u8::is_ascii_digit).count();
        let (int_part, after) = rest.split_at(int_len);
        let (frac_part, after) = match after.strip_prefix('.') {
            Some(tail) => {
                let frac_len = tail.bytes().take_while(u8::is_ascii_digit).count();
                tail.split_at(frac_len)
            }
            None => ("", after),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return None;
        }

        let unit_len = after
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit() || *c == '.')
            .map_or(after.len(), |(i, _)| i);
        let (unit, tail) = after.split_at(unit_len);
        let scale = unit_nanos(unit)?;

        let whole: i128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().ok()?
        };
        let mut component = whole.checked_mul(scale)?;
        if !frac_part.is_empty() {
            // Digits past nanosecond precision cannot change the result.
            let digits = &frac_part[..frac_part.len().min(18)];
            let numerator: i128 = digits.parse().ok()?;
            let denominator = 10_i128.checked_pow(u32::try_from(digits.len()).ok()?)?;
            component = component.checked_add(numerator * scale / denominator)?;
        }
        total = total.checked_add(component)?;
        rest = tail;
    }

    let millis = total / NANOS_PER_MILLI;
    let millis = if negative { -millis } else { millis };
    i64::try_from(millis).ok()
}
