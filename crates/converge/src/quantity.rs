//! Human resource quantities decoded into canonical units: memory in bytes, CPU in millicores.

use metrics::counter;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("malformed quantity: {0:?}")]
    Malformed(String),
    #[error("unknown unit {unit:?} in {input:?}")]
    UnknownUnit { input: String, unit: String },
    #[error("quantity out of range: {0:?}")]
    Overflow(String),
}

const KI: i64 = 1 << 10;

fn memory_multiplier(unit: &str) -> Option<i64> {
    Some(match unit {
        "" => 1,
        "k" | "K" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        "Ki" | "KB" => KI,
        "Mi" | "MB" => KI.pow(2),
        "Gi" | "GB" => KI.pow(3),
        "Ti" | "TB" => KI.pow(4),
        "Pi" => KI.pow(5),
        "Ei" => KI.pow(6),
        _ => return None,
    })
}

/// Split `"1.5Gi"` into `("1.5", "Gi")`.
fn split_unit(s: &str) -> (&str, &str) {
    let at = s.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(s.len());
    s.split_at(at)
}

fn scale(input: &str, number: &str, mult: i64) -> Result<i64, QuantityError> {
    if number.is_empty() || number.starts_with('.') || number.ends_with('.') {
        return Err(QuantityError::Malformed(input.to_string()));
    }
    if !number.contains('.') {
        let n: i64 = number.parse().map_err(|_| QuantityError::Overflow(input.to_string()))?;
        return n.checked_mul(mult).ok_or_else(|| QuantityError::Overflow(input.to_string()));
    }
    let n: f64 = number.parse().map_err(|_| QuantityError::Malformed(input.to_string()))?;
    let v = (n * mult as f64).round();
    if !v.is_finite() || v > i64::MAX as f64 {
        return Err(QuantityError::Overflow(input.to_string()));
    }
    Ok(v as i64)
}

/// Memory quantity in bytes. An empty string is zero.
pub fn decode_memory(s: &str) -> Result<i64, QuantityError> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(0);
    }
    let (number, unit) = split_unit(s);
    let mult = memory_multiplier(unit)
        .ok_or_else(|| QuantityError::UnknownUnit { input: s.to_string(), unit: unit.to_string() })?;
    scale(s, number, mult)
}

/// CPU quantity in millicores: `"1"` is 1000, `"250m"` is 250. An empty string is zero.
pub fn decode_cpu(s: &str) -> Result<i64, QuantityError> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(0);
    }
    let (number, unit) = split_unit(s);
    let mult = match unit {
        "" => 1000,
        "m" => 1,
        _ => return Err(QuantityError::UnknownUnit { input: s.to_string(), unit: unit.to_string() }),
    };
    scale(s, number, mult)
}

/// Lenient decode: malformed input counts as zero, with a warning and a counter bump.
pub fn memory_or_zero(s: &str) -> i64 {
    decode_memory(s).unwrap_or_else(|e| {
        counter!("quantity_decode_failed_total", 1u64, "resource" => "ram");
        warn!(input = %s, error = %e, "ram quantity treated as zero");
        0
    })
}

/// See [`memory_or_zero`].
pub fn cpu_or_zero(s: &str) -> i64 {
    decode_cpu(s).unwrap_or_else(|e| {
        counter!("quantity_decode_failed_total", 1u64, "resource" => "cpu");
        warn!(input = %s, error = %e, "cpu quantity treated as zero");
        0
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_units() {
        assert_eq!(decode_memory("512Mi"), Ok(536_870_912));
        assert_eq!(decode_memory("536870912"), Ok(536_870_912));
        assert_eq!(decode_memory("1k"), Ok(1000));
        assert_eq!(decode_memory("1K"), Ok(1000));
        assert_eq!(decode_memory("1GB"), Ok(1 << 30));
        assert_eq!(decode_memory("1.5Gi"), Ok(1_610_612_736));
        assert_eq!(decode_memory(""), Ok(0));
        assert_eq!(decode_memory(" 2M "), Ok(2_000_000));
    }

    #[test]
    fn cpu_units() {
        assert_eq!(decode_cpu("1"), Ok(1000));
        assert_eq!(decode_cpu("1000m"), Ok(1000));
        assert_eq!(decode_cpu("250m"), Ok(250));
        assert_eq!(decode_cpu("0.5"), Ok(500));
        assert_eq!(decode_cpu(""), Ok(0));
    }

    #[test]
    fn garbage_is_an_error_and_zero_when_lenient() {
        assert!(matches!(decode_memory("Gi"), Err(QuantityError::Malformed(_))));
        assert!(matches!(decode_memory("12Xi"), Err(QuantityError::UnknownUnit { .. })));
        assert!(matches!(decode_cpu("1.2.3"), Err(QuantityError::Malformed(_))));
        assert!(matches!(decode_memory("99999999999Ei"), Err(QuantityError::Overflow(_))));
        assert_eq!(memory_or_zero("lots"), 0);
        assert_eq!(cpu_or_zero("2 cores"), 0);
    }
}
