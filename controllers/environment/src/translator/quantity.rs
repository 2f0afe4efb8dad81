//! Kubernetes resource quantity parsing
//!
//! Quantities are compared as integer milli-units so "500m" < "1" and
//! "1Gi" > "1G" without floating point.

/// Parse a quantity ("500m", "2", "1.5", "4Gi", "100G") into milli-units
pub fn parse_quantity(raw: &str) -> Result<u128, String> {
    let value = raw.trim();
    if value.is_empty() {
        return Err("empty quantity".to_string());
    }

    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);
    let multiplier: u128 = match suffix {
        "" => 1,
        "m" => return parse_scaled(number, 1, raw),
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        _ => return Err(format!("quantity {:?} has unknown suffix {:?}", raw, suffix)),
    };
    parse_scaled(number, multiplier * 1000, raw)
}

/// `number * scale`, where `number` may carry a fractional part
fn parse_scaled(number: &str, scale: u128, raw: &str) -> Result<u128, String> {
    let invalid = || format!("quantity {:?} is not a valid number", raw);
    let (whole, fraction) = match number.split_once('.') {
        Some((w, f)) => (w, f),
        None => (number, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if fraction.contains('.') || fraction.len() > 18 {
        return Err(invalid());
    }

    let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| invalid())? };
    let mut result = whole.checked_mul(scale).ok_or_else(invalid)?;
    if !fraction.is_empty() {
        let digits: u128 = fraction.parse().map_err(|_| invalid())?;
        let denominator = 10u128.pow(fraction.len() as u32);
        let part = digits.checked_mul(scale).ok_or_else(invalid)?;
        if part % denominator != 0 {
            return Err(format!("quantity {:?} is more precise than the smallest unit", raw));
        }
        result = result.checked_add(part / denominator).ok_or_else(invalid)?;
    }
    Ok(result)
}

/// Parse a GPU count, which must be a whole number
pub fn parse_gpu(raw: &str) -> Result<u32, String> {
    raw.trim()
        .parse::<u32>()
        .map_err(|_| format!("gpu count {:?} must be a whole number", raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_quantities() {
        assert_eq!(parse_quantity("1").unwrap(), 1_000);
        assert_eq!(parse_quantity("500m").unwrap(), 500);
        assert_eq!(parse_quantity("1.5").unwrap(), 1_500);
        assert_eq!(parse_quantity("0.25").unwrap(), 250);
        assert!(parse_quantity("500m").unwrap() < parse_quantity("1").unwrap());
    }

    #[test]
    fn test_memory_quantities() {
        assert_eq!(parse_quantity("1Ki").unwrap(), 1_024_000);
        assert_eq!(parse_quantity("2Gi").unwrap(), 2 * (1u128 << 30) * 1000);
        assert!(parse_quantity("1Gi").unwrap() > parse_quantity("1G").unwrap());
        assert!(parse_quantity("8Gi").unwrap() > parse_quantity("4Gi").unwrap());
        assert!(parse_quantity("100Gi").unwrap() <= parse_quantity("128Gi").unwrap());
        assert_eq!(parse_quantity("1.5Gi").unwrap(), parse_quantity("1536Mi").unwrap());
    }

    #[test]
    fn test_invalid_quantities() {
        for raw in ["", "lots", "4GB", "1.2.3", "Gi", ".", "-1", "1 Gi"] {
            assert!(parse_quantity(raw).is_err(), "{raw:?} should be rejected");
        }
    }

    #[test]
    fn test_gpu_counts() {
        assert_eq!(parse_gpu("2").unwrap(), 2);
        assert!(parse_gpu("0.5").is_err());
        assert!(parse_gpu("one").is_err());
    }
}
