use crate::error::{BytesError, BytesResult};

const BINARY_UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

/// Formats a byte count with binary units and the given number of decimals.
///
/// ```
/// use regfetch_utils::bytes::format_bytes;
///
/// assert_eq!(format_bytes(1536, 1), "1.5 KiB");
/// assert_eq!(format_bytes(12, 0), "12 B");
/// ```
pub fn format_bytes(bytes: u64, precision: usize) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < BINARY_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.precision$} {}", BINARY_UNITS[unit])
}

/// Parses sizes such as `4MiB`, `1.5 GB` or `512` into bytes.
///
/// Binary suffixes (`KiB`, `MiB`, ...) scale by 1024, decimal ones (`KB`,
/// `MB`, ...) by 1000. Suffixes are case-insensitive.
///
/// # Errors
///
/// * [`BytesError::ParseFailed`] for an empty number, an unknown unit or a
///   value that does not fit in `u64`.
pub fn parse_bytes(s: &str) -> BytesResult<u64> {
    let input = s.trim();
    let fail = |reason: &str| {
        BytesError::ParseFailed {
            input: s.to_string(),
            reason: reason.to_string(),
        }
    };

    let split = input
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(input.len());
    let (number, unit) = input.split_at(split);
    let unit = unit.trim().to_ascii_uppercase();

    if number.is_empty() {
        return Err(fail("missing number"));
    }

    if unit.is_empty() {
        return number.parse::<u64>().map_err(|_| fail("not an integer"));
    }

    let (prefix, base) = if let Some(p) = unit.strip_suffix("IB") {
        (p, 1024f64)
    } else if let Some(p) = unit.strip_suffix('B') {
        (p, 1000f64)
    } else {
        return Err(fail("invalid suffix"));
    };

    let exponent = match prefix {
        "" => 0,
        "K" => 1,
        "M" => 2,
        "G" => 3,
        "T" => 4,
        "P" => 5,
        "E" => 6,
        _ => return Err(fail("unknown unit")),
    };

    let value: f64 = number.parse().map_err(|_| fail("invalid number"))?;
    let bytes = (value * base.powi(exponent)).round();
    if !bytes.is_finite() || bytes > u64::MAX as f64 {
        return Err(fail("value too large"));
    }

    Ok(bytes as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0, 0), "0 B");
        assert_eq!(format_bytes(1023, 0), "1023 B");
        assert_eq!(format_bytes(1024, 2), "1.00 KiB");
        assert_eq!(format_bytes(4 * 1024 * 1024, 0), "4 MiB");
        assert_eq!(format_bytes(5 * 1024_u64.pow(3) / 2, 1), "2.5 GiB");
    }

    #[test]
    fn test_parse_bytes() {
        assert_eq!(parse_bytes("42").unwrap(), 42);
        assert_eq!(parse_bytes(" 120 ").unwrap(), 120);
        assert_eq!(parse_bytes("1B").unwrap(), 1);
        assert_eq!(parse_bytes("1KiB").unwrap(), 1024);
        assert_eq!(parse_bytes("1kb").unwrap(), 1000);
        assert_eq!(parse_bytes("4MiB").unwrap(), 4 * 1024 * 1024);
        assert_eq!(parse_bytes("1.5 GiB").unwrap(), 3 * 1024_u64.pow(3) / 2);
        assert_eq!(parse_bytes("2TB").unwrap(), 2 * 1000_u64.pow(4));
    }

    #[test]
    fn test_parse_bytes_invalid() {
        assert!(parse_bytes("").is_err());
        assert!(parse_bytes("MiB").is_err());
        assert!(parse_bytes("1.5").is_err());
        assert!(parse_bytes("1.x MB").is_err());
        assert!(parse_bytes("10FB").is_err());
        assert!(parse_bytes("10 parsecs").is_err());
    }
}
