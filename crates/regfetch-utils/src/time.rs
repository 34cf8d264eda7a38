use std::time::Duration;

/// Parses a compact duration string such as `1m30s`, `200ms` or `2h`.
///
/// Each component is a run of digits followed by one of `ms`, `s`, `m`,
/// `h` or `d`. Components add up. A bare number without a unit, an
/// unknown unit, or an overflow yields `None`.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use regfetch_utils::time::parse_duration;
///
/// assert_eq!(parse_duration("1m30s"), Some(Duration::from_secs(90)));
/// assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
/// assert_eq!(parse_duration("10"), None);
/// ```
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    let mut total_ms: u64 = 0;
    let mut chars = input.chars().peekable();

    while chars.peek().is_some() {
        let mut number: u64 = 0;
        let mut digits = 0;
        while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
            number = number.checked_mul(10)?.checked_add(d as u64)?;
            digits += 1;
            chars.next();
        }

        if digits == 0 {
            return None;
        }

        let multiplier = match chars.next()? {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                1
            }
            's' => 1000,
            'm' => 60 * 1000,
            'h' => 60 * 60 * 1000,
            'd' => 24 * 60 * 60 * 1000,
            _ => return None,
        };

        total_ms = total_ms.checked_add(number.checked_mul(multiplier)?)?;
    }

    Some(Duration::from_millis(total_ms))
}

/// Formats a duration in the shortest form [`parse_duration`] reads back.
///
/// ```
/// use std::time::Duration;
/// use regfetch_utils::time::format_duration;
///
/// assert_eq!(format_duration(Duration::from_millis(1500)), "1s500ms");
/// assert_eq!(format_duration(Duration::from_secs(3600)), "1h");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let mut ms = duration.as_millis() as u64;
    if ms == 0 {
        return "0ms".into();
    }

    let units: [(u64, &str); 5] = [
        (24 * 60 * 60 * 1000, "d"),
        (60 * 60 * 1000, "h"),
        (60 * 1000, "m"),
        (1000, "s"),
        (1, "ms"),
    ];

    let mut out = String::new();
    for (size, suffix) in units {
        if ms >= size {
            out.push_str(&format!("{}{suffix}", ms / size));
            ms %= size;
        }
    }
    out
}
