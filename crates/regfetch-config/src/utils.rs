//! Serde adapters for human-readable config values.

/// `Duration` as a compact string such as `"5s"` or `"200ms"`.
pub mod duration_str {
    use std::time::Duration;

    use regfetch_utils::time::{format_duration, parse_duration};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).ok_or_else(|| {
            de::Error::custom(format!(
                "invalid duration `{raw}`, expected a value like \"5s\" or \"200ms\""
            ))
        })
    }
}

/// Byte counts written either as integers or as strings like `"4MiB"`.
pub mod byte_size {
    use regfetch_utils::bytes::parse_bytes;
    use serde::{de, Deserialize, Deserializer, Serializer};

    const UNITS: [(u64, &str); 4] = [
        (1 << 40, "TiB"),
        (1 << 30, "GiB"),
        (1 << 20, "MiB"),
        (1 << 10, "KiB"),
    ];

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        let exact = UNITS
            .iter()
            .find(|(size, _)| *value > 0 && value % size == 0);
        match exact {
            Some((size, unit)) => serializer.serialize_str(&format!("{}{unit}", value / size)),
            None => serializer.serialize_u64(*value),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Int(n) => Ok(n),
            Raw::Text(s) => parse_bytes(&s).map_err(de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        #[serde(with = "super::duration_str")]
        timeout: Duration,
        #[serde(with = "super::byte_size")]
        limit: u64,
    }

    #[test]
    fn test_human_values_deserialize() {
        let sample: Sample = toml::from_str("timeout = \"1m30s\"\nlimit = \"4MiB\"").unwrap();
        assert_eq!(sample.timeout, Duration::from_secs(90));
        assert_eq!(sample.limit, 4 * 1024 * 1024);

        let sample: Sample = toml::from_str("timeout = \"200ms\"\nlimit = 1000").unwrap();
        assert_eq!(sample.limit, 1000);
    }

    #[test]
    fn test_human_values_serialize() {
        let sample = Sample {
            timeout: Duration::from_secs(5),
            limit: 4 * 1024 * 1024,
        };
        let text = toml::to_string(&sample).unwrap();
        assert!(text.contains("timeout = \"5s\""));
        assert!(text.contains("limit = \"4MiB\""));

        let odd = Sample {
            timeout: Duration::from_millis(1),
            limit: 1500,
        };
        assert!(toml::to_string(&odd).unwrap().contains("limit = 1500"));
    }

    #[test]
    fn test_invalid_duration_is_rejected() {
        let result: Result<Sample, _> = toml::from_str("timeout = \"soon\"\nlimit = 1");
        assert!(result.is_err());
    }
}
