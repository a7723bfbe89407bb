use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

/// Deserializes an optional duration from either a plain integer number
/// of seconds or a humantime string ("30s", "2m", ...).
pub fn deserialize_optional_duration<'de, D>(
    deserializer: D
) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Seconds(u64),
        Text(String),
    }

    let raw = Option::<RawDuration>::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(RawDuration::Seconds(secs)) => Ok(Some(Duration::from_secs(secs))),
        Some(RawDuration::Text(value)) => {
            let value = value.trim();
            if value.is_empty() {
                return Ok(None);
            }

            humantime::parse_duration(value).map(Some).map_err(D::Error::custom)
        }
    }
}

pub fn deserialize_duration<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: From<Duration> + Default,
{
    let s: Option<String> = Option::deserialize(deserializer)?;
    match s {
        Some(duration_str) => humantime::parse_duration(&duration_str)
            .map(T::from)
            .map_err(serde::de::Error::custom),
        None => Ok(T::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Wrapper {
        #[serde(deserialize_with = "deserialize_optional_duration", default)]
        interval: Option<Duration>,
    }

    #[test]
    fn parses_seconds_and_text() {
        let w: Wrapper = serde_yaml::from_str("interval: 30").unwrap();
        assert_eq!(w.interval, Some(Duration::from_secs(30)));

        let w: Wrapper = serde_yaml::from_str("interval: 2m").unwrap();
        assert_eq!(w.interval, Some(Duration::from_secs(120)));
    }

    #[test]
    fn empty_string_is_none() {
        let w: Wrapper = serde_yaml::from_str("interval: ''").unwrap();
        assert_eq!(w.interval, None);
    }
}
