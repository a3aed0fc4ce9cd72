//! Custom serde helpers for feed wire formats.

/// Deserializes a decimal string that may be empty or absent.
///
/// Order updates send `""` for fields that have no value yet (e.g. `avg_px`
/// before the first fill).
pub mod decimal_opt {
    use rust_decimal::Decimal;
    use serde::{Deserialize, Deserializer};
    use std::str::FromStr;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => Decimal::from_str(s)
                .map(Some)
                .map_err(|e| serde::de::Error::custom(format!("Invalid decimal {:?}: {}", s, e))),
        }
    }
}

/// Deserializes `null` as an empty vector.
pub mod null_as_empty {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
    }
}
