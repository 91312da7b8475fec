/*!
 * Serde helpers shared by the declarative step configuration.
 */

use serde::{Deserialize, Deserializer};

/// Deserialize an optional duration in whole seconds that may be written as a
/// number or a string.
///
/// Floating point values are truncated. Negative values are rejected.
///
/// ```json
/// {"timeout_seconds": 30}
/// {"timeout_seconds": "30"}
/// {"timeout_seconds": 30.5}
/// {"timeout_seconds": null}
/// ```
pub fn deserialize_optional_seconds<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    let value: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    let seconds = match value {
        None | Some(serde_json::Value::Null) => return Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| D::Error::custom(format!("Invalid numeric value: {n}")))?,
        Some(serde_json::Value::String(s)) => s
            .parse::<i64>()
            .or_else(|_| s.parse::<f64>().map(|f| f as i64))
            .map_err(|_| D::Error::custom(format!("Cannot parse '{s}' as seconds")))?,
        Some(other) => {
            return Err(D::Error::custom(format!(
                "Expected numeric value, found: {other}"
            )))
        }
    };

    u64::try_from(seconds)
        .map(Some)
        .map_err(|_| D::Error::custom(format!("Seconds must not be negative: {seconds}")))
}
