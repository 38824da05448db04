//! Tolerant field deserializers for `config.json`.
//!
//! A field holding a value of the wrong shape degrades to that field's
//! default instead of failing the whole document.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::types::{DEFAULT_GADGET_PORT, DEFAULT_INJECTION_DELAY, MAX_INJECTION_DELAY};

/// A string-valued setting with a closed set of accepted spellings.
pub(crate) trait Choice: Default {
    const FIELD: &'static str;

    fn parse(raw: &str) -> Option<Self>;
}

pub(crate) fn choice<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Choice,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(raw)) => T::parse(&raw).unwrap_or_else(|| {
            log::warn!("unknown {} '{}', using default", T::FIELD, raw);
            T::default()
        }),
        None | Some(Value::Null) => T::default(),
        Some(other) => {
            log::warn!("{} must be a string, got {}", T::FIELD, other);
            T::default()
        }
    })
}

/// `null` and absent both mean "empty".
pub(crate) fn or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

pub(crate) fn injection_delay<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value.as_ref().and_then(Value::as_i64) {
        Some(seconds) => seconds.clamp(0, i64::from(MAX_INJECTION_DELAY)) as u32,
        None => DEFAULT_INJECTION_DELAY,
    })
}

pub(crate) fn port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value.as_ref().and_then(Value::as_u64) {
        Some(port) if (1..=u64::from(u16::MAX)).contains(&port) => port as u16,
        Some(port) => {
            log::warn!("gadget port {} out of range, using {}", port, DEFAULT_GADGET_PORT);
            DEFAULT_GADGET_PORT
        }
        None => DEFAULT_GADGET_PORT,
    })
}
