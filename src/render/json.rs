use serde::Serialize;

use crate::error::PeriopError;

pub fn to_pretty<T: Serialize>(value: &T) -> Result<String, PeriopError> {
    Ok(serde_json::to_string_pretty(value)?)
}
