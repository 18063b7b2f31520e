//! Decoding and validation of identify requests.
//!
//! `phoneNumber` is accepted either as a string or as a JSON number. Values
//! are trimmed and empty strings count as absent.

use crate::error::{IdentifyError, Result};
use crate::model::Observation;
use serde::Deserialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "deserialize_phone_number")]
    pub phone_number: Option<String>,
}

impl IdentifyRequest {
    pub fn new(email: Option<&str>, phone_number: Option<&str>) -> Self {
        Self {
            email: email.map(str::to_string),
            phone_number: phone_number.map(str::to_string),
        }
    }

    /// Decode a raw request body.
    pub fn from_json_bytes(body: &[u8]) -> Result<Self> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(IdentifyError::validation("request body is missing or empty"));
        }
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|err| IdentifyError::validation(format!("malformed request body: {err}")))?;
        match &value {
            serde_json::Value::Object(map) if map.is_empty() => {
                return Err(IdentifyError::validation("request body is missing or empty"))
            }
            serde_json::Value::Object(_) => {}
            _ => {
                return Err(IdentifyError::validation(
                    "malformed request body: expected a JSON object",
                ))
            }
        }
        serde_json::from_value(value)
            .map_err(|err| IdentifyError::validation(format!("malformed request body: {err}")))
    }

    /// Normalize and validate into an observation.
    pub fn observation(&self) -> Result<Observation> {
        Observation::new(normalize(&self.email), normalize(&self.phone_number)).ok_or_else(|| {
            IdentifyError::validation("at least one of email or phoneNumber is required")
        })
    }
}

fn normalize(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PhoneNumberInput {
    Text(String),
    Number(serde_json::Number),
}

fn deserialize_phone_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<PhoneNumberInput>::deserialize(deserializer)?;
    Ok(value.map(|input| match input {
        PhoneNumberInput::Text(text) => text,
        PhoneNumberInput::Number(number) => number.to_string(),
    }))
}
