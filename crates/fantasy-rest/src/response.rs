//! Final response decoding

use fantasy_core::ports::transport::TransportResponse;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{RestError, Result};

/// A response body decoded according to its content type.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// `application/json` bodies
    Json(Value),
    /// Everything else, including empty bodies
    Bytes(Vec<u8>),
}

impl ResponseBody {
    /// Deserializes a JSON body into `T`.
    pub fn into_json<T: DeserializeOwned>(self) -> Result<T> {
        match self {
            ResponseBody::Json(value) => serde_json::from_value(value)
                .map_err(|e| RestError::InvalidResponse(e.to_string())),
            ResponseBody::Bytes(_) => Err(RestError::InvalidResponse(
                "response body is not JSON".to_string(),
            )),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            ResponseBody::Bytes(_) => None,
        }
    }
}

/// Decodes `response` as JSON when the server declared it, raw bytes
/// otherwise.
pub fn parse_response(response: TransportResponse) -> Result<ResponseBody> {
    if response.is_json() {
        let value = response
            .json::<Value>()
            .map_err(|e| RestError::InvalidResponse(e.to_string()))?;
        return Ok(ResponseBody::Json(value));
    }
    Ok(ResponseBody::Bytes(response.body))
}
