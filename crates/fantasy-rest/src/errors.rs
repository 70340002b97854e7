//! Structured error payloads
//!
//! - [`ApiError`] - a 4xx response, with the server's nested field errors
//!   decoded into an [`ErrorNode`] tree
//! - [`HttpError`] - a 5xx response that survived every retry
//! - [`RateLimitError`] - a rate limit the caller asked to be rejected on

use std::fmt;

use fantasy_core::domain::{RateLimitData, RequestMethod};
use fantasy_core::ports::transport::RequestBodySummary;
use serde_json::Value;

// ============================================================================
// ErrorNode
// ============================================================================

/// One node of the field-error tree returned with 4xx responses.
///
/// ```json
/// {"embeds": {"0": {"title": {"_errors": [{"code": "BASE_TYPE_REQUIRED", "message": "..."}]}}}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorNode {
    /// A single error with its code and message
    Leaf { code: String, message: String },
    /// Keyed children, in the order the server sent them
    Group(Vec<(String, ErrorNode)>),
    /// The `_errors` wrapper: errors attached to the enclosing key
    List(Vec<ErrorNode>),
    /// A bare message
    Text(String),
}

impl ErrorNode {
    /// Decodes an arbitrary JSON value into an error tree.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(s) => ErrorNode::Text(s.clone()),
            Value::Object(map) => {
                if let Some(Value::String(message)) = map.get("message") {
                    return ErrorNode::Leaf {
                        code: map.get("code").map(value_to_code).unwrap_or_default(),
                        message: message.clone(),
                    };
                }
                if let Some(Value::Array(errors)) = map.get("_errors") {
                    return ErrorNode::List(errors.iter().map(ErrorNode::from_value).collect());
                }
                ErrorNode::Group(
                    map.iter()
                        .map(|(k, v)| (k.clone(), ErrorNode::from_value(v)))
                        .collect(),
                )
            }
            Value::Array(items) => ErrorNode::Group(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (i.to_string(), ErrorNode::from_value(v)))
                    .collect(),
            ),
            other => ErrorNode::Text(other.to_string()),
        }
    }

    /// Flattens the tree into one `path[code]: message` line per error.
    pub fn flatten(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.flatten_into("", &mut out);
        out
    }

    fn flatten_into(&self, key: &str, out: &mut Vec<String>) {
        match self {
            ErrorNode::Leaf { code, message } => {
                let line = if key.is_empty() {
                    format!("{}: {}", code, message)
                } else {
                    format!("{}[{}]: {}", key, code, message)
                };
                out.push(line.trim().to_string());
            }
            ErrorNode::Text(text) => out.push(text.clone()),
            ErrorNode::List(errors) => {
                for error in errors {
                    error.flatten_into(key, out);
                }
            }
            ErrorNode::Group(children) => {
                for (child_key, child) in children {
                    let next_key = if child_key.starts_with('_') {
                        key.to_string()
                    } else if key.is_empty() {
                        child_key.clone()
                    } else if child_key.parse::<u64>().is_ok() {
                        format!("{}[{}]", key, child_key)
                    } else {
                        format!("{}.{}", key, child_key)
                    };
                    child.flatten_into(&next_key, out);
                }
            }
        }
    }
}

fn value_to_code(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ============================================================================
// ApiError
// ============================================================================

/// A 4xx response decoded into the API's error format.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    /// The response body as received
    pub raw_error: Value,
    /// `code` from the body, falling back to `error`
    pub code: String,
    pub status: u16,
    pub method: RequestMethod,
    pub url: String,
    pub request_body: RequestBodySummary,
    /// Decoded `errors` field, if any
    pub errors: Option<ErrorNode>,
    message: String,
}

impl ApiError {
    pub fn new(
        raw_error: Value,
        status: u16,
        method: RequestMethod,
        url: impl Into<String>,
        request_body: RequestBodySummary,
    ) -> Self {
        let code = raw_error
            .get("code")
            .or_else(|| raw_error.get("error"))
            .map(value_to_code)
            .unwrap_or_default();
        let errors = raw_error.get("errors").map(ErrorNode::from_value);
        let message = Self::build_message(&raw_error, errors.as_ref());

        Self {
            raw_error,
            code,
            status,
            method,
            url: url.into(),
            request_body,
            errors,
            message,
        }
    }

    /// Error name including the API code, e.g. `FantasyAPIError[50035]`.
    pub fn name(&self) -> String {
        format!("FantasyAPIError[{}]", self.code)
    }

    /// Top-level message followed by the flattened field errors.
    pub fn message(&self) -> &str {
        &self.message
    }

    fn build_message(raw: &Value, errors: Option<&ErrorNode>) -> String {
        if raw.get("code").is_some() {
            let flattened = errors.map(|e| e.flatten().join("\n")).unwrap_or_default();
            let message = raw.get("message").and_then(Value::as_str).unwrap_or("");
            return match (message.is_empty(), flattened.is_empty()) {
                (false, false) => format!("{}\n{}", message, flattened),
                (false, true) => message.to_string(),
                (true, false) => flattened,
                (true, true) => "Unknown Error".to_string(),
            };
        }
        raw.get("error_description")
            .and_then(Value::as_str)
            .unwrap_or("No Description")
            .to_string()
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name(), self.message)
    }
}

// ============================================================================
// HttpError
// ============================================================================

/// A server error that persisted through every retry.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpError {
    pub status: u16,
    pub status_text: String,
    pub method: RequestMethod,
    pub url: String,
    pub request_body: RequestBodySummary,
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HTTPError {} {} on {} {}",
            self.status, self.status_text, self.method, self.url
        )
    }
}

// ============================================================================
// RateLimitError
// ============================================================================

/// A rate limit surfaced instead of waited out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitError {
    pub data: RateLimitData,
}

impl RateLimitError {
    /// Error name including the bucket route.
    pub fn name(&self) -> String {
        format!("RateLimitError[{}]", self.data.route)
    }
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name(), self.data)
    }
}
