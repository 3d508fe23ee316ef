//! Transport collaborator
//!
//! The coordination core never talks to the network itself. A [`Transport`]
//! executes one query with its variables; retries, timeouts and the wire
//! format are its own business.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{QueryDescriptor, QueryError, error::BoxError};

/// A structured error reported by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl ResponseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: Vec::new(),
            extensions: None,
        }
    }
}

/// The body of an executed query: data, errors, or both
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchResponse {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ResponseError>,
}

impl FetchResponse {
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    /// Parse a raw response body
    pub fn from_json(body: &str) -> Result<Self, QueryError> {
        Ok(serde_json::from_str(body)?)
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Settled result of one network operation, shared by all its subscribers
pub type FetchOutcome = Result<FetchResponse, QueryError>;

/// Executes queries against the network.
///
/// Implementations can use HTTP, a websocket, or an in-process schema.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn execute(
        &self,
        query: &QueryDescriptor,
        variables: &Value,
    ) -> Result<FetchResponse, BoxError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_with_errors_and_partial_data() {
        let response = FetchResponse::from_json(
            r#"{"data": {"dog": null}, "errors": [{"message": "not found", "path": ["dog"]}]}"#,
        )
        .unwrap();

        assert_eq!(response.data, Some(json!({"dog": null})));
        assert!(response.has_errors());
        assert_eq!(response.errors[0].message, "not found");
        assert_eq!(response.errors[0].path, vec![json!("dog")]);
    }

    #[test]
    fn test_from_json_rejects_malformed_body() {
        let err = FetchResponse::from_json("{not json").unwrap_err();
        assert!(matches!(err, QueryError::Serialization(_)));
    }
}
