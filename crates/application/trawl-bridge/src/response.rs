//! Bridge responses
//!
//! A response is a flat JSON object: `{"success": true, ...payload}` or
//! `{"success": false, "error": "<code>", "message": "<text>"}`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use trawl_core::{ErrorCode, TrawlError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Response(Map<String, Value>);

impl Response {
    pub fn ok() -> Self {
        let mut map = Map::new();
        map.insert("success".into(), Value::Bool(true));
        Self(map)
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert("success".into(), Value::Bool(false));
        map.insert("error".into(), Value::String(code.as_str().to_string()));
        map.insert("message".into(), Value::String(message.into()));
        Self(map)
    }

    /// Add a payload field. A value that cannot be serialized turns the
    /// response into an `Internal` failure.
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        if !self.is_success() {
            return self;
        }
        match serde_json::to_value(value) {
            Ok(value) => {
                self.0.insert(key.to_string(), value);
                self
            }
            Err(err) => Self::error(ErrorCode::Internal, format!("cannot encode {key}: {err}")),
        }
    }

    /// Echo a request id back to the caller.
    pub fn with_id(mut self, id: Value) -> Self {
        self.0.insert("id".into(), id);
        self
    }

    pub fn is_success(&self) -> bool {
        self.0.get("success").and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.0.get("error").cloned().and_then(|code| serde_json::from_value(code).ok())
    }

    pub fn message(&self) -> Option<&str> {
        self.0.get("message").and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Decode a payload field.
    pub fn field<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.0.get(key).cloned().and_then(|value| serde_json::from_value(value).ok())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<TrawlError> for Response {
    fn from(err: TrawlError) -> Self {
        Self::error(err.code(), err.to_string())
    }
}

impl<T: Serialize> From<trawl_core::Result<T>> for Response {
    /// Successful results land under `data`.
    fn from(result: trawl_core::Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok().with("data", data),
            Err(err) => err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_is_flat() {
        let response = Response::ok().with("port", 8080).with("enabled", true);
        assert_eq!(response.into_value(), json!({"success": true, "port": 8080, "enabled": true}));
    }

    #[test]
    fn test_error_shape() {
        let response = Response::from(TrawlError::NotFound("No item numbered 7".into()));
        assert!(!response.is_success());
        assert_eq!(response.error_code(), Some(ErrorCode::NotFound));
        let value = response.into_value();
        assert_eq!(value["error"], "NotFound");
        assert!(value["message"].as_str().unwrap().contains("7"));
    }

    #[test]
    fn test_result_lands_under_data() {
        let response = Response::from(Ok::<_, TrawlError>(vec![1, 2, 3]));
        assert_eq!(response.field::<Vec<u32>>("data"), Some(vec![1, 2, 3]));

        let response = Response::from(Err::<u8, _>(TrawlError::ResourceBusy("eth0".into())));
        assert_eq!(response.error_code(), Some(ErrorCode::ResourceBusy));
        assert!(response.with("ignored", 1).get("ignored").is_none());
    }

    #[test]
    fn test_id_echo() {
        let response = Response::ok().with_id(json!(42));
        assert_eq!(response.get("id"), Some(&json!(42)));
        let back: Response = serde_json::from_str(&serde_json::to_string(&response).unwrap()).unwrap();
        assert_eq!(back, response);
    }
}
