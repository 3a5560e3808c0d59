use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub operation: String,
    #[serde(default)]
    #[allow(dead_code)]
    pub transfers: Option<Vec<String>>,
    pub objects: Vec<ObjectSpec>,
    #[serde(default)]
    #[allow(dead_code)]
    pub hash_algo: Option<String>,
    /// Browsers always send Content-Type; it must then be part of the
    /// presigned signature.
    #[serde(default)]
    pub is_browser: bool,
}

#[derive(Debug, Deserialize)]
pub struct ObjectSpec {
    pub oid: String,
    pub size: i64,
}

/// Null fields must be omitted on the wire; git-lfs clients reject them.
#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub transfer: &'static str,
    pub objects: Vec<ObjectResponse>,
    pub hash_algo: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ObjectResponse {
    pub oid: String,
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authenticated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<HashMap<String, Action>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ObjectError>,
}

impl ObjectResponse {
    #[must_use]
    pub fn exists(oid: String, size: i64) -> Self {
        Self {
            oid,
            size,
            authenticated: Some(true),
            actions: None,
            error: None,
        }
    }

    #[must_use]
    pub fn with_actions(oid: String, size: i64, actions: HashMap<String, Action>) -> Self {
        Self {
            oid,
            size,
            authenticated: Some(true),
            actions: Some(actions),
            error: None,
        }
    }

    #[must_use]
    pub fn with_error(oid: String, size: i64, code: i32, message: impl Into<String>) -> Self {
        Self {
            oid,
            size,
            authenticated: None,
            actions: None,
            error: Some(ObjectError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Action {
    pub href: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

/// `{code, message}` with an HTTP status as the integer code.
#[derive(Debug, Serialize)]
pub struct ObjectError {
    pub code: i32,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_fields_are_omitted() {
        let response = BatchResponse {
            transfer: "basic",
            objects: vec![ObjectResponse::exists("a".repeat(64), 5)],
            hash_algo: "sha256",
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("actions"));
        assert!(!json.contains("error"));
        assert!(json.contains("\"transfer\":\"basic\""));
        assert!(json.contains("\"hash_algo\":\"sha256\""));
    }

    #[test]
    fn error_objects_carry_code_and_message() {
        let object = ObjectResponse::with_error("a".repeat(64), 5, 404, "Object not found");
        let json = serde_json::to_value(&object).unwrap();
        assert_eq!(json["error"]["code"], 404);
        assert_eq!(json["error"]["message"], "Object not found");
        assert!(json.get("actions").is_none());
    }
}
