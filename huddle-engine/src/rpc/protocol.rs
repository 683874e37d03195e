//! RPC wire messages
//!
//! JSON envelopes carried on `{prefix}.rpc.request` / `{prefix}.rpc.response`.

use crate::error::EngineError;
use huddle_model::PeerId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Payload field a caller sets to make a retried request safe to repeat.
pub const IDEMPOTENCY_KEY_FIELD: &str = "idempotency_key";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub request_id: Uuid,
    pub operation: String,
    pub payload: Value,
    /// Claimed caller. The authority checks it against the transport sender.
    pub caller: PeerId,
    /// Authority the request is addressed to.
    pub target: PeerId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub request_id: Uuid,
    /// The original caller.
    pub target: PeerId,
    pub result: RpcResult,
}

/// Wire-level error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    PermissionDenied,
    UnknownOperation,
    InvalidPayload,
    WriteRejected,
    NotAuthority,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::UnknownOperation => "unknown_operation",
            ErrorCode::InvalidPayload => "invalid_payload",
            ErrorCode::WriteRejected => "write_rejected",
            ErrorCode::NotAuthority => "not_authority",
            ErrorCode::Internal => "internal",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFailure {
    pub code: ErrorCode,
    pub message: String,
}

/// Structured `{success, error?, data?}` handler result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcResult {
    pub fn ok(data: Value) -> Self {
        Self { success: true, error: None, data: Some(data) }
    }

    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(RpcFailure { code, message: message.into() }),
            data: None,
        }
    }

    pub fn from_handler(result: Result<Value, EngineError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => {
                let code = match &e {
                    EngineError::PermissionDenied(_) => ErrorCode::PermissionDenied,
                    EngineError::UnknownOperation(_) => ErrorCode::UnknownOperation,
                    EngineError::InvalidPayload(_) | EngineError::Serialization(_) => ErrorCode::InvalidPayload,
                    EngineError::WriteRejected(_) => ErrorCode::WriteRejected,
                    _ => ErrorCode::Internal,
                };
                let message = match e {
                    EngineError::PermissionDenied(m)
                    | EngineError::UnknownOperation(m)
                    | EngineError::InvalidPayload(m)
                    | EngineError::WriteRejected(m) => m,
                    other => other.to_string(),
                };
                Self::failure(code, message)
            }
        }
    }

    /// Lift back into a typed result on the caller side.
    pub fn into_result(self) -> Result<Value, EngineError> {
        if self.success {
            return Ok(self.data.unwrap_or(Value::Null));
        }
        let failure = self.error.unwrap_or(RpcFailure {
            code: ErrorCode::Internal,
            message: "failure without error detail".into(),
        });
        Err(match failure.code {
            ErrorCode::PermissionDenied => EngineError::PermissionDenied(failure.message),
            ErrorCode::UnknownOperation => EngineError::UnknownOperation(failure.message),
            ErrorCode::InvalidPayload => EngineError::InvalidPayload(failure.message),
            ErrorCode::WriteRejected => EngineError::WriteRejected(failure.message),
            code => EngineError::Remote { code, message: failure.message },
        })
    }
}

/// Dedupe key: operation name followed by the serialized payload.
///
/// `serde_json` maps serialize with sorted keys, so equal payloads always
/// produce equal keys.
pub fn dedupe_key(operation: &str, payload: &Value) -> Result<String, EngineError> {
    Ok(format!("{}{}", operation, serde_json::to_string(payload)?))
}

/// The idempotency key carried in a payload, if any.
pub fn idempotency_key(payload: &Value) -> Option<&str> {
    payload.get(IDEMPOTENCY_KEY_FIELD)?.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dedupe_key_ignores_field_order() {
        let a = json!({"delta": 1, "counter": "pool"});
        let b: Value = serde_json::from_str(r#"{"counter":"pool","delta":1}"#).unwrap();
        assert_eq!(dedupe_key("counter.change", &a).unwrap(), dedupe_key("counter.change", &b).unwrap());
        assert_ne!(
            dedupe_key("counter.change", &a).unwrap(),
            dedupe_key("counter.set", &a).unwrap()
        );
    }

    #[test]
    fn test_result_wire_shape() {
        let ok = serde_json::to_value(RpcResult::ok(json!(7))).unwrap();
        assert_eq!(ok, json!({"success": true, "data": 7}));

        let denied = RpcResult::from_handler(Err(EngineError::PermissionDenied("not yours".into())));
        assert_eq!(
            serde_json::to_value(&denied).unwrap(),
            json!({"success": false, "error": {"code": "permission_denied", "message": "not yours"}})
        );
        assert_eq!(denied.into_result(), Err(EngineError::PermissionDenied("not yours".into())));
    }

    #[test]
    fn test_internal_failure_becomes_remote() {
        let result = RpcResult::from_handler(Err(EngineError::Shutdown));
        assert_eq!(
            result.into_result(),
            Err(EngineError::Remote { code: ErrorCode::Internal, message: "session shut down".into() })
        );
    }

    #[test]
    fn test_idempotency_key_lookup() {
        assert_eq!(idempotency_key(&json!({"idempotency_key": "k1"})), Some("k1"));
        assert_eq!(idempotency_key(&json!({"idempotency_key": 5})), None);
        assert_eq!(idempotency_key(&json!(3)), None);
    }
}
