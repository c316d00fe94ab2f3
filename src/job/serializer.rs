use std::any::Any;

use crate::error::{DbspError, Result};
use crate::job::{Message, Serializer};
use crate::proto::WirePayload;

const JSON_TYPE_NAME: &str = "json";

/// Serializes [`serde_json::Value`] messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, message: &(dyn Any + Send)) -> Result<WirePayload> {
        let value = message.downcast_ref::<serde_json::Value>().ok_or_else(|| {
            DbspError::Internal("JSON serializer only accepts serde_json::Value messages".to_string())
        })?;
        Ok(WirePayload {
            type_name: JSON_TYPE_NAME.to_string(),
            value: serde_json::to_vec(value)?,
        })
    }

    fn unserialize(&self, payload: &WirePayload) -> Result<Message> {
        if payload.type_name != JSON_TYPE_NAME {
            return Err(DbspError::ProtocolViolation(format!(
                "unsupported payload type {:?}",
                payload.type_name
            )));
        }
        let value: serde_json::Value = serde_json::from_slice(&payload.value)?;
        Ok(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_foreign_types() {
        let err = JsonSerializer.serialize(&42u32).unwrap_err();
        assert!(matches!(err, DbspError::Internal(_)));

        let payload = WirePayload {
            type_name: "protobuf".to_string(),
            value: Vec::new(),
        };
        assert!(matches!(
            JsonSerializer.unserialize(&payload),
            Err(DbspError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn restores_json_values() {
        let payload = JsonSerializer.serialize(&json!({"rank": 0.25})).unwrap();
        let message = JsonSerializer.unserialize(&payload).unwrap();
        let value = message.downcast::<serde_json::Value>().unwrap();
        assert_eq!(*value, json!({"rank": 0.25}));
    }
}
