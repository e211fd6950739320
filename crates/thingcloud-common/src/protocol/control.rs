use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::TenantId;
use crate::error::{CloudError, Result};

/// Control frames exchanged before a connection has picked its role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "control", rename_all = "kebab-case")]
pub enum ControlFrame {
    Auth {
        token: String,
    },
    Direct {
        target: TenantId,
        #[serde(rename = "replyId")]
        reply_id: String,
    },
    Master,
    Ready {
        #[serde(rename = "rpcId")]
        rpc_id: String,
    },
    NewObject,
}

impl ControlFrame {
    /// Parses a frame, rejecting anything that is not a known control frame.
    pub fn from_value(value: Value) -> Result<Self> {
        if value.get("control").is_none() {
            return Err(CloudError::Protocol("expected a control frame".to_string()));
        }
        serde_json::from_value(value)
            .map_err(|e| CloudError::Protocol(format!("invalid control frame: {}", e)))
    }
}

/// `{error, code?}` frame sent before closing a control connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorFrame {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorFrame {
    pub fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: Some(code.into()),
        }
    }

    /// Recognizes an error frame among other control traffic.
    pub fn from_value(value: &Value) -> Option<Self> {
        value.get("error")?;
        serde_json::from_value(value.clone()).ok()
    }
}

impl From<&CloudError> for ErrorFrame {
    fn from(err: &CloudError) -> Self {
        Self::new(err.to_string(), err.code())
    }
}

impl From<ErrorFrame> for CloudError {
    fn from(frame: ErrorFrame) -> Self {
        CloudError::Remote {
            message: frame.error,
            code: frame.code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_control_frame_wire_names() {
        let direct = ControlFrame::Direct {
            target: 12,
            reply_id: "4".into(),
        };
        assert_eq!(
            serde_json::to_value(&direct).unwrap(),
            json!({"control": "direct", "target": 12, "replyId": "4"})
        );
        assert_eq!(
            serde_json::to_value(ControlFrame::NewObject).unwrap(),
            json!({"control": "new-object"})
        );
        assert_eq!(
            ControlFrame::from_value(json!({"control": "master"})).unwrap(),
            ControlFrame::Master
        );
    }

    #[test]
    fn test_unknown_control_frame_is_protocol_error() {
        let err = ControlFrame::from_value(json!({"control": "bogus"})).unwrap_err();
        assert!(matches!(err, CloudError::Protocol(_)));
        let err = ControlFrame::from_value(json!({"rpc": "call"})).unwrap_err();
        assert!(matches!(err, CloudError::Protocol(_)));
    }

    #[test]
    fn test_error_frame() {
        let frame = ErrorFrame::from(&CloudError::Authentication("invalid authentication token".into()));
        assert_eq!(frame.code.as_deref(), Some("EPERM"));
        assert!(ErrorFrame::from_value(&json!({"control": "ready", "rpcId": "1"})).is_none());

        let parsed = ErrorFrame::from_value(&json!({"error": "nope"})).unwrap();
        assert_eq!(parsed.code, None);
        let err: CloudError = parsed.into();
        assert_eq!(err.code(), "EREMOTE");
    }
}
