use serde::{Deserialize, Serialize};

use strata_core::types::SessionId;

/// A message sent by a client, dispatched by its `type`.
#[derive(Debug, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Reply to one inbound message.
#[derive(Debug, Serialize, Deserialize)]
pub struct ServerResponse {
    #[serde(rename = "type")]
    pub frame_type: String,
    /// Type of the message being answered.
    pub reply_to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl ServerResponse {
    pub fn ok(reply_to: &str, request_id: Option<String>, result: serde_json::Value) -> Self {
        Self {
            frame_type: "response".to_string(),
            reply_to: reply_to.to_string(),
            request_id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(
        reply_to: &str,
        request_id: Option<String>,
        code: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            frame_type: "response".to_string(),
            reply_to: reply_to.to_string(),
            request_id,
            result: None,
            error: Some(ErrorPayload {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Coalesced outbound messages for one session.
#[derive(Debug, Serialize, Deserialize)]
pub struct BatchFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub session_id: SessionId,
    pub count: usize,
    pub messages: Vec<serde_json::Value>,
}

impl BatchFrame {
    pub fn new(session_id: SessionId, messages: Vec<serde_json::Value>) -> Self {
        Self {
            frame_type: "batch".to_string(),
            session_id,
            count: messages.len(),
            messages,
        }
    }
}

/// Server-initiated notice sent to every live connection.
#[derive(Debug, Serialize)]
pub struct SystemNotice {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub event: String,
    pub data: serde_json::Value,
}

impl SystemNotice {
    pub fn new(event: &str, data: serde_json::Value) -> Self {
        Self {
            frame_type: "system".to_string(),
            event: event.to_string(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_defaults() {
        let msg: InboundMessage = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(msg.kind, "heartbeat");
        assert!(msg.request_id.is_none());
        assert!(msg.data.is_null());
    }

    #[test]
    fn test_response_omits_empty_fields() {
        let json = serde_json::to_value(ServerResponse::ok("sync", None, serde_json::json!([]))).unwrap();
        assert_eq!(json["type"], "response");
        assert_eq!(json["reply_to"], "sync");
        assert!(json.get("request_id").is_none());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_batch_frame_counts_messages() {
        let frame = BatchFrame::new(SessionId::from_string("s"), vec![serde_json::json!(1); 3]);
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "batch");
        assert_eq!(json["count"], 3);
        assert_eq!(json["session_id"], "s");
    }
}
