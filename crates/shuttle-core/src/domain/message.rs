//! Message model: what the broker delivers and what the handler sees.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{MessageId, Receipt};

/// Opaque key/value metadata carried alongside the payload.
pub type MessageContext = BTreeMap<String, serde_json::Value>;

/// A message as owned by the broker.
///
/// The engine never persists state on the message itself. `retry_attempts`
/// only grows because the broker resubmits the message with the new count
/// when asked to reschedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub message_type: String,
    /// Payload, already decoded by the adapter's codec.
    pub content: Vec<u8>,
    pub content_type: String,
    #[serde(default)]
    pub context: MessageContext,
    #[serde(default)]
    pub retry_attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Message {
    /// New message with a system-generated id and zero attempts.
    pub fn new(message_type: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            id: MessageId::generate(),
            message_type: message_type.into(),
            content: content.into(),
            content_type: "application/octet-stream".to_string(),
            context: MessageContext::new(),
            retry_attempts: 0,
            created_at: Utc::now(),
            signature: None,
        }
    }

    /// JSON payload helper.
    pub fn json(message_type: impl Into<String>, value: &serde_json::Value) -> Self {
        let mut message = Self::new(message_type, value.to_string().into_bytes());
        message.content_type = "application/json".to_string();
        message
    }

    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    pub fn with_retry_attempts(mut self, retry_attempts: u32) -> Self {
        self.retry_attempts = retry_attempts;
        self
    }
}

/// One delivery of a message: the message plus the broker handle used to
/// ack/reschedule/remove exactly this delivery.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    pub receipt: Receipt,
}

impl Delivery {
    pub fn new(message: Message, receipt: Receipt) -> Self {
        Self { message, receipt }
    }

    pub fn id(&self) -> &MessageId {
        &self.message.id
    }
}

/// Handler-facing view of a delivery.
///
/// Built fresh for every dispatch and thrown away after the handler returns.
/// The two outcome flags are the only fields a handler is expected to write:
/// - `abort`: treat the delivery as failed even though the handler returned `Ok`.
/// - `drop`: remove the message for good, no retry.
#[derive(Debug, Clone)]
pub struct MessageArgs {
    pub id: MessageId,
    pub message_type: String,
    pub retry_attempts: u32,
    pub context: MessageContext,
    pub content_type: String,
    pub sent_at: DateTime<Utc>,
    pub abort: bool,
    pub drop: bool,
}

impl MessageArgs {
    pub fn from_message(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            message_type: message.message_type.clone(),
            retry_attempts: message.retry_attempts,
            context: message.context.clone(),
            content_type: message.content_type.clone(),
            sent_at: message.created_at,
            abort: false,
            drop: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_mirror_message_and_start_unflagged() {
        let message = Message::json("greet", &serde_json::json!({"name": "shuttle"}))
            .with_id("m-1")
            .with_context("tenant", serde_json::json!("acme"))
            .with_retry_attempts(3);

        let args = MessageArgs::from_message(&message);
        assert_eq!(args.id.as_str(), "m-1");
        assert_eq!(args.message_type, "greet");
        assert_eq!(args.retry_attempts, 3);
        assert_eq!(args.content_type, "application/json");
        assert_eq!(args.context["tenant"], "acme");
        assert!(!args.abort);
        assert!(!args.drop);
    }

    #[test]
    fn message_json_roundtrip_keeps_missing_signature_absent() {
        let message = Message::new("raw", b"abc".to_vec()).with_id("m-2");
        let s = serde_json::to_string(&message).unwrap();
        let v: serde_json::Value = serde_json::from_str(&s).unwrap();
        assert!(v.get("signature").is_none());

        let back: Message = serde_json::from_str(&s).unwrap();
        assert_eq!(back, message);
    }
}
