//! Domain identifiers (strongly-typed IDs).
//!
//! # MessageId
//! メッセージ ID は呼び出し側が付与することもあれば、システムが生成することもあります。
//! そのため型パラメータ付きの ID ではなく、内部表現は `String` です。
//! システム生成の場合は ULID を使います（時刻でソート可能・分散生成可能）。
//!
//! # Receipt
//! ブローカーが配送ごとに発行するハンドル（SQS の receipt handle, AMQP の delivery tag など）。
//! 同じメッセージでも再配送のたびに変わります。

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Identity of a logical message. Stable across redeliveries; this is the
/// key the dedup lock is taken on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// System-generated id (ULID text form).
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Broker handle for one delivery of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Receipt(String);

impl Receipt {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "receipt-{}", self.0)
    }
}
