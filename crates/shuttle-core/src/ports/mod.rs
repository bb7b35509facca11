//! Ports - 外部コラボレータへの狭いインターフェース
//!
//! ブローカー固有の処理（fetch/ack/再配送）、dedup 用の KV ストア、署名検証、
//! 乱数（jitter）はすべて trait の向こう側に置き、パイプラインとスーパーバイザは
//! ここにある trait だけに依存します。

pub mod broker;
pub mod jitter;
pub mod nonce_store;
pub mod signature;

pub use self::broker::{BrokerAdapter, BrokerClient, MAX_VISIBILITY_TIMEOUT_SECS};
pub use self::jitter::{FixedJitter, JitterSource, ThreadRngJitter};
pub use self::nonce_store::NonceStore;
pub use self::signature::SignatureVerifier;
