//! SignatureVerifier port
//!
//! 署名アルゴリズム自体はスコープ外。パイプラインは「検証できたか」だけを見ます。

use crate::domain::Message;

pub trait SignatureVerifier: Send + Sync {
    /// `true` when `signature` is valid for `message`.
    fn verify(&self, message: &Message, signature: &str) -> bool;
}
