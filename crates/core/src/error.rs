//! # 署名APIのエラー型
//!
//! 入力検証エラーは境界を越える前に同期的に返す。
//! 境界エラーはその呼び出しに対して致命的で、リトライしない。

use sandsign_types::BoundaryError;

/// 署名ファサードのエラー型
#[derive(Debug, thiserror::Error)]
pub enum SignError {
    /// シードが32バイトではない
    #[error("シードは32バイトである必要があります（実際: {actual}バイト）")]
    InvalidSeedLength {
        /// 実際のバイト数
        actual: usize,
    },
    /// メッセージを受け付けられない（上限超過）
    #[error("メッセージが大きすぎます（{len}バイト, 上限: {max}バイト）")]
    InvalidMessage {
        /// メッセージのバイト数
        len: usize,
        /// 受け付ける最大バイト数
        max: usize,
    },
    /// 秘密鍵が32バイトではない
    #[error("秘密鍵は32バイトである必要があります（実際: {actual}バイト）")]
    InvalidSecretKeyLength {
        /// 実際のバイト数
        actual: usize,
    },
    /// 署名が64バイトではない
    #[error("署名は64バイトである必要があります（実際: {actual}バイト）")]
    InvalidSignatureLength {
        /// 実際のバイト数
        actual: usize,
    },
    /// 公開鍵が32バイトではない
    #[error("公開鍵は32バイトである必要があります（実際: {actual}バイト）")]
    InvalidPublicKeyLength {
        /// 実際のバイト数
        actual: usize,
    },
    /// 実行ユニット境界のエラー
    #[error(transparent)]
    Boundary(#[from] BoundaryError),
}

impl SignError {
    /// 入力検証エラーかどうか。検証エラーは境界に一切触れていない。
    pub fn is_validation(&self) -> bool {
        !matches!(self, SignError::Boundary(_))
    }
}
