//! # sandsign ネイティブ実行ユニット
//!
//! プロセス内のオブジェクト表を実行ユニットのメモリに見立て、
//! Ed25519演算を`ed25519-dalek`で行う。
//!
//! ## 暗号アルゴリズム
//! | 用途 | アルゴリズム |
//! |------|------------|
//! | キーペア導出 | Ed25519 (RFC 8032 シード展開) |
//! | 署名 | Ed25519 |
//! | 検証 | Ed25519 |

mod native;

pub use native::NativeUnit;

use ed25519_dalek::{Signer, Verifier};

pub use ed25519_dalek::{
    Signature as Ed25519Signature, SigningKey as Ed25519SigningKey,
    VerifyingKey as Ed25519VerifyingKey,
};

/// 暗号処理のエラー型
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// 公開鍵が曲線上の有効な点ではない
    #[error("Ed25519公開鍵が不正です")]
    InvalidPublicKey,
    /// Ed25519署名検証エラー
    #[error("Ed25519署名検証に失敗しました")]
    SignatureVerifyError,
}

/// 32バイトのシードから署名鍵を導出する。
pub fn ed25519_keypair_from_seed(seed: &[u8; 32]) -> Ed25519SigningKey {
    Ed25519SigningKey::from_bytes(seed)
}

/// Ed25519による署名。
pub fn ed25519_sign(signing_key: &Ed25519SigningKey, message: &[u8]) -> Ed25519Signature {
    signing_key.sign(message)
}

/// Ed25519による署名検証。
pub fn ed25519_verify(
    public_key: &[u8; 32],
    message: &[u8],
    signature: &[u8; 64],
) -> Result<(), CryptoError> {
    let verifying_key =
        Ed25519VerifyingKey::from_bytes(public_key).map_err(|_| CryptoError::InvalidPublicKey)?;
    let signature = Ed25519Signature::from_bytes(signature);
    verifying_key
        .verify(message, &signature)
        .map_err(|_| CryptoError::SignatureVerifyError)
}
