//! # sandsign 共有型定義
//!
//! 署名境界の両側（ファサードと実行ユニット）で共有するデータ構造と契約を提供する。
//!
//! ## 固定長
//! | 値 | バイト数 |
//! |----|---------|
//! | シード（秘密鍵） | 32 |
//! | 公開鍵 | 32 |
//! | 署名 | 64 |
//!
//! ## エンコーディング規則
//! - serde経由のバイト列は小文字16進数文字列で表現する。

pub mod config;
pub mod error;
pub mod unit;

pub use config::BoundaryConfig;
pub use error::BoundaryError;
pub use unit::{ExecutionUnit, RawHandle};

use serde::{Deserialize, Serialize};

/// シード（秘密鍵）のバイト数
pub const SECRET_KEY_BYTES: usize = 32;
/// 公開鍵のバイト数
pub const PUBLIC_KEY_BYTES: usize = 32;
/// 署名のバイト数
pub const SIGNATURE_BYTES: usize = 64;

/// 固定長バイト列への変換で長さが一致しなかったことを示すエラー。
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{expected}バイトを期待しましたが{actual}バイトでした")]
pub struct InvalidLength {
    /// 期待したバイト数
    pub expected: usize,
    /// 実際のバイト数
    pub actual: usize,
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], InvalidLength> {
    bytes.try_into().map_err(|_| InvalidLength {
        expected: N,
        actual: bytes.len(),
    })
}

// ---------------------------------------------------------------------------
// シード
// ---------------------------------------------------------------------------

/// 32バイトのシード。実行ユニット側でキーペアに展開される。
///
/// 署名スカラーそのものではない。`Debug`出力では中身を伏せる。
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretKeySeed(#[serde(with = "hex::serde")] [u8; SECRET_KEY_BYTES]);

impl SecretKeySeed {
    /// バイト配列からシードを作成する。
    pub fn from_bytes(bytes: [u8; SECRET_KEY_BYTES]) -> Self {
        Self(bytes)
    }

    /// シードのバイト列を参照する。
    pub fn as_bytes(&self) -> &[u8; SECRET_KEY_BYTES] {
        &self.0
    }
}

impl TryFrom<&[u8]> for SecretKeySeed {
    type Error = InvalidLength;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        fixed(bytes).map(Self)
    }
}

impl AsRef<[u8]> for SecretKeySeed {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SecretKeySeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKeySeed(..)")
    }
}

// ---------------------------------------------------------------------------
// 公開鍵
// ---------------------------------------------------------------------------

/// 32バイトの公開鍵。ホストメモリへエクスポートされた後は自由に共有できる。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicKey(#[serde(with = "hex::serde")] [u8; PUBLIC_KEY_BYTES]);

impl PublicKey {
    /// バイト配列から公開鍵を作成する。
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_BYTES]) -> Self {
        Self(bytes)
    }

    /// 公開鍵のバイト列を参照する。
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_BYTES] {
        &self.0
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = InvalidLength;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        fixed(bytes).map(Self)
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// 署名
// ---------------------------------------------------------------------------

/// 64バイトの署名。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(#[serde(with = "hex::serde")] [u8; SIGNATURE_BYTES]);

impl Signature {
    /// バイト配列から署名を作成する。
    pub fn from_bytes(bytes: [u8; SIGNATURE_BYTES]) -> Self {
        Self(bytes)
    }

    /// 署名のバイト列を参照する。
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_BYTES] {
        &self.0
    }
}

impl TryFrom<&[u8]> for Signature {
    type Error = InvalidLength;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        fixed(bytes).map(Self)
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// キーペア（ホスト側の結果）
// ---------------------------------------------------------------------------

/// `key_pair`の戻り値。シードと、そこから導出した公開鍵の組。
///
/// 実行ユニット内のキーペアオブジェクトはこの値を返す前に解放済み。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    /// 入力または生成されたシード
    pub secret_key: SecretKeySeed,
    /// シードから導出された公開鍵
    pub public_key: PublicKey,
}
