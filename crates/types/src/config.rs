//! # 境界設定
//!
//! 環境変数からの設定読み込み。

use serde::Deserialize;

use crate::error::BoundaryError;

/// wasmの1ページのバイト数
pub const WASM_PAGE_BYTES: usize = 65536;

/// 実行ユニットと境界の設定。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BoundaryConfig {
    /// 実行ユニットのメモリ上限（バイト）
    pub heap_bytes: usize,
    /// プリミティブ呼び出し1回あたりのFuel上限（wasmのみ、`None`で無制限）
    pub fuel_limit: Option<u64>,
    /// 受け付けるメッセージの最大長（バイト）
    pub max_message_bytes: usize,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            heap_bytes: WASM_PAGE_BYTES * 4096,
            fuel_limit: Some(10_000_000_000),
            max_message_bytes: 64 * 1024 * 1024,
        }
    }
}

impl BoundaryConfig {
    /// 環境変数でデフォルト値を上書きした設定を返す。
    ///
    /// - `SANDSIGN_HEAP_BYTES`
    /// - `SANDSIGN_FUEL_LIMIT`（`0`でFuel計測を無効化）
    /// - `SANDSIGN_MAX_MESSAGE_BYTES`
    pub fn from_env() -> Result<Self, BoundaryError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 任意の参照関数から設定を組み立てる。
    pub fn from_lookup<F>(lookup: F) -> Result<Self, BoundaryError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(v) = lookup("SANDSIGN_HEAP_BYTES") {
            config.heap_bytes = parse("SANDSIGN_HEAP_BYTES", &v)?;
        }
        if let Some(v) = lookup("SANDSIGN_FUEL_LIMIT") {
            let fuel: u64 = parse("SANDSIGN_FUEL_LIMIT", &v)?;
            config.fuel_limit = (fuel > 0).then_some(fuel);
        }
        if let Some(v) = lookup("SANDSIGN_MAX_MESSAGE_BYTES") {
            config.max_message_bytes = parse("SANDSIGN_MAX_MESSAGE_BYTES", &v)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// 設定値の整合性を確認する。
    pub fn validate(&self) -> Result<(), BoundaryError> {
        if self.heap_bytes == 0 {
            return Err(BoundaryError::Config("heap_bytesは1以上が必要です".to_string()));
        }
        if self.max_message_bytes >= self.heap_bytes {
            return Err(BoundaryError::Config(format!(
                "max_message_bytes ({}) はheap_bytes ({}) 未満である必要があります",
                self.max_message_bytes, self.heap_bytes
            )));
        }
        Ok(())
    }

    /// `heap_bytes`をwasmページ数に切り上げる。
    pub fn pages(&self) -> u64 {
        ((self.heap_bytes as u64) + 0xffff) >> 16
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, BoundaryError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| BoundaryError::Config(format!("{key}={value}: {e}")))
}
