//! # 署名ファサード
//!
//! `key_pair` / `sign` / `verify` の3操作を提供する。
//!
//! - 入力検証はすべて境界に触れる前に行う（検証エラー時はインポートが発生しない）
//! - 各呼び出しはアリーナのロックを保持したまま
//!   インポート→プリミティブ→エクスポート→解放を完了する
//! - 解放に失敗したハンドルがあれば、成功した結果の代わりに`ReleaseFailed`を返す
//! - キーペアは呼び出しごとにシードから再導出し、キャッシュしない
//!   （導出済み秘密素材は呼び出しをまたいで実行ユニットに残らない）

use std::sync::{Mutex, MutexGuard, PoisonError};

use rand::RngCore;
use sandsign_types::{
    BoundaryConfig, BoundaryError, ExecutionUnit, KeyPair, PublicKey, SecretKeySeed, Signature,
    PUBLIC_KEY_BYTES, SECRET_KEY_BYTES, SIGNATURE_BYTES,
};

use crate::arena::Arena;
use crate::error::SignError;

/// 署名ファサード。1つの実行ユニットを所有し、全操作を直列化する。
///
/// 並列に処理したい場合はワーカーごとに`SigningFacade`を作る。
pub struct SigningFacade<U: ExecutionUnit> {
    arena: Mutex<Arena<U>>,
    config: BoundaryConfig,
}

impl<U: ExecutionUnit> SigningFacade<U> {
    /// 実行ユニットからファサードを作成する。
    pub fn new(unit: U, config: BoundaryConfig) -> Self {
        Self {
            arena: Mutex::new(Arena::new(unit)),
            config,
        }
    }

    /// 設定を返す。
    pub fn config(&self) -> &BoundaryConfig {
        &self.config
    }

    /// シードからキーペアを導出する。`None`なら新しいシードをOSの乱数源から生成する。
    pub fn key_pair(&self, seed: Option<&[u8]>) -> Result<KeyPair, SignError> {
        let secret_key = match seed {
            Some(bytes) => SecretKeySeed::try_from(bytes)
                .map_err(|e| SignError::InvalidSeedLength { actual: e.actual })?,
            None => random_seed(),
        };

        let public_key = self.run(|arena| {
            tracing::debug!(unit = arena.unit_type(), generated = seed.is_none(), "key_pair");

            let seed = arena.import(secret_key.as_bytes())?;
            let keypair = arena.keypair_from_seed(&seed)?;
            let public_key = arena.public_key(&keypair)?;
            let public_key = arena.export_fixed::<PUBLIC_KEY_BYTES>(&public_key)?;
            Ok(PublicKey::from_bytes(public_key))
        })?;

        Ok(KeyPair {
            secret_key,
            public_key,
        })
    }

    /// シードから再導出したキーペアでメッセージに署名する。
    pub fn sign(&self, message: &[u8], secret_key: &[u8]) -> Result<Signature, SignError> {
        self.check_message(message)?;
        let secret_key = SecretKeySeed::try_from(secret_key)
            .map_err(|e| SignError::InvalidSecretKeyLength { actual: e.actual })?;

        self.run(|arena| {
            tracing::debug!(unit = arena.unit_type(), message_len = message.len(), "sign");

            let message = arena.import(message)?;
            let seed = arena.import(secret_key.as_bytes())?;
            let keypair = arena.keypair_from_seed(&seed)?;
            let signature = arena.sign(&message, &keypair)?;
            let signature = arena.export_fixed::<SIGNATURE_BYTES>(&signature)?;
            Ok(Signature::from_bytes(signature))
        })
    }

    /// 署名を検証する。戻り値は厳密な`bool`。
    pub fn verify(
        &self,
        message: &[u8],
        signature: &[u8],
        public_key: &[u8],
    ) -> Result<bool, SignError> {
        self.check_message(message)?;
        if signature.len() != SIGNATURE_BYTES {
            return Err(SignError::InvalidSignatureLength {
                actual: signature.len(),
            });
        }
        if public_key.len() != PUBLIC_KEY_BYTES {
            return Err(SignError::InvalidPublicKeyLength {
                actual: public_key.len(),
            });
        }

        self.run(|arena| {
            tracing::debug!(unit = arena.unit_type(), message_len = message.len(), "verify");

            let message = arena.import(message)?;
            let signature = arena.import(signature)?;
            let public_key = arena.import(public_key)?;
            let verified = arena.verify(&signature, &message, &public_key)?;
            Ok(verified)
        })
    }

    /// 未解放のハンドル数。実行ユニットが解放に失敗しない限り、呼び出しの合間は0。
    pub fn outstanding_handles(&self) -> usize {
        self.lock().outstanding()
    }

    /// 解放に失敗したハンドルを再解放する。
    pub fn reclaim_leaked(&self) -> Result<(), SignError> {
        Ok(self.lock().reclaim()?)
    }

    /// 実行ユニット内の生存オブジェクト数（数えられるユニットのみ）。
    pub fn live_objects(&self) -> Option<usize> {
        self.lock().live_objects()
    }

    /// ファサードを分解して実行ユニットを取り出す。
    pub fn into_unit(self) -> U {
        self.arena
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_inner()
    }

    /// ロックを取り、操作を実行する。操作中のハンドルは`op`の終了時に解放済み。
    fn run<T>(
        &self,
        op: impl FnOnce(&Arena<U>) -> Result<T, SignError>,
    ) -> Result<T, SignError> {
        let arena = self.lock();
        let result = op(&*arena);
        let failures = arena.take_release_failures();
        let value = result?;
        if failures > 0 {
            return Err(BoundaryError::ReleaseFailed { count: failures }.into());
        }
        Ok(value)
    }

    fn check_message(&self, message: &[u8]) -> Result<(), SignError> {
        if message.len() > self.config.max_message_bytes {
            return Err(SignError::InvalidMessage {
                len: message.len(),
                max: self.config.max_message_bytes,
            });
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Arena<U>> {
        // パニックした呼び出しのハンドルは巻き戻し中に解放済み
        self.arena.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("アリーナのロックが汚染されていたため回復しました");
            poisoned.into_inner()
        })
    }
}

#[cfg(feature = "native")]
impl SigningFacade<sandsign_crypto::NativeUnit> {
    /// ネイティブ実行ユニットでファサードを作成する。
    pub fn native(config: BoundaryConfig) -> Result<Self, SignError> {
        config.validate()?;
        let unit = sandsign_crypto::NativeUnit::new(&config);
        Ok(Self::new(unit, config))
    }
}

#[cfg(feature = "wasm")]
impl SigningFacade<sandsign_wasm_host::WasmUnit> {
    /// ゲストモジュールをwasmtimeで起動してファサードを作成する。
    pub fn wasm(module: &[u8], config: BoundaryConfig) -> Result<Self, SignError> {
        let unit = sandsign_wasm_host::WasmUnit::new(module, &config)?;
        Ok(Self::new(unit, config))
    }
}

/// OSの乱数源から32バイトのシードを生成する。
fn random_seed() -> SecretKeySeed {
    let mut bytes = [0u8; SECRET_KEY_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    SecretKeySeed::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandsign_crypto::NativeUnit;

    fn facade() -> SigningFacade<NativeUnit> {
        SigningFacade::new(NativeUnit::default(), BoundaryConfig::default())
    }

    /// 検証エラーは境界に触れない
    #[test]
    fn test_validation_happens_before_import() {
        let f = facade();
        let err = f.sign(b"m", &[0u8; 31]).unwrap_err();
        assert!(matches!(err, SignError::InvalidSecretKeyLength { actual: 31 }));
        assert!(err.is_validation());

        let err = f.verify(b"m", &[0u8; 63], &[0u8; 32]).unwrap_err();
        assert!(matches!(err, SignError::InvalidSignatureLength { actual: 63 }));

        let err = f.verify(b"m", &[0u8; 64], &[0u8; 33]).unwrap_err();
        assert!(matches!(err, SignError::InvalidPublicKeyLength { actual: 33 }));

        let err = f.key_pair(Some(&[0u8; 16][..])).unwrap_err();
        assert!(matches!(err, SignError::InvalidSeedLength { actual: 16 }));

        assert_eq!(f.outstanding_handles(), 0);
        let unit = f.into_unit();
        assert_eq!(unit.used_bytes(), 0);
    }

    /// 署名長と公開鍵長が両方誤っている場合は署名長のエラーが先に返る
    #[test]
    fn test_signature_length_checked_first() {
        let f = facade();
        let err = f.verify(b"m", &[0u8; 10], &[0u8; 10]).unwrap_err();
        assert!(matches!(err, SignError::InvalidSignatureLength { .. }));
    }

    /// メッセージ上限を超えるとInvalidMessage
    #[test]
    fn test_message_limit() {
        let config = BoundaryConfig {
            max_message_bytes: 8,
            ..Default::default()
        };
        let f = SigningFacade::new(NativeUnit::default(), config);
        let kp = f.key_pair(None).unwrap();

        let err = f.sign(&[0u8; 9], kp.secret_key.as_bytes()).unwrap_err();
        assert!(matches!(err, SignError::InvalidMessage { len: 9, max: 8 }));
        let err = f
            .verify(&[0u8; 9], &[0u8; 64], kp.public_key.as_bytes())
            .unwrap_err();
        assert!(matches!(err, SignError::InvalidMessage { .. }));

        assert!(f.sign(&[0u8; 8], kp.secret_key.as_bytes()).is_ok());
        assert!(f.sign(&[], kp.secret_key.as_bytes()).is_ok());
    }

    /// 実行ユニットのメモリ不足はBoundaryエラーとして返り、ハンドルは残らない
    #[test]
    fn test_out_of_memory_mid_operation() {
        // シードとメッセージは入るが、キーペアは入らない容量
        let config = BoundaryConfig {
            heap_bytes: 80,
            max_message_bytes: 48,
            ..Default::default()
        };
        let f = SigningFacade::new(NativeUnit::new(&config), config);
        let err = f.sign(&[0u8; 48], &[1u8; 32]).unwrap_err();
        assert!(matches!(
            err,
            SignError::Boundary(BoundaryError::OutOfMemory { .. })
        ));
        assert!(!err.is_validation());
        assert_eq!(f.outstanding_handles(), 0);
        assert_eq!(f.live_objects(), Some(0));
    }

    /// 不正な設定ではnativeファサードを作らない
    #[cfg(feature = "native")]
    #[test]
    fn test_native_rejects_invalid_config() {
        let config = BoundaryConfig {
            heap_bytes: 16,
            max_message_bytes: 16,
            ..Default::default()
        };
        assert!(matches!(
            SigningFacade::native(config),
            Err(SignError::Boundary(BoundaryError::Config(_)))
        ));
    }
}
