//! # ネイティブ実行ユニット
//!
//! ハンドルからオブジェクトへの表をプロセス内に持つ実行ユニット。
//! wasmのサンドボックスが使えない環境・テスト用。
//! キーペアオブジェクトは表の中にだけ存在し、`read_bytes`では取り出せない。
//! バイト列オブジェクトもキーペアも、解放時にゼロ化される。

use std::collections::HashMap;

use zeroize::Zeroizing;

use sandsign_types::{
    BoundaryConfig, BoundaryError, ExecutionUnit, RawHandle, PUBLIC_KEY_BYTES, SECRET_KEY_BYTES,
    SIGNATURE_BYTES,
};

use crate::Ed25519SigningKey;

/// キーペアオブジェクトが占有するとみなすバイト数（秘密鍵 + 公開鍵）
const KEYPAIR_FOOTPRINT: usize = SECRET_KEY_BYTES + PUBLIC_KEY_BYTES;

/// 実行ユニット内のオブジェクト。
enum Object {
    /// ホストからインポートされたバイト列（シードを含む）、またはプリミティブの出力
    Bytes(Zeroizing<Vec<u8>>),
    /// シードから展開された署名鍵（ドロップ時にゼロ化される）
    KeyPair(Ed25519SigningKey),
}

impl Object {
    fn footprint(&self) -> usize {
        match self {
            Object::Bytes(bytes) => bytes.len(),
            Object::KeyPair(_) => KEYPAIR_FOOTPRINT,
        }
    }
}

/// プロセス内ネイティブ実行ユニット。
pub struct NativeUnit {
    /// 生存中のオブジェクト
    objects: HashMap<RawHandle, Object>,
    /// 最後に払い出したハンドル（0はnull扱いで使わない）
    last_handle: RawHandle,
    /// 容量上限（バイト）
    capacity_bytes: usize,
    /// 使用中のバイト数
    used_bytes: usize,
}

impl NativeUnit {
    /// 設定の`heap_bytes`を容量上限としてNativeUnitを作成する。
    pub fn new(config: &BoundaryConfig) -> Self {
        Self::with_capacity(config.heap_bytes)
    }

    /// 容量上限を直接指定してNativeUnitを作成する。
    pub fn with_capacity(capacity_bytes: usize) -> Self {
        Self {
            objects: HashMap::new(),
            last_handle: 0,
            capacity_bytes,
            used_bytes: 0,
        }
    }

    /// 使用中のバイト数を返す。
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    fn insert(&mut self, object: Object) -> Result<RawHandle, BoundaryError> {
        let size = object.footprint();
        if self.used_bytes.saturating_add(size) > self.capacity_bytes {
            return Err(BoundaryError::OutOfMemory { requested: size });
        }
        let handle = self.next_free_handle();
        self.used_bytes += size;
        self.objects.insert(handle, object);
        Ok(handle)
    }

    fn next_free_handle(&mut self) -> RawHandle {
        loop {
            self.last_handle = self.last_handle.wrapping_add(1);
            if self.last_handle != 0 && !self.objects.contains_key(&self.last_handle) {
                return self.last_handle;
            }
        }
    }

    fn get(&self, handle: RawHandle) -> Result<&Object, BoundaryError> {
        self.objects
            .get(&handle)
            .ok_or(BoundaryError::UnknownHandle(handle))
    }

    fn bytes(&self, handle: RawHandle) -> Result<&[u8], BoundaryError> {
        match self.get(handle)? {
            Object::Bytes(bytes) => Ok(bytes.as_slice()),
            Object::KeyPair(_) => Err(BoundaryError::InvalidObject {
                handle,
                reason: "キーペアはバイト列として読み出せません".to_string(),
            }),
        }
    }

    fn fixed_bytes<const N: usize>(&self, handle: RawHandle) -> Result<[u8; N], BoundaryError> {
        let bytes = self.bytes(handle)?;
        bytes.try_into().map_err(|_| BoundaryError::InvalidObject {
            handle,
            reason: format!("{N}バイトを期待しましたが{}バイトでした", bytes.len()),
        })
    }

    fn keypair(&self, handle: RawHandle) -> Result<&Ed25519SigningKey, BoundaryError> {
        match self.get(handle)? {
            Object::KeyPair(key) => Ok(key),
            Object::Bytes(_) => Err(BoundaryError::InvalidObject {
                handle,
                reason: "キーペアではありません".to_string(),
            }),
        }
    }
}

impl Default for NativeUnit {
    fn default() -> Self {
        Self::new(&BoundaryConfig::default())
    }
}

impl ExecutionUnit for NativeUnit {
    fn unit_type(&self) -> &str {
        "native"
    }

    fn alloc_bytes(&mut self, bytes: &[u8]) -> Result<RawHandle, BoundaryError> {
        self.insert(Object::Bytes(Zeroizing::new(bytes.to_vec())))
    }

    fn read_bytes(&mut self, handle: RawHandle) -> Result<Vec<u8>, BoundaryError> {
        self.bytes(handle).map(<[u8]>::to_vec)
    }

    fn release(&mut self, handle: RawHandle) -> Result<(), BoundaryError> {
        let object = self
            .objects
            .remove(&handle)
            .ok_or(BoundaryError::UnknownHandle(handle))?;
        self.used_bytes -= object.footprint();
        Ok(())
    }

    fn keypair_from_seed(&mut self, seed: RawHandle) -> Result<RawHandle, BoundaryError> {
        let seed: [u8; SECRET_KEY_BYTES] = self.fixed_bytes(seed)?;
        let key = crate::ed25519_keypair_from_seed(&seed);
        self.insert(Object::KeyPair(key))
    }

    fn public_key(&mut self, keypair: RawHandle) -> Result<RawHandle, BoundaryError> {
        let public_key = self.keypair(keypair)?.verifying_key().to_bytes();
        self.insert(Object::Bytes(Zeroizing::new(public_key.to_vec())))
    }

    fn sign(&mut self, message: RawHandle, keypair: RawHandle) -> Result<RawHandle, BoundaryError> {
        let key = self.keypair(keypair)?;
        let signature = crate::ed25519_sign(key, self.bytes(message)?);
        self.insert(Object::Bytes(Zeroizing::new(signature.to_bytes().to_vec())))
    }

    fn verify(
        &mut self,
        signature: RawHandle,
        message: RawHandle,
        public_key: RawHandle,
    ) -> Result<i32, BoundaryError> {
        let signature: [u8; SIGNATURE_BYTES] = self.fixed_bytes(signature)?;
        let public_key: [u8; PUBLIC_KEY_BYTES] = self.fixed_bytes(public_key)?;
        let message = self.bytes(message)?;
        let verified = crate::ed25519_verify(&public_key, message, &signature);
        if let Err(e) = &verified {
            tracing::debug!(error = %e, "native verify rejected signature");
        }
        Ok(i32::from(verified.is_ok()))
    }

    fn live_objects(&mut self) -> Option<usize> {
        Some(self.objects.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Verifier;

    /// インポート→エクスポート→解放のラウンドトリップ
    #[test]
    fn test_alloc_read_release() {
        let mut unit = NativeUnit::default();
        let h = unit.alloc_bytes(b"hello").expect("確保できる");
        assert_ne!(h, 0);
        assert_eq!(unit.read_bytes(h).unwrap(), b"hello");
        assert_eq!(unit.used_bytes(), 5);

        unit.release(h).expect("解放できる");
        assert_eq!(unit.used_bytes(), 0);
        assert_eq!(unit.live_objects(), Some(0));
    }

    /// 解放済みハンドルは使えない
    #[test]
    fn test_use_after_release_is_rejected() {
        let mut unit = NativeUnit::default();
        let h = unit.alloc_bytes(&[1, 2, 3]).unwrap();
        unit.release(h).unwrap();

        assert!(matches!(unit.read_bytes(h), Err(BoundaryError::UnknownHandle(x)) if x == h));
        assert!(matches!(unit.release(h), Err(BoundaryError::UnknownHandle(_))));
    }

    /// 容量を超える確保はOutOfMemory
    #[test]
    fn test_capacity_is_enforced() {
        let mut unit = NativeUnit::with_capacity(40);
        let a = unit.alloc_bytes(&[0u8; 32]).unwrap();
        let err = unit.alloc_bytes(&[0u8; 16]).unwrap_err();
        assert!(matches!(err, BoundaryError::OutOfMemory { requested: 16 }));

        unit.release(a).unwrap();
        assert!(unit.alloc_bytes(&[0u8; 16]).is_ok());
    }

    /// キーペアオブジェクトの秘密鍵素材はエクスポートできない
    #[test]
    fn test_keypair_is_not_exportable() {
        let mut unit = NativeUnit::default();
        let seed = unit.alloc_bytes(&[9u8; 32]).unwrap();
        let kp = unit.keypair_from_seed(seed).unwrap();
        assert!(matches!(
            unit.read_bytes(kp),
            Err(BoundaryError::InvalidObject { .. })
        ));
    }

    /// シード長が32バイトでなければキーペアを導出しない
    #[test]
    fn test_keypair_from_short_seed_fails() {
        let mut unit = NativeUnit::default();
        let seed = unit.alloc_bytes(&[9u8; 31]).unwrap();
        assert!(matches!(
            unit.keypair_from_seed(seed),
            Err(BoundaryError::InvalidObject { handle, .. }) if handle == seed
        ));
    }

    /// 実行ユニット内で作った署名がdalekの検証を通ることを確認
    #[test]
    fn test_sign_matches_dalek() {
        let mut unit = NativeUnit::default();
        let secret: [u8; 32] = rand::random();
        let seed = unit.alloc_bytes(&secret).unwrap();
        let kp = unit.keypair_from_seed(seed).unwrap();
        let pk = unit.public_key(kp).unwrap();
        let msg = unit.alloc_bytes(b"Title message").unwrap();
        let sig = unit.sign(msg, kp).unwrap();

        let pk_bytes: [u8; 32] = unit.read_bytes(pk).unwrap().try_into().expect("公開鍵は32バイト");
        let sig_bytes: [u8; 64] = unit.read_bytes(sig).unwrap().try_into().expect("署名は64バイト");

        let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&pk_bytes).expect("有効な公開鍵");
        let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        assert!(verifying_key.verify(b"Title message", &signature).is_ok());

        assert_eq!(unit.verify(sig, msg, pk).unwrap(), 1);
        let other = unit.alloc_bytes(b"Title messagf").unwrap();
        assert_eq!(unit.verify(sig, other, pk).unwrap(), 0);

        for h in [seed, kp, pk, msg, sig, other] {
            unit.release(h).unwrap();
        }
        assert_eq!(unit.live_objects(), Some(0));
        assert_eq!(unit.used_bytes(), 0);
    }

    /// 検証失敗はエラーではなく0を返す
    #[test]
    fn test_verify_rejects_zero_signature() {
        let mut unit = NativeUnit::default();
        let seed = unit.alloc_bytes(&[1u8; 32]).unwrap();
        let kp = unit.keypair_from_seed(seed).unwrap();
        let pk = unit.public_key(kp).unwrap();
        let sig = unit.alloc_bytes(&[0u8; 64]).unwrap();
        let msg = unit.alloc_bytes(b"").unwrap();
        assert_eq!(unit.verify(sig, msg, pk).unwrap(), 0);
    }

    /// 長さの誤った署名オブジェクトはInvalidObject
    #[test]
    fn test_verify_with_short_signature_object() {
        let mut unit = NativeUnit::default();
        let sig = unit.alloc_bytes(&[0u8; 63]).unwrap();
        let msg = unit.alloc_bytes(b"m").unwrap();
        let pk = unit.alloc_bytes(&[0u8; 32]).unwrap();
        assert!(matches!(
            unit.verify(sig, msg, pk),
            Err(BoundaryError::InvalidObject { .. })
        ));
    }

    fn assert_zeroize_on_drop<T: zeroize::ZeroizeOnDrop>(_: &T) {}

    /// 表に入るオブジェクトはどちらもドロップ時にゼロ化される型で保持される
    #[test]
    fn test_objects_are_wiped_on_release() {
        let mut unit = NativeUnit::default();
        let seed = unit.alloc_bytes(&[5u8; 32]).unwrap();
        let kp = unit.keypair_from_seed(seed).unwrap();

        for handle in [seed, kp] {
            match unit.get(handle).unwrap() {
                Object::Bytes(bytes) => assert_zeroize_on_drop(bytes),
                Object::KeyPair(key) => assert_zeroize_on_drop(key),
            }
        }

        unit.release(seed).unwrap();
        unit.release(kp).unwrap();
        assert_eq!(unit.used_bytes(), 0);
    }
}
