//! # 境界アリーナ
//!
//! 実行ユニット内オブジェクトへのハンドルを参照カウント付きで追跡する。
//!
//! ハンドルは`ArenaHandle`としてのみ手に入り、ドロップ時にちょうど1回解放される。
//! `Clone`/`Copy`を実装しないため、二重解放と解放後使用は型で防がれる。
//!
//! 実行ユニットが解放に失敗したハンドルは`leaked`に移り、`outstanding()`に
//! 数えられ続ける。`reclaim`で再解放できる。

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;

use sandsign_types::{BoundaryError, ExecutionUnit, RawHandle};

/// 1つの実行ユニットと、そこに存在するハンドルの集合。
///
/// 内部可変性で`&self`から操作する。スレッド間で共有する場合は
/// `SigningFacade`のように`Mutex`で包む。
pub struct Arena<U: ExecutionUnit> {
    unit: RefCell<U>,
    /// 生ハンドルごとの保持数
    outstanding: RefCell<HashMap<RawHandle, usize>>,
    /// 解放に失敗し、実行ユニットに残っているハンドルの保持数
    leaked: RefCell<HashMap<RawHandle, usize>>,
    /// 前回の`take_release_failures`以降の解放失敗数
    release_failures: Cell<usize>,
    unit_type: String,
}

/// アリーナが保持する実行ユニット内オブジェクトへの参照。
pub struct ArenaHandle<'a, U: ExecutionUnit> {
    arena: &'a Arena<U>,
    raw: RawHandle,
}

impl<U: ExecutionUnit> ArenaHandle<'_, U> {
    /// 生ハンドル値（ログ用）。
    pub fn raw(&self) -> RawHandle {
        self.raw
    }
}

impl<U: ExecutionUnit> fmt::Debug for ArenaHandle<'_, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ArenaHandle").field(&self.raw).finish()
    }
}

impl<U: ExecutionUnit> Drop for ArenaHandle<'_, U> {
    fn drop(&mut self) {
        self.arena.release_raw(self.raw);
    }
}

impl<U: ExecutionUnit> Arena<U> {
    /// 実行ユニットを所有するアリーナを作成する。
    pub fn new(unit: U) -> Self {
        let unit_type = unit.unit_type().to_string();
        Self {
            unit: RefCell::new(unit),
            outstanding: RefCell::new(HashMap::new()),
            leaked: RefCell::new(HashMap::new()),
            release_failures: Cell::new(0),
            unit_type,
        }
    }

    /// 実行ユニット種別。
    pub fn unit_type(&self) -> &str {
        &self.unit_type
    }

    /// 未解放のハンドル数（解放に失敗したものを含む）。
    pub fn outstanding(&self) -> usize {
        self.outstanding.borrow().values().sum::<usize>() + self.leaked()
    }

    /// 解放に失敗して実行ユニットに残っているハンドル数。
    pub fn leaked(&self) -> usize {
        self.leaked.borrow().values().sum()
    }

    /// 前回の呼び出し以降に発生した解放失敗数を返し、0に戻す。
    pub fn take_release_failures(&self) -> usize {
        self.release_failures.replace(0)
    }

    /// 解放に失敗したハンドルを再解放する。残ったものがあれば`ReleaseFailed`。
    pub fn reclaim(&self) -> Result<(), BoundaryError> {
        let pending: Vec<(RawHandle, usize)> = self
            .leaked
            .borrow()
            .iter()
            .map(|(&raw, &count)| (raw, count))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let mut unit = self.unit.borrow_mut();
        let mut leaked = self.leaked.borrow_mut();
        let mut remaining = 0;
        for (raw, count) in pending {
            for _ in 0..count {
                match unit.release(raw) {
                    Ok(()) => {
                        decrement(&mut leaked, raw);
                        tracing::debug!(unit = %self.unit_type, raw, "reclaim");
                    }
                    Err(e) => {
                        tracing::warn!(unit = %self.unit_type, raw, error = %e, "ハンドルの再解放に失敗しました");
                        remaining += 1;
                    }
                }
            }
        }

        if remaining > 0 {
            return Err(BoundaryError::ReleaseFailed { count: remaining });
        }
        Ok(())
    }

    /// 実行ユニット自身が数えた生存オブジェクト数。
    pub fn live_objects(&self) -> Option<usize> {
        self.unit.borrow_mut().live_objects()
    }

    /// アリーナを分解して実行ユニットを取り出す。
    ///
    /// `ArenaHandle`はアリーナを借用するため、この時点で未解放のハンドルは存在しない。
    pub fn into_inner(self) -> U {
        self.unit.into_inner()
    }

    /// バイト列を実行ユニットへコピーし、retain済みハンドルを返す。
    pub fn import(&self, bytes: &[u8]) -> Result<ArenaHandle<'_, U>, BoundaryError> {
        let raw = self.unit.borrow_mut().alloc_bytes(bytes)?;
        tracing::debug!(unit = %self.unit_type, raw, len = bytes.len(), "import");
        Ok(self.adopt(raw))
    }

    /// ハンドルが指す内容をホストメモリへコピーする。ハンドルは解放しない。
    pub fn export(&self, handle: &ArenaHandle<'_, U>) -> Result<Vec<u8>, BoundaryError> {
        let raw = self.own(handle)?;
        self.unit.borrow_mut().read_bytes(raw)
    }

    /// 固定長の内容をエクスポートする。長さが違えば`UnexpectedLength`。
    pub fn export_fixed<const N: usize>(
        &self,
        handle: &ArenaHandle<'_, U>,
    ) -> Result<[u8; N], BoundaryError> {
        let bytes = self.export(handle)?;
        let actual = bytes.len();
        bytes
            .try_into()
            .map_err(|_| BoundaryError::UnexpectedLength { expected: N, actual })
    }

    /// ハンドルを明示的に解放する。ドロップと同じ。
    pub fn release(&self, handle: ArenaHandle<'_, U>) {
        drop(handle);
    }

    /// シードからキーペアオブジェクトを導出する。
    pub fn keypair_from_seed(
        &self,
        seed: &ArenaHandle<'_, U>,
    ) -> Result<ArenaHandle<'_, U>, BoundaryError> {
        let seed = self.own(seed)?;
        let raw = self.unit.borrow_mut().keypair_from_seed(seed)?;
        Ok(self.adopt(raw))
    }

    /// キーペアから公開鍵を導出する。
    pub fn public_key(
        &self,
        keypair: &ArenaHandle<'_, U>,
    ) -> Result<ArenaHandle<'_, U>, BoundaryError> {
        let keypair = self.own(keypair)?;
        let raw = self.unit.borrow_mut().public_key(keypair)?;
        Ok(self.adopt(raw))
    }

    /// メッセージに署名する。
    pub fn sign(
        &self,
        message: &ArenaHandle<'_, U>,
        keypair: &ArenaHandle<'_, U>,
    ) -> Result<ArenaHandle<'_, U>, BoundaryError> {
        let message = self.own(message)?;
        let keypair = self.own(keypair)?;
        let raw = self.unit.borrow_mut().sign(message, keypair)?;
        Ok(self.adopt(raw))
    }

    /// 署名を検証する。プリミティブの整数結果を`bool`に正規化する。
    pub fn verify(
        &self,
        signature: &ArenaHandle<'_, U>,
        message: &ArenaHandle<'_, U>,
        public_key: &ArenaHandle<'_, U>,
    ) -> Result<bool, BoundaryError> {
        let signature = self.own(signature)?;
        let message = self.own(message)?;
        let public_key = self.own(public_key)?;
        let result = self
            .unit
            .borrow_mut()
            .verify(signature, message, public_key)?;
        Ok(result != 0)
    }

    /// 実行ユニットが返したretain済みハンドルを追跡下に置く。
    fn adopt(&self, raw: RawHandle) -> ArenaHandle<'_, U> {
        *self.outstanding.borrow_mut().entry(raw).or_insert(0) += 1;
        ArenaHandle { arena: self, raw }
    }

    /// ハンドルがこのアリーナのものか確認する。
    fn own(&self, handle: &ArenaHandle<'_, U>) -> Result<RawHandle, BoundaryError> {
        if std::ptr::eq(handle.arena, self) {
            Ok(handle.raw)
        } else {
            Err(BoundaryError::ForeignHandle(handle.raw))
        }
    }

    fn release_raw(&self, raw: RawHandle) {
        if !self.outstanding.borrow().contains_key(&raw) {
            tracing::warn!(unit = %self.unit_type, raw, "追跡されていないハンドルの解放を無視しました");
            return;
        }

        let released = match self.unit.try_borrow_mut() {
            Ok(mut unit) => unit.release(raw),
            Err(_) => Err(BoundaryError::ReleaseFailed { count: 1 }),
        };
        decrement(&mut self.outstanding.borrow_mut(), raw);

        // ドロップ中はエラーを返せないので、失敗は記録して呼び出し元が回収する
        match released {
            Ok(()) => tracing::debug!(unit = %self.unit_type, raw, "release"),
            Err(e) => {
                tracing::warn!(unit = %self.unit_type, raw, error = %e, "ハンドルの解放に失敗しました");
                *self.leaked.borrow_mut().entry(raw).or_insert(0) += 1;
                self.release_failures.set(self.release_failures.get() + 1);
            }
        }
    }
}

/// 保持数を1減らす。0になったら取り除く。
fn decrement(counts: &mut HashMap<RawHandle, usize>, raw: RawHandle) {
    match counts.get_mut(&raw) {
        Some(count) if *count > 1 => *count -= 1,
        Some(_) => {
            counts.remove(&raw);
        }
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandsign_crypto::NativeUnit;

    /// import/exportのラウンドトリップとドロップ時の解放
    #[test]
    fn test_import_export_release_on_drop() {
        let arena = Arena::new(NativeUnit::default());
        {
            let h = arena.import(b"payload").unwrap();
            assert_eq!(arena.outstanding(), 1);
            assert_eq!(arena.export(&h).unwrap(), b"payload");
            // exportはハンドルを解放しない
            assert_eq!(arena.outstanding(), 1);
        }
        assert_eq!(arena.outstanding(), 0);
        assert_eq!(arena.live_objects(), Some(0));
    }

    /// 明示的な解放
    #[test]
    fn test_explicit_release() {
        let arena = Arena::new(NativeUnit::default());
        let a = arena.import(b"a").unwrap();
        let b = arena.import(b"b").unwrap();
        assert_eq!(arena.outstanding(), 2);
        arena.release(a);
        assert_eq!(arena.outstanding(), 1);
        arena.release(b);
        assert_eq!(arena.outstanding(), 0);
    }

    /// 固定長エクスポートは長さを検査する
    #[test]
    fn test_export_fixed_checks_length() {
        let arena = Arena::new(NativeUnit::default());
        let h = arena.import(&[1u8; 31]).unwrap();
        let err = arena.export_fixed::<32>(&h).unwrap_err();
        assert!(matches!(
            err,
            BoundaryError::UnexpectedLength { expected: 32, actual: 31 }
        ));
        assert_eq!(arena.export_fixed::<31>(&h).unwrap(), [1u8; 31]);
    }

    /// 別アリーナのハンドルは受け付けない
    #[test]
    fn test_foreign_handle_is_rejected() {
        let first = Arena::new(NativeUnit::default());
        let second = Arena::new(NativeUnit::default());
        let h = first.import(b"x").unwrap();
        assert!(matches!(second.export(&h), Err(BoundaryError::ForeignHandle(_))));
        assert!(matches!(
            second.keypair_from_seed(&h),
            Err(BoundaryError::ForeignHandle(_))
        ));
        drop(h);
        assert_eq!(first.outstanding(), 0);
        assert_eq!(second.outstanding(), 0);
    }

    /// プリミティブ呼び出しの結果もアリーナで追跡される
    #[test]
    fn test_primitive_results_are_tracked() {
        let arena = Arena::new(NativeUnit::default());
        {
            let seed = arena.import(&[3u8; 32]).unwrap();
            let keypair = arena.keypair_from_seed(&seed).unwrap();
            let public_key = arena.public_key(&keypair).unwrap();
            let message = arena.import(b"m").unwrap();
            let signature = arena.sign(&message, &keypair).unwrap();
            assert_eq!(arena.outstanding(), 5);
            assert!(arena.verify(&signature, &message, &public_key).unwrap());
        }
        assert_eq!(arena.outstanding(), 0);
        assert_eq!(arena.live_objects(), Some(0));
    }

    /// 失敗したプリミティブ呼び出しはハンドルを増やさない
    #[test]
    fn test_failed_call_adopts_nothing() {
        let arena = Arena::new(NativeUnit::default());
        let message = arena.import(b"not a keypair").unwrap();
        assert!(arena.sign(&message, &message).is_err());
        assert_eq!(arena.outstanding(), 1);
    }

    /// 同じ生ハンドルが2回返されても、保持数分だけ解放される
    #[test]
    fn test_duplicate_raw_handles_are_counted() {
        let arena = Arena::new(SharedUnit::default());
        let a = arena.import(b"x").unwrap();
        let b = arena.import(b"y").unwrap();
        assert_eq!(a.raw(), b.raw());
        assert_eq!(arena.outstanding(), 2);
        drop(a);
        assert_eq!(arena.outstanding(), 1);
        drop(b);
        assert_eq!(arena.outstanding(), 0);
        assert_eq!(arena.into_inner().releases, 2);
    }

    /// 解放に失敗したハンドルは未解放として数えられ、reclaimで回収できる
    #[test]
    fn test_failed_release_stays_outstanding() {
        let arena = Arena::new(SharedUnit {
            failing_releases: 1,
            ..Default::default()
        });
        let h = arena.import(b"x").unwrap();
        drop(h);

        assert_eq!(arena.outstanding(), 1);
        assert_eq!(arena.leaked(), 1);
        assert_eq!(arena.take_release_failures(), 1);
        assert_eq!(arena.take_release_failures(), 0);

        arena.reclaim().expect("2回目の解放は成功する");
        assert_eq!(arena.outstanding(), 0);
        assert_eq!(arena.leaked(), 0);
        assert_eq!(arena.into_inner().releases, 1);
    }

    /// 再解放にも失敗したハンドルは残り、ReleaseFailedを返す
    #[test]
    fn test_reclaim_reports_remaining() {
        let arena = Arena::new(SharedUnit {
            failing_releases: usize::MAX,
            ..Default::default()
        });
        let a = arena.import(b"x").unwrap();
        let b = arena.import(b"y").unwrap();
        drop(a);
        drop(b);
        assert_eq!(arena.outstanding(), 2);

        assert!(matches!(
            arena.reclaim(),
            Err(BoundaryError::ReleaseFailed { count: 2 })
        ));
        assert_eq!(arena.outstanding(), 2);
    }

    /// 常に同じハンドルを返すテスト用ユニット（参照カウント型ゲストの模倣）
    #[derive(Default)]
    struct SharedUnit {
        releases: usize,
        /// この回数だけ解放を失敗させる
        failing_releases: usize,
    }

    impl ExecutionUnit for SharedUnit {
        fn unit_type(&self) -> &str {
            "shared"
        }
        fn alloc_bytes(&mut self, _bytes: &[u8]) -> Result<RawHandle, BoundaryError> {
            Ok(42)
        }
        fn read_bytes(&mut self, _handle: RawHandle) -> Result<Vec<u8>, BoundaryError> {
            Ok(Vec::new())
        }
        fn release(&mut self, handle: RawHandle) -> Result<(), BoundaryError> {
            if self.failing_releases > 0 {
                self.failing_releases -= 1;
                return Err(BoundaryError::UnknownHandle(handle));
            }
            self.releases += 1;
            Ok(())
        }
        fn keypair_from_seed(&mut self, seed: RawHandle) -> Result<RawHandle, BoundaryError> {
            Ok(seed)
        }
        fn public_key(&mut self, keypair: RawHandle) -> Result<RawHandle, BoundaryError> {
            Ok(keypair)
        }
        fn sign(&mut self, message: RawHandle, _keypair: RawHandle) -> Result<RawHandle, BoundaryError> {
            Ok(message)
        }
        fn verify(&mut self, _: RawHandle, _: RawHandle, _: RawHandle) -> Result<i32, BoundaryError> {
            Ok(0)
        }
    }
}
