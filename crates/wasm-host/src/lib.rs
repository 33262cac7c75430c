//! # sandsign WASM実行ユニット
//!
//! 署名プリミティブを実装したゲストモジュールをwasmtimeで実行し、
//! `ExecutionUnit`として公開する。
//!
//! ## 安全性確保
//! - Fuel制限: プリミティブ呼び出し1回ごとの命令実行数の上限（無限ループ防止）
//! - Memory制限: 線形メモリの上限（OOM防止）
//! - 境界チェック: ゲストが返したブロックは線形メモリの範囲内か確認してから読む
//!
//! ## ゲストABI
//! ハンドルは線形メモリ上のブロック `[len: u32 LE][payload]` へのポインタ。
//! ポインタ`0`はメモリ不足を表す。
//!
//! | エクスポート | シグネチャ |
//! |------------|-----------|
//! | `memory` | 線形メモリ |
//! | `alloc` | `(len) -> ptr` |
//! | `release` | `(ptr)` |
//! | `sign_keypair_from_seed` | `(seed) -> keypair` |
//! | `sign_public_key` | `(keypair) -> public_key` |
//! | `sign` | `(message, keypair) -> signature` |
//! | `sign_verify` | `(signature, message, public_key) -> i32` |
//! | `live_objects`（任意） | `() -> count` |

use sandsign_types::{
    BoundaryConfig, BoundaryError, ExecutionUnit, RawHandle, PUBLIC_KEY_BYTES, SECRET_KEY_BYTES,
    SIGNATURE_BYTES,
};
use sha2::{Digest, Sha256};
use wasmtime::{
    Engine, Instance, Memory, Module, Store, StoreLimits, StoreLimitsBuilder, Trap, TypedFunc,
    WasmParams, WasmResults,
};

/// ブロックの長さプレフィックスのバイト数
const LEN_PREFIX_BYTES: usize = 4;

/// ストアに保持するホスト側の状態。
struct UnitState {
    /// メモリ・インスタンス数の上限
    limits: StoreLimits,
}

/// wasmtime上のゲストモジュールを実行ユニットとして扱う。
///
/// 1インスタンス・1線形メモリ。`&mut self`で全操作が直列化される。
pub struct WasmUnit {
    store: Store<UnitState>,
    memory: Memory,
    alloc: TypedFunc<u32, u32>,
    release: TypedFunc<u32, ()>,
    keypair_from_seed: TypedFunc<u32, u32>,
    public_key: TypedFunc<u32, u32>,
    sign: TypedFunc<(u32, u32), u32>,
    verify: TypedFunc<(u32, u32, u32), i32>,
    live_objects: Option<TypedFunc<(), u32>>,
    /// 呼び出しごとのFuel上限
    fuel_limit: Option<u64>,
    /// ゲストモジュールのSHA-256（16進数）
    module_hash: String,
}

impl WasmUnit {
    /// ゲストモジュールをコンパイル・インスタンス化する。
    ///
    /// # 引数
    /// - `wasm_bytes`: ゲストモジュールのWASMバイナリ（またはWAT）
    /// - `config`: メモリ上限・Fuel上限
    pub fn new(wasm_bytes: &[u8], config: &BoundaryConfig) -> Result<Self, BoundaryError> {
        config.validate()?;

        let mut engine_config = wasmtime::Config::new();
        engine_config.consume_fuel(config.fuel_limit.is_some());
        let engine =
            Engine::new(&engine_config).map_err(|e| BoundaryError::Compile(e.to_string()))?;
        let module = Module::new(&engine, wasm_bytes)
            .map_err(|e| BoundaryError::Compile(format!("{e:#}")))?;

        let limits = StoreLimitsBuilder::new()
            .memory_size(config.heap_bytes)
            .instances(1)
            .build();
        let mut store = Store::new(&engine, UnitState { limits });
        store.limiter(|state| &mut state.limits);
        if let Some(fuel) = config.fuel_limit {
            store
                .set_fuel(fuel)
                .map_err(|e| BoundaryError::Config(e.to_string()))?;
        }

        let instance = Instance::new(&mut store, &module, &[])
            .map_err(|e| BoundaryError::Compile(format!("インスタンス化に失敗: {e:#}")))?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| BoundaryError::MissingExport("memory".to_string()))?;

        let module_hash = hex::encode(Sha256::digest(wasm_bytes));
        tracing::info!(
            module_hash = %module_hash,
            pages = config.pages(),
            fuel_limit = ?config.fuel_limit,
            "WASM実行ユニットを起動しました"
        );

        Ok(Self {
            alloc: typed_export(&instance, &mut store, "alloc")?,
            release: typed_export(&instance, &mut store, "release")?,
            keypair_from_seed: typed_export(&instance, &mut store, "sign_keypair_from_seed")?,
            public_key: typed_export(&instance, &mut store, "sign_public_key")?,
            sign: typed_export(&instance, &mut store, "sign")?,
            verify: typed_export(&instance, &mut store, "sign_verify")?,
            live_objects: typed_export(&instance, &mut store, "live_objects").ok(),
            store,
            memory,
            fuel_limit: config.fuel_limit,
            module_hash,
        })
    }

    /// ゲストモジュールのSHA-256ハッシュ（16進数）を返す。
    pub fn module_hash(&self) -> &str {
        &self.module_hash
    }

    /// 次の呼び出しのためにFuelを上限まで補充する。
    fn refuel(&mut self) -> Result<(), BoundaryError> {
        if let Some(fuel) = self.fuel_limit {
            self.store
                .set_fuel(fuel)
                .map_err(|e| BoundaryError::Config(e.to_string()))?;
        }
        Ok(())
    }

    /// ゲストが返したポインタを検査する。`0`はメモリ不足。
    fn checked_ptr(ptr: u32, requested: usize) -> Result<RawHandle, BoundaryError> {
        if ptr == 0 {
            return Err(BoundaryError::OutOfMemory { requested });
        }
        Ok(ptr)
    }

    fn write_block(&mut self, ptr: u32, bytes: &[u8]) -> Result<(), BoundaryError> {
        let offset = ptr as usize;
        let len = bytes.len() as u32;
        self.memory
            .write(&mut self.store, offset, &len.to_le_bytes())
            .map_err(|e| BoundaryError::MemoryAccess(format!("ptr={ptr}: {e}")))?;
        self.memory
            .write(&mut self.store, offset + LEN_PREFIX_BYTES, bytes)
            .map_err(|e| BoundaryError::MemoryAccess(format!("ptr={ptr}: {e}")))
    }

    fn read_block(&self, ptr: u32) -> Result<Vec<u8>, BoundaryError> {
        let offset = ptr as usize;
        let mut prefix = [0u8; LEN_PREFIX_BYTES];
        self.memory
            .read(&self.store, offset, &mut prefix)
            .map_err(|e| BoundaryError::MemoryAccess(format!("ptr={ptr}: {e}")))?;
        let len = u32::from_le_bytes(prefix) as usize;

        // 長さプレフィックスを信用する前に範囲を確認する
        let end = offset
            .checked_add(LEN_PREFIX_BYTES)
            .and_then(|start| start.checked_add(len));
        match end {
            Some(end) if end <= self.memory.data_size(&self.store) => {}
            _ => {
                return Err(BoundaryError::MemoryAccess(format!(
                    "ptr={ptr} len={len} が線形メモリの範囲外です"
                )))
            }
        }

        let mut payload = vec![0u8; len];
        self.memory
            .read(&self.store, offset + LEN_PREFIX_BYTES, &mut payload)
            .map_err(|e| BoundaryError::MemoryAccess(format!("ptr={ptr}: {e}")))?;
        Ok(payload)
    }
}

impl ExecutionUnit for WasmUnit {
    fn unit_type(&self) -> &str {
        "wasm"
    }

    fn alloc_bytes(&mut self, bytes: &[u8]) -> Result<RawHandle, BoundaryError> {
        let requested = bytes.len() + LEN_PREFIX_BYTES;
        let len = u32::try_from(bytes.len()).map_err(|_| BoundaryError::OutOfMemory { requested })?;
        self.refuel()?;
        let ptr = self
            .alloc
            .call(&mut self.store, len)
            .map_err(|e| call_error("alloc", e))?;
        let ptr = Self::checked_ptr(ptr, requested)?;
        if let Err(e) = self.write_block(ptr, bytes) {
            if let Err(release_err) = self.release(ptr) {
                tracing::warn!(ptr, error = %release_err, "書き込み失敗後のブロック解放に失敗しました");
            }
            return Err(e);
        }
        Ok(ptr)
    }

    fn read_bytes(&mut self, handle: RawHandle) -> Result<Vec<u8>, BoundaryError> {
        self.read_block(handle)
    }

    fn release(&mut self, handle: RawHandle) -> Result<(), BoundaryError> {
        self.refuel()?;
        self.release
            .call(&mut self.store, handle)
            .map_err(|e| call_error("release", e))
    }

    fn keypair_from_seed(&mut self, seed: RawHandle) -> Result<RawHandle, BoundaryError> {
        self.refuel()?;
        let ptr = self
            .keypair_from_seed
            .call(&mut self.store, seed)
            .map_err(|e| call_error("sign_keypair_from_seed", e))?;
        Self::checked_ptr(ptr, SECRET_KEY_BYTES + PUBLIC_KEY_BYTES)
    }

    fn public_key(&mut self, keypair: RawHandle) -> Result<RawHandle, BoundaryError> {
        self.refuel()?;
        let ptr = self
            .public_key
            .call(&mut self.store, keypair)
            .map_err(|e| call_error("sign_public_key", e))?;
        Self::checked_ptr(ptr, PUBLIC_KEY_BYTES)
    }

    fn sign(&mut self, message: RawHandle, keypair: RawHandle) -> Result<RawHandle, BoundaryError> {
        self.refuel()?;
        let ptr = self
            .sign
            .call(&mut self.store, (message, keypair))
            .map_err(|e| call_error("sign", e))?;
        Self::checked_ptr(ptr, SIGNATURE_BYTES)
    }

    fn verify(
        &mut self,
        signature: RawHandle,
        message: RawHandle,
        public_key: RawHandle,
    ) -> Result<i32, BoundaryError> {
        self.refuel()?;
        self.verify
            .call(&mut self.store, (signature, message, public_key))
            .map_err(|e| call_error("sign_verify", e))
    }

    fn live_objects(&mut self) -> Option<usize> {
        let func = self.live_objects.clone()?;
        if self.refuel().is_err() {
            return None;
        }
        match func.call(&mut self.store, ()) {
            Ok(count) => Some(count as usize),
            Err(e) => {
                tracing::warn!(error = %e, "live_objectsの呼び出しに失敗しました");
                None
            }
        }
    }
}

/// 型付きエクスポート関数を取得する。
fn typed_export<P, R>(
    instance: &Instance,
    store: &mut Store<UnitState>,
    name: &str,
) -> Result<TypedFunc<P, R>, BoundaryError>
where
    P: WasmParams,
    R: WasmResults,
{
    let func = instance
        .get_func(&mut *store, name)
        .ok_or_else(|| BoundaryError::MissingExport(name.to_string()))?;
    func.typed::<P, R>(&*store)
        .map_err(|e| BoundaryError::Compile(format!("エクスポート`{name}`の型が不正です: {e}")))
}

/// wasmtimeの呼び出しエラーを境界エラーに変換する。
fn call_error(name: &str, error: wasmtime::Error) -> BoundaryError {
    match error.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => BoundaryError::FuelExhausted,
        Some(trap) => BoundaryError::Trap(format!("{name}: {trap}")),
        None => BoundaryError::Trap(format!("{name}: {error:#}")),
    }
}
