//! # 実行ユニット抽象化
//!
//! 隔離された暗号実行ユニットの能力を表すトレイト。
//! コア（アリーナ・ファサード）はこのトレイトにのみ依存する。
//!
//! 現在の実装:
//! - `sandsign_crypto::NativeUnit`: プロセス内オブジェクト表（ed25519-dalek）
//! - `sandsign_wasm_host::WasmUnit`: wasmtime上のゲストモジュール

use crate::error::BoundaryError;

/// 実行ユニット内のオブジェクトを指す生ハンドル。
///
/// 所有権を持たない。所有権付きの参照は`sandsign_core::ArenaHandle`を使う。
pub type RawHandle = u32;

/// 実行ユニットのトレイト。
///
/// `alloc_bytes`と各プリミティブ操作が返すハンドルはretain済みで、
/// 呼び出し側がちょうど1回`release`する責任を負う。
pub trait ExecutionUnit: Send {
    /// 実行ユニット種別を返す（ログ用）。
    fn unit_type(&self) -> &str;

    /// バイト列を実行ユニットのメモリへコピーし、retain済みハンドルを返す。
    fn alloc_bytes(&mut self, bytes: &[u8]) -> Result<RawHandle, BoundaryError>;

    /// ハンドルが指すバイト列をホストメモリへコピーする。ハンドルは解放しない。
    fn read_bytes(&mut self, handle: RawHandle) -> Result<Vec<u8>, BoundaryError>;

    /// ハンドルの参照を解放する。
    fn release(&mut self, handle: RawHandle) -> Result<(), BoundaryError>;

    /// 32バイトのシードからキーペアオブジェクトを決定的に導出する。
    fn keypair_from_seed(&mut self, seed: RawHandle) -> Result<RawHandle, BoundaryError>;

    /// キーペアから32バイトの公開鍵を導出する。
    fn public_key(&mut self, keypair: RawHandle) -> Result<RawHandle, BoundaryError>;

    /// キーペアでメッセージに署名し、64バイトの署名を返す。
    fn sign(&mut self, message: RawHandle, keypair: RawHandle) -> Result<RawHandle, BoundaryError>;

    /// 署名を検証する。戻り値は真偽値相当の整数（0以外で成功）。
    fn verify(
        &mut self,
        signature: RawHandle,
        message: RawHandle,
        public_key: RawHandle,
    ) -> Result<i32, BoundaryError>;

    /// 実行ユニット内で生存しているオブジェクト数。数えられない実装は`None`。
    fn live_objects(&mut self) -> Option<usize> {
        None
    }
}
