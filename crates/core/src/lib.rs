//! # sandsign Core
//!
//! 隔離された暗号実行ユニットを背後に持つ最小の署名API。
//!
//! ## 構成
//! - `arena`: 境界アリーナ。実行ユニット内オブジェクトへのハンドルを追跡し、
//!   ドロップ時にちょうど1回解放する。
//! - `facade`: 署名ファサード。入力を検証し、アリーナ経由でプリミティブを呼び出す。
//!
//! ## 処理の流れ
//! 1. 入力検証（境界に触れる前）
//! 2. バッファを実行ユニットへインポート
//! 3. プリミティブ呼び出し
//! 4. 結果をホストメモリへエクスポート
//! 5. 作成した全ハンドルを解放（エラー時も）
//!
//! ## バックエンド
//! | feature | 実行ユニット |
//! |---------|------------|
//! | `native` | `sandsign_crypto::NativeUnit` |
//! | `wasm` | `sandsign_wasm_host::WasmUnit` |

pub mod arena;
pub mod error;
pub mod facade;

pub use arena::{Arena, ArenaHandle};
pub use error::SignError;
pub use facade::SigningFacade;

pub use sandsign_types::{
    BoundaryConfig, BoundaryError, ExecutionUnit, KeyPair, PublicKey, RawHandle, SecretKeySeed,
    Signature, PUBLIC_KEY_BYTES, SECRET_KEY_BYTES, SIGNATURE_BYTES,
};
