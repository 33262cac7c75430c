//! # 境界エラー型
//!
//! 実行ユニットとの境界越えで発生するエラー。入力検証エラーではなく、
//! その呼び出しに対して致命的なものとして扱う（リトライしない）。

use crate::unit::RawHandle;

/// 実行ユニット境界のエラー型
#[derive(Debug, thiserror::Error)]
pub enum BoundaryError {
    /// 実行ユニットのメモリ確保に失敗
    #[error("実行ユニットのメモリが不足しています（要求: {requested}バイト）")]
    OutOfMemory {
        /// 確保しようとしたバイト数
        requested: usize,
    },
    /// 実行ユニットがハンドルの解放に失敗した（オブジェクトは残っている）
    #[error("{count}個のハンドルを解放できませんでした")]
    ReleaseFailed {
        /// 解放できなかったハンドル数
        count: usize,
    },
    /// 実行ユニットが知らないハンドル（解放済み等）
    #[error("不明なハンドルです: {0}")]
    UnknownHandle(RawHandle),
    /// 別のアリーナで取得されたハンドル
    #[error("別のアリーナのハンドルです: {0}")]
    ForeignHandle(RawHandle),
    /// ハンドルが期待と異なる種類のオブジェクトを指している
    #[error("ハンドル{handle}のオブジェクトが不正です: {reason}")]
    InvalidObject {
        /// 対象ハンドル
        handle: RawHandle,
        /// 理由
        reason: String,
    },
    /// 実行ユニットが返した結果の長さが不正
    #[error("結果の長さが不正です（期待: {expected}バイト, 実際: {actual}バイト）")]
    UnexpectedLength {
        /// 期待したバイト数
        expected: usize,
        /// 実際のバイト数
        actual: usize,
    },
    /// 線形メモリの範囲外アクセス
    #[error("メモリアクセスエラー: {0}")]
    MemoryAccess(String),
    /// ゲストモジュールのコンパイル・インスタンス化エラー
    #[error("ゲストモジュールのコンパイルエラー: {0}")]
    Compile(String),
    /// ゲストモジュールに必要なエクスポートがない
    #[error("ゲストモジュールにエクスポート`{0}`がありません")]
    MissingExport(String),
    /// ゲストの実行中にトラップが発生
    #[error("実行ユニットがトラップしました: {0}")]
    Trap(String),
    /// Fuel制限超過
    #[error("Fuel制限を超過しました")]
    FuelExhausted,
    /// 設定値が不正
    #[error("設定が不正です: {0}")]
    Config(String),
}
