//! # Ed25519 ゲストモジュール
//!
//! `sandsign-wasm-host`が読み込む実行ユニット本体。
//! 曲線演算は`ed25519-dalek`に任せ、このモジュールはブロックABIだけを実装する。
//!
//! ## ターゲット
//! `wasm32-unknown-unknown`
//!
//! ## ブロック形式
//! `[len: u32 LE][payload]`。ハンドルはブロック先頭へのポインタ。
//! キーペアのpayloadは `secret(32) || public(32)`。

#![no_std]

extern crate alloc;

use core::alloc::Layout;
use core::sync::atomic::{AtomicU32, Ordering};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

#[global_allocator]
static ALLOC: dlmalloc::GlobalDlmalloc = dlmalloc::GlobalDlmalloc;

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    core::arch::wasm32::unreachable()
}

const LEN_PREFIX: usize = 4;

/// 生存中のブロック数
static LIVE: AtomicU32 = AtomicU32::new(0);

fn layout(len: usize) -> Option<Layout> {
    Layout::from_size_align(LEN_PREFIX + len, 4).ok()
}

/// ブロックのpayload長を読む。
///
/// # Safety
/// `ptr`は`alloc`が返した未解放のブロックであること。
unsafe fn block_len(ptr: u32) -> usize {
    let mut prefix = [0u8; LEN_PREFIX];
    core::ptr::copy_nonoverlapping(ptr as *const u8, prefix.as_mut_ptr(), LEN_PREFIX);
    u32::from_le_bytes(prefix) as usize
}

/// ブロックのpayloadを参照する。
///
/// # Safety
/// `ptr`は`alloc`が返した未解放のブロックであること。
unsafe fn payload<'a>(ptr: u32) -> &'a [u8] {
    let len = block_len(ptr);
    core::slice::from_raw_parts((ptr as usize + LEN_PREFIX) as *const u8, len)
}

/// 長さを書き込んだブロックを確保し、payloadをコピーする。失敗時は0。
fn new_block(bytes: &[u8]) -> u32 {
    let ptr = alloc(bytes.len() as u32);
    if ptr == 0 {
        return 0;
    }
    unsafe {
        let p = ptr as *mut u8;
        core::ptr::copy_nonoverlapping((bytes.len() as u32).to_le_bytes().as_ptr(), p, LEN_PREFIX);
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), p.add(LEN_PREFIX), bytes.len());
    }
    ptr
}

fn fixed<const N: usize>(ptr: u32) -> Option<[u8; N]> {
    if ptr == 0 {
        return None;
    }
    unsafe { payload(ptr) }.try_into().ok()
}

// ---------------------------------------------------------------------------
// メモリ管理
// ---------------------------------------------------------------------------

/// `len`バイトのpayloadを持つブロックを確保する。長さはホストが書き込む。
#[no_mangle]
pub extern "C" fn alloc(len: u32) -> u32 {
    let Some(layout) = layout(len as usize) else {
        return 0;
    };
    let ptr = unsafe { alloc::alloc::alloc(layout) };
    if ptr.is_null() {
        return 0;
    }
    LIVE.fetch_add(1, Ordering::Relaxed);
    ptr as u32
}

/// ブロックをゼロ化して解放する。
#[no_mangle]
pub extern "C" fn release(ptr: u32) {
    if ptr == 0 {
        return;
    }
    unsafe {
        let len = block_len(ptr);
        let Some(layout) = layout(len) else {
            return;
        };
        core::ptr::write_bytes(ptr as *mut u8, 0, LEN_PREFIX + len);
        alloc::alloc::dealloc(ptr as *mut u8, layout);
    }
    LIVE.fetch_sub(1, Ordering::Relaxed);
}

/// 生存中のブロック数を返す。
#[no_mangle]
pub extern "C" fn live_objects() -> u32 {
    LIVE.load(Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// 署名プリミティブ
// ---------------------------------------------------------------------------

/// 32バイトのシードからキーペアブロックを作る。
#[no_mangle]
pub extern "C" fn sign_keypair_from_seed(seed: u32) -> u32 {
    let Some(seed) = fixed::<32>(seed) else {
        core::arch::wasm32::unreachable()
    };
    let key = SigningKey::from_bytes(&seed);
    new_block(&key.to_keypair_bytes())
}

/// キーペアブロックから公開鍵ブロックを作る。
#[no_mangle]
pub extern "C" fn sign_public_key(keypair: u32) -> u32 {
    let Some(keypair) = fixed::<64>(keypair) else {
        core::arch::wasm32::unreachable()
    };
    new_block(&keypair[32..])
}

/// メッセージに署名し、64バイトの署名ブロックを作る。
#[no_mangle]
pub extern "C" fn sign(message: u32, keypair: u32) -> u32 {
    let Some(keypair) = fixed::<64>(keypair) else {
        core::arch::wasm32::unreachable()
    };
    let Ok(key) = SigningKey::from_keypair_bytes(&keypair) else {
        core::arch::wasm32::unreachable()
    };
    let message = unsafe { payload(message) };
    new_block(&key.sign(message).to_bytes())
}

/// 署名を検証する。成功で1、失敗で0。
#[no_mangle]
pub extern "C" fn sign_verify(signature: u32, message: u32, public_key: u32) -> i32 {
    let (Some(signature), Some(public_key)) = (fixed::<64>(signature), fixed::<32>(public_key))
    else {
        return 0;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&public_key) else {
        return 0;
    };
    let message = unsafe { payload(message) };
    i32::from(
        verifying_key
            .verify(message, &Signature::from_bytes(&signature))
            .is_ok(),
    )
}
