//! 命令セットごとのトランポリン生成
//!
//! どの実装も同じ形をとる:
//! - `REDIRECT_LEN`: 関数先頭に書き込むジャンプの長さ
//! - `analyze`: 先頭の命令を読み、上書きしてよい長さ（命令境界）を決める
//! - `build_thunk`: 上書きした命令を別ページで実行して戻るコードを作る
//! - `redirect_bytes`: 上書き範囲全体に書き込むバイト列
//! - `PATCHABLE_ADD`: 書き換え可能な`add(a, b)`の機械語（テストとサンプル用）

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64::{analyze, build_thunk, redirect_bytes, PATCHABLE_ADD, REDIRECT_LEN};

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use self::aarch64::{analyze, build_thunk, redirect_bytes, PATCHABLE_ADD, REDIRECT_LEN};

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
mod unsupported;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub use self::unsupported::{analyze, build_thunk, redirect_bytes, PATCHABLE_ADD, REDIRECT_LEN};

/// 関数先頭から上書きする命令列
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prologue {
    /// 関数の先頭アドレス
    pub target: usize,
    /// 上書きされる命令のバイト列（命令境界で終わる）
    pub bytes: Vec<u8>,
}

impl Prologue {
    /// 上書きするバイト数
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// 上書きする命令がないか
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// サンクから戻る先（上書き範囲の直後）
    pub fn resume_address(&self) -> usize {
        self.target + self.bytes.len()
    }
}
