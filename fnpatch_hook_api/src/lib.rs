//! 関数フックの導入・解除
//!
//! `HookRegistry`が (ライブラリ, シンボル) ごとに高々1つのフックを管理する。
//! 置き換え関数は`install`が返すアドレス（または`OriginalSlot`）から元関数を呼べる。
//!
//! # 置き換え関数の約束
//!
//! - 複数スレッドから同時に呼ばれても安全であること
//! - 元関数はシンボルを引き直さず、`install`が返したアドレスで呼ぶこと
//!   （引き直すと置き換え関数自身に戻ってくる）
//! - `install`が戻ってから`uninstall`が始まるまでの間、いつ呼ばれてもよいこと
//!
//! ```no_run
//! use fnpatch_hook_api::{HookRegistry, OriginalSlot};
//!
//! static ORIGINAL_GETPID: OriginalSlot = OriginalSlot::new();
//!
//! extern "C" fn getpid_hook() -> i32 {
//!     match unsafe { ORIGINAL_GETPID.as_fn::<extern "C" fn() -> i32>() } {
//!         Some(original) => original(),
//!         None => -1,
//!     }
//! }
//!
//! let registry = HookRegistry::from_env();
//! unsafe {
//!     registry
//!         .install_with_slot("libc.so.6", "getpid", getpid_hook as usize, &ORIGINAL_GETPID)
//!         .ok();
//! }
//! registry.uninstall("libc.so.6", "getpid").ok();
//! ```

mod config;
mod error;
mod key;
mod registry;

use std::sync::OnceLock;

pub use config::{Contention, RegistryConfig, CONTENTION_ENV};
pub use error::HookError;
pub use key::{HookKey, HookState};
pub use registry::{HookRegistry, HookRequest, HookStatus, RegistryStats};

pub use fnpatch_loader::{DlResolver, ResolverConfig, StaticResolver, SymbolResolver};
pub use fnpatch_rewriter::{CodePatcher, NativePatcher, OriginalSlot};

static GLOBAL: OnceLock<HookRegistry> = OnceLock::new();

/// プロセス共通のレジストリ（初回呼び出し時に環境変数から設定する）
pub fn global() -> &'static HookRegistry {
    GLOBAL.get_or_init(HookRegistry::from_env)
}

/// `global().install(..)`
///
/// # Safety
/// `HookRegistry::install`と同じ。
pub unsafe fn install(library: &str, symbol: &str, replacement: usize) -> Result<usize, HookError> {
    global().install(library, symbol, replacement)
}

/// `global().uninstall(..)`
pub fn uninstall(library: &str, symbol: &str) -> Result<(), HookError> {
    global().uninstall(library, symbol)
}

/// `global().is_hooked(..)`
pub fn is_hooked(library: &str, symbol: &str) -> bool {
    global().is_hooked(library, symbol)
}
