//! `DlResolver`でシンボルを引き、フックを試みる
//!
//! 検索ディレクトリは`FNPATCH_LIBRARY_PATH`で追加できる。
//!
//! ```text
//! cargo run --example resolve_symbols -- libc.so.6 getpid strlen
//! ```

use fnpatch_hook_api::{HookError, HookRegistry, OriginalSlot};
use fnpatch_loader::{DlResolver, ResolverConfig, SymbolResolver};
use fnpatch_samples::init_logger;
use log::warn;

static ORIGINAL_GETPID: OriginalSlot = OriginalSlot::new();

/// 元の`getpid`をそのまま呼ぶ
extern "C" fn getpid_passthrough() -> i32 {
    match unsafe { ORIGINAL_GETPID.as_fn::<extern "C" fn() -> i32>() } {
        Some(original) => original(),
        None => -1,
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logger()?;

    let mut args = std::env::args().skip(1);
    let library = args.next().unwrap_or_else(|| "libc.so.6".to_string());
    let mut symbols: Vec<String> = args.collect();
    if symbols.is_empty() {
        symbols = vec!["getpid".into(), "strlen".into(), "fnpatch_missing".into()];
    }

    let config = ResolverConfig::from_env();
    println!("search paths: {:?}", config.search_paths);
    let resolver = DlResolver::with_config(config);

    for symbol in &symbols {
        match resolver.resolve(&library, symbol) {
            Ok(resolved) => println!("{}!{} = {:#x}", library, symbol, resolved.address),
            Err(e) => println!("{}!{}: {}", library, symbol, e),
        }
    }

    // 書き換えられない場合は型付きのエラーで分かる
    let registry = HookRegistry::from_env();
    let result = unsafe {
        registry.install_with_slot(&library, "getpid", getpid_passthrough as usize, &ORIGINAL_GETPID)
    };
    match result {
        Ok(original) => {
            println!("hooked {}!getpid, original at {:#x}", library, original);
            println!("pid through the hook: {}", std::process::id());
            registry.uninstall(&library, "getpid")?;
            println!("unhooked {}!getpid", library);
        }
        Err(e @ HookError::UnsafeTarget { .. })
        | Err(e @ HookError::ProtectionDenied { .. })
        | Err(e @ HookError::SymbolNotFound { .. }) => {
            warn!("{}!getpid cannot be hooked here: {}", library, e);
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
