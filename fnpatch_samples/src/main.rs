use fnpatch_hook_api::{HookRegistry, NativePatcher, OriginalSlot, RegistryConfig, StaticResolver};
use fnpatch_samples::{init_logger, map_add, AddFn};
use log::{error, info};
use std::process::ExitCode;

const LIBRARY: &str = "libdemo.so";

static ORIGINAL_ADD: OriginalSlot = OriginalSlot::new();

/// 元の`add`の結果に1を足す
extern "C" fn add_plus_one(a: i32, b: i32) -> i32 {
    match unsafe { ORIGINAL_ADD.as_fn::<AddFn>() } {
        Some(original) => original(a, b) + 1,
        None => a + b,
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let (page, add) = map_add()?;
    info!("mapped add at {:#x}", page.address());

    let registry = HookRegistry::with_parts(
        StaticResolver::new().register(LIBRARY, "add", page.address()),
        NativePatcher::new(),
        RegistryConfig::from_env(),
    );

    println!("fnpatch sample program");
    println!("1. add(2, 3) before hooking = {}", add(2, 3));

    let original = unsafe {
        registry.install_with_slot(LIBRARY, "add", add_plus_one as usize, &ORIGINAL_ADD)?
    };
    println!("2. add(2, 3) while hooked   = {}", add(2, 3));
    println!("   original entry at {:#x}", original);

    for status in registry.hooks() {
        let hex = |address: Option<usize>| address.map_or("-".to_string(), |a| format!("{:#x}", a));
        println!(
            "   {} {:?} target={} original={}",
            status.key,
            status.state,
            hex(status.target),
            hex(status.original)
        );
    }

    registry.uninstall(LIBRARY, "add")?;
    println!("3. add(2, 3) after unhooking = {}", add(2, 3));

    let stats = registry.stats();
    println!(
        "stats: applied={} reverted={} failed={} degraded={}",
        stats.patches_applied, stats.patches_reverted, stats.install_failures, stats.degraded
    );
    Ok(())
}

fn main() -> ExitCode {
    if let Err(e) = init_logger() {
        eprintln!("failed to initialise logging: {}", e);
    }

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("sample failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
