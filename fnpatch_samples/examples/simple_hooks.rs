//! 置き換え関数から元関数を呼ぶ（wrap, not replace）最小の例

use fnpatch_hook_api::{HookRegistry, OriginalSlot, StaticResolver};
use fnpatch_samples::{init_logger, map_add, AddFn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

static ORIGINAL_ADD: OriginalSlot = OriginalSlot::new();
static CALLS: AtomicUsize = AtomicUsize::new(0);

/// 呼び出し回数を数えてから元の`add`へ渡す
extern "C" fn counting_add(a: i32, b: i32) -> i32 {
    CALLS.fetch_add(1, Ordering::Relaxed);
    match unsafe { ORIGINAL_ADD.as_fn::<AddFn>() } {
        Some(original) => original(a, b),
        None => a + b,
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logger()?;

    let (page, add) = map_add()?;
    let registry = HookRegistry::with_parts(
        StaticResolver::new().register("", "add", page.address()),
        fnpatch_hook_api::NativePatcher::new(),
        Default::default(),
    );

    unsafe { registry.install_with_slot("", "add", counting_add as usize, &ORIGINAL_ADD)? };

    // 置き換え関数は複数スレッドから同時に呼ばれる
    let workers: Vec<_> = (0..4)
        .map(|i| thread::spawn(move || (0..1000).map(|n| add(i, n)).sum::<i32>()))
        .collect();
    for worker in workers {
        let sum = worker.join().map_err(|_| "worker panicked")?;
        println!("worker sum = {}", sum);
    }
    println!("calls through the hook: {}", CALLS.load(Ordering::Relaxed));

    registry.uninstall("", "add")?;
    let before = CALLS.load(Ordering::Relaxed);
    add(1, 1);
    assert_eq!(CALLS.load(Ordering::Relaxed), before);
    println!("hook removed, add(1, 1) = {}", add(1, 1));
    Ok(())
}
