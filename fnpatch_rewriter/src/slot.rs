use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 置き換え関数が元関数を呼ぶためのポインタ置き場
///
/// 置き換え関数は`extern "C" fn`なのでクロージャを持てない。代わりに`static`な
/// `OriginalSlot`から元関数のアドレスを読む。書き換え処理はリダイレクトを書き込む
/// *前に*ここへ公開するので、他スレッドが書き換え直後に置き換え関数へ入っても空にはならない。
///
/// ```no_run
/// use fnpatch_rewriter::OriginalSlot;
///
/// static ORIGINAL_ADD: OriginalSlot = OriginalSlot::new();
///
/// extern "C" fn add_plus_one(a: i32, b: i32) -> i32 {
///     let original: extern "C" fn(i32, i32) -> i32 =
///         unsafe { ORIGINAL_ADD.as_fn() }.expect("hook is installed");
///     original(a, b) + 1
/// }
/// ```
#[derive(Debug)]
pub struct OriginalSlot(AtomicUsize);

impl OriginalSlot {
    /// 空のスロットを作成
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    /// 元関数のアドレスを公開する
    pub fn publish(&self, address: usize) {
        self.0.store(address, Ordering::SeqCst);
    }

    /// 公開したアドレスを取り消す
    pub fn clear(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    /// 公開済みのアドレス（未公開なら`None`）
    pub fn get(&self) -> Option<usize> {
        match self.0.load(Ordering::SeqCst) {
            0 => None,
            address => Some(address),
        }
    }

    /// 公開済みのアドレスを関数ポインタ型`F`として取り出す
    ///
    /// ポインタと大きさの違う型はコンパイル時に弾かれる。
    ///
    /// ```compile_fail
    /// use fnpatch_rewriter::OriginalSlot;
    ///
    /// static SLOT: OriginalSlot = OriginalSlot::new();
    /// let _ = unsafe { SLOT.as_fn::<u8>() };
    /// ```
    ///
    /// # Safety
    /// `F`は元関数と同じシグネチャ・ABIの関数ポインタ型であること。
    pub unsafe fn as_fn<F: Copy>(&self) -> Option<F> {
        let () = PointerSized::<F>::CHECK;
        let address = self.get()?;
        Some(std::mem::transmute_copy::<usize, F>(&address))
    }
}

/// `F`がポインタと同じ大きさであることを単相化の時点で確かめる
struct PointerSized<F>(PhantomData<F>);

impl<F> PointerSized<F> {
    const CHECK: () = assert!(
        std::mem::size_of::<F>() == std::mem::size_of::<usize>(),
        "OriginalSlot::as_fn needs a function pointer type"
    );
}

impl Default for OriginalSlot {
    fn default() -> Self {
        Self::new()
    }
}
