use crate::arch::{self, Prologue};
use crate::code_page::CodePage;
use crate::error::PatchError;
use crate::maps::{find_region, parse_proc_maps, MemoryRegion};
use crate::protect::{flush_instruction_cache, write_code, PageRange, ProtectedSpan};
use crate::slot::OriginalSlot;
use log::{debug, error, warn};
use std::slice;

/// プロローグ解析のために読むバイト数の上限
const MAX_PROLOGUE_WINDOW: usize = 32;

/// 関数先頭の書き換え
///
/// 状態を持たないユーティリティ。同じページへの`apply`/`revert`が同時に走らないことは
/// 呼び出し側（フックレジストリ）が保証する。
pub trait CodePatcher: Send + Sync {
    /// `target`の先頭を`replacement`へのジャンプで上書きする
    ///
    /// `slot`が渡された場合、元関数の入口をリダイレクトを書く前に公開する。
    /// 失敗時は何も書き換えずにエラーを返し、`slot`も空に戻す。
    ///
    /// # Safety
    /// `target`は関数の先頭、`replacement`は同じシグネチャの関数であること。
    unsafe fn apply(
        &self,
        target: usize,
        replacement: usize,
        slot: Option<&OriginalSlot>,
    ) -> Result<PatchRecord, PatchError>;

    /// 保存しておいた元のバイト列を書き戻す
    ///
    /// # Safety
    /// `record`はこのパッチャーの`apply`が返したものであること。
    unsafe fn revert(&self, record: &mut PatchRecord) -> Result<(), PatchError>;
}

/// 1つの書き換えの記録
///
/// 元のバイト列は取得後に変更しない。書き戻しの唯一の根拠になる。
#[derive(Debug)]
pub struct PatchRecord {
    target: usize,
    replacement: usize,
    original_bytes: Box<[u8]>,
    pages: PageRange,
    original_entry: usize,
    thunk: Option<CodePage>,
    active: bool,
}

impl PatchRecord {
    /// 書き換え済みの記録を作る（元関数の入口は`target`そのもの）
    pub fn new(target: usize, replacement: usize, original_bytes: Vec<u8>, pages: PageRange) -> Self {
        Self {
            target,
            replacement,
            original_bytes: original_bytes.into_boxed_slice(),
            pages,
            original_entry: target,
            thunk: None,
            active: true,
        }
    }

    /// 元関数の入口をサンクにする
    pub fn with_thunk(mut self, thunk: CodePage) -> Self {
        self.original_entry = thunk.address();
        self.thunk = Some(thunk);
        self
    }

    /// 書き換えた関数の先頭アドレス
    pub fn target(&self) -> usize {
        self.target
    }

    /// 飛び先の置き換え関数
    pub fn replacement(&self) -> usize {
        self.replacement
    }

    /// 上書き前のバイト列
    pub fn original_bytes(&self) -> &[u8] {
        &self.original_bytes
    }

    /// 書き換えたページの範囲
    pub fn pages(&self) -> PageRange {
        self.pages
    }

    /// 呼び出し側に渡す「元関数」のアドレス
    pub fn original_entry(&self) -> usize {
        self.original_entry
    }

    /// 書き換えがまだ残っているか
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// 書き戻しが終わったことを記録する
    pub fn mark_reverted(&mut self) {
        self.active = false;
    }
}

/// 実行中のプロセスのコードを直接書き換えるパッチャー
///
/// 命令セットごとの処理は`arch`モジュールが選ぶ。
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePatcher;

impl NativePatcher {
    /// パッチャーを作成
    pub fn new() -> Self {
        Self
    }

    /// `target`を含む実行可能領域から、解析用の窓を読み出す
    fn prologue_window<'a>(
        regions: &[MemoryRegion],
        target: usize,
    ) -> Result<&'a [u8], PatchError> {
        let region = find_region(regions, target)
            .ok_or_else(|| PatchError::invalid(target, "address is not mapped"))?;
        if !region.is_executable() {
            return Err(PatchError::invalid(
                target,
                format!("region {:#x}-{:#x} is not executable", region.start, region.end),
            ));
        }
        if !region.is_readable() {
            return Err(PatchError::invalid(target, "code region is not readable"));
        }
        let len = (region.end - target).min(MAX_PROLOGUE_WINDOW);
        Ok(unsafe { slice::from_raw_parts(target as *const u8, len) })
    }

    fn build_thunk(prologue: &Prologue) -> Result<CodePage, PatchError> {
        let mut thunk = CodePage::allocate_near(prologue.target, page_size::get())?;
        let code = arch::build_thunk(prologue, thunk.address())?;
        unsafe { thunk.write_and_seal(&code)? };
        debug!(
            "thunk for {:#x} at {:#x} ({} bytes, resumes at {:#x})",
            prologue.target,
            thunk.address(),
            code.len(),
            prologue.resume_address()
        );
        Ok(thunk)
    }
}

impl CodePatcher for NativePatcher {
    unsafe fn apply(
        &self,
        target: usize,
        replacement: usize,
        slot: Option<&OriginalSlot>,
    ) -> Result<PatchRecord, PatchError> {
        if target == 0 {
            return Err(PatchError::invalid(target, "null target"));
        }
        if replacement == 0 {
            return Err(PatchError::invalid(target, "null replacement"));
        }

        let regions = parse_proc_maps()
            .map_err(|e| PatchError::invalid(target, format!("cannot read /proc/self/maps: {}", e)))?;
        let window = Self::prologue_window(&regions, target)?;
        let prologue = arch::analyze(target, window)?;
        let span = ProtectedSpan::inspect(&regions, target, prologue.len())?;
        let thunk = Self::build_thunk(&prologue)?;
        let redirect = arch::redirect_bytes(replacement, prologue.len());
        debug!(
            "patching {:#x} -> {:#x}: {} bytes over pages {:#x}+{:#x}",
            target,
            replacement,
            prologue.len(),
            span.range().start,
            span.range().len
        );

        span.unprotect()?;

        // 書き込み可能にしてから読み直し、解析した内容と一致することを確認する
        let current = slice::from_raw_parts(target as *const u8, prologue.len()).to_vec();
        if current != prologue.bytes {
            span.restore()?;
            return Err(PatchError::unsafe_target(
                target,
                "code changed while the prologue was being analyzed",
            ));
        }

        if let Some(slot) = slot {
            slot.publish(thunk.address());
        }
        std::ptr::copy_nonoverlapping(redirect.as_ptr(), target as *mut u8, redirect.len());
        flush_instruction_cache(target, redirect.len());

        if let Err(err) = span.restore() {
            // 保護属性を戻せないなら書き換えも残さない
            std::ptr::copy_nonoverlapping(current.as_ptr(), target as *mut u8, current.len());
            flush_instruction_cache(target, current.len());
            if let Err(second) = span.restore() {
                error!(
                    "pages of {:#x} stay writable after a failed patch: {}",
                    target, second
                );
            }
            if let Some(slot) = slot {
                slot.clear();
            }
            return Err(err);
        }

        Ok(PatchRecord::new(target, replacement, current, span.range()).with_thunk(thunk))
    }

    unsafe fn revert(&self, record: &mut PatchRecord) -> Result<(), PatchError> {
        if !record.is_active() {
            return Ok(());
        }

        let target = record.target();
        let regions = parse_proc_maps()
            .map_err(|e| PatchError::invalid(target, format!("cannot read /proc/self/maps: {}", e)))?;
        let span = ProtectedSpan::inspect(&regions, target, record.original_bytes().len())?;

        match write_code(&span, target, record.original_bytes()) {
            Ok(()) => {}
            // 元のバイト列は書き戻せている。ページがRWXのまま残るだけ
            Err(err) if written_back(record) => {
                warn!("{:#x} restored but its protection was not: {}", target, err);
            }
            Err(err) => return Err(err),
        }

        record.mark_reverted();
        debug!("reverted {} bytes at {:#x}", record.original_bytes().len(), target);
        Ok(())
    }
}

fn written_back(record: &PatchRecord) -> bool {
    let current =
        unsafe { slice::from_raw_parts(record.target() as *const u8, record.original_bytes().len()) };
    current == record.original_bytes()
}

#[cfg(all(test, any(target_arch = "x86_64", target_arch = "aarch64")))]
mod tests {
    use super::*;
    use crate::arch::PATCHABLE_ADD;

    type AddFn = extern "C" fn(i32, i32) -> i32;

    extern "C" fn multiply(a: i32, b: i32) -> i32 {
        a * b
    }

    fn snapshot(address: usize, len: usize) -> Vec<u8> {
        unsafe { slice::from_raw_parts(address as *const u8, len).to_vec() }
    }

    #[test]
    fn test_apply_and_revert_restores_bytes() {
        let page = CodePage::with_code(PATCHABLE_ADD).unwrap();
        let target = page.address();
        let before = snapshot(target, PATCHABLE_ADD.len());

        let patcher = NativePatcher::new();
        let mut record = unsafe { patcher.apply(target, multiply as usize, None) }.unwrap();
        assert!(record.is_active());
        assert_ne!(snapshot(target, PATCHABLE_ADD.len()), before);
        assert_eq!(record.original_bytes(), &before[..record.original_bytes().len()]);
        assert_ne!(record.original_entry(), target);

        let hooked: AddFn = unsafe { std::mem::transmute(target) };
        assert_eq!(hooked(2, 3), 6);
        let original: AddFn = unsafe { std::mem::transmute(record.original_entry()) };
        assert_eq!(original(2, 3), 5);

        unsafe { patcher.revert(&mut record) }.unwrap();
        assert!(!record.is_active());
        assert_eq!(snapshot(target, PATCHABLE_ADD.len()), before);
        assert_eq!(hooked(2, 3), 5);
    }

    #[test]
    fn test_protection_is_restored() {
        let page = CodePage::with_code(PATCHABLE_ADD).unwrap();
        let patcher = NativePatcher::new();
        let mut record = unsafe { patcher.apply(page.address(), multiply as usize, None) }.unwrap();

        let regions = parse_proc_maps().unwrap();
        let region = find_region(&regions, page.address()).unwrap();
        assert!(region.is_executable());
        assert!(!region.is_writable());

        unsafe { patcher.revert(&mut record) }.unwrap();
    }

    #[test]
    fn test_slot_is_published() {
        static SLOT: OriginalSlot = OriginalSlot::new();
        let page = CodePage::with_code(PATCHABLE_ADD).unwrap();
        let patcher = NativePatcher::new();
        let mut record =
            unsafe { patcher.apply(page.address(), multiply as usize, Some(&SLOT)) }.unwrap();
        assert_eq!(SLOT.get(), Some(record.original_entry()));
        unsafe { patcher.revert(&mut record) }.unwrap();
    }

    #[test]
    fn test_data_address_is_invalid() {
        static DATA: [u8; 64] = [0x90; 64];
        let patcher = NativePatcher::new();
        let result = unsafe { patcher.apply(DATA.as_ptr() as usize, multiply as usize, None) };
        assert!(matches!(result, Err(PatchError::InvalidTarget { .. })));
    }

    #[test]
    fn test_null_addresses_are_invalid() {
        let patcher = NativePatcher::new();
        let page = CodePage::with_code(PATCHABLE_ADD).unwrap();
        assert!(matches!(
            unsafe { patcher.apply(0, multiply as usize, None) },
            Err(PatchError::InvalidTarget { .. })
        ));
        assert!(matches!(
            unsafe { patcher.apply(page.address(), 0, None) },
            Err(PatchError::InvalidTarget { .. })
        ));
    }

    #[test]
    fn test_short_function_is_left_untouched() {
        #[cfg(target_arch = "x86_64")]
        let code: &[u8] = &[0x8d, 0x04, 0x37, 0xc3]; // lea eax, [rdi+rsi]; ret
        #[cfg(target_arch = "aarch64")]
        let code: &[u8] = &[0x00, 0x00, 0x01, 0x0b, 0xc0, 0x03, 0x5f, 0xd6]; // add; ret

        let page = CodePage::with_code(code).unwrap();
        let before = snapshot(page.address(), code.len());
        let patcher = NativePatcher::new();
        let result = unsafe { patcher.apply(page.address(), multiply as usize, None) };
        assert!(matches!(result, Err(PatchError::UnsafeTarget { .. })));
        assert_eq!(snapshot(page.address(), code.len()), before);
    }
}
