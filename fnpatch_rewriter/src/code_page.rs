use crate::error::PatchError;
use crate::maps::parse_proc_maps;
use crate::protect::flush_instruction_cache;
use log::debug;
use nix::sys::mman::{mmap_anonymous, mprotect, munmap, MapFlags, ProtFlags};
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

/// rel32 / RIP相対で届く範囲（少し余裕を持たせる）
const NEAR_WINDOW: usize = 0x7ff0_0000;

/// mmap_min_addr より下には置けない
const LOWEST_CANDIDATE: usize = 0x10000;

/// 匿名mmapで確保した実行可能ページ
///
/// 書き込み中はRW、`write_and_seal`の後はR-Xになる。Dropでmunmapする。
/// 元関数を呼ぶためのサンク（再配置したプロローグ + 復帰ジャンプ）の置き場として使う。
#[derive(Debug)]
pub struct CodePage {
    base: NonNull<c_void>,
    len: usize,
}

// 生ポインタを持つが、ページの所有権はこの値だけが持つ
unsafe impl Send for CodePage {}
unsafe impl Sync for CodePage {}

impl CodePage {
    /// `code`を書き込んだ実行可能ページを確保する
    pub fn with_code(code: &[u8]) -> Result<Self, PatchError> {
        let mut page = Self::allocate(None, code.len())?;
        unsafe { page.write_and_seal(code)? };
        Ok(page)
    }

    /// `near`から±2GiB以内にページを確保する
    ///
    /// /proc/self/maps の隙間を探し、見つからなければ任意の場所に確保する。
    pub fn allocate_near(near: usize, len: usize) -> Result<Self, PatchError> {
        let page = page_size::get();
        let need = round_up(len.max(1), page);
        let low = near.saturating_sub(NEAR_WINDOW).max(LOWEST_CANDIDATE) & !(page - 1);
        let high = near.saturating_add(NEAR_WINDOW) & !(page - 1);

        if let Ok(regions) = parse_proc_maps() {
            let mut gap_start = low;
            for region in &regions {
                if region.end <= gap_start {
                    continue;
                }
                if region.start >= high {
                    break;
                }
                if region.start > gap_start && region.start - gap_start >= need {
                    if let Some(found) = Self::try_map_within(near, gap_start, region.start, need, low, high) {
                        return Ok(found);
                    }
                }
                gap_start = gap_start.max(region.end);
            }
            if high > gap_start && high - gap_start >= need {
                if let Some(found) = Self::try_map_within(near, gap_start, high, need, low, high) {
                    return Ok(found);
                }
            }
        }

        debug!("no free gap near {:#x}, allocating anywhere", near);
        Self::allocate(None, len)
    }

    fn try_map_within(
        near: usize,
        gap_start: usize,
        gap_end: usize,
        need: usize,
        low: usize,
        high: usize,
    ) -> Option<Self> {
        let page = page_size::get();
        let candidate = near.clamp(gap_start, gap_end - need) & !(page - 1);
        let mapped = Self::allocate(Some(candidate), need).ok()?;
        let address = mapped.address();
        if address >= low && address + need <= high {
            Some(mapped)
        } else {
            // ヒントが無視された場合は範囲外なので捨てる
            None
        }
    }

    /// RWの匿名ページを確保する（`hint`はmmapへのヒントとして渡すだけ）
    pub(crate) fn allocate(hint: Option<usize>, len: usize) -> Result<Self, PatchError> {
        let len = round_up(len.max(1), page_size::get());
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| PatchError::unsafe_target(0, "empty code page"))?;
        let base = unsafe {
            mmap_anonymous(
                hint.and_then(NonZeroUsize::new),
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|errno| {
            PatchError::unsafe_target(
                hint.unwrap_or(0),
                format!("no memory for a code page: {}", errno),
            )
        })?;
        Ok(Self { base, len })
    }

    /// コードを書き込み、R-Xに切り替える
    ///
    /// SELinuxなどで匿名の実行可能ページが禁止されていると`ProtectionDenied`になる。
    pub(crate) unsafe fn write_and_seal(&mut self, code: &[u8]) -> Result<(), PatchError> {
        if code.len() > self.len {
            return Err(PatchError::unsafe_target(
                self.address(),
                format!("{} bytes of code do not fit a {} byte page", code.len(), self.len),
            ));
        }
        std::ptr::copy_nonoverlapping(code.as_ptr(), self.base.as_ptr() as *mut u8, code.len());
        mprotect(self.base, self.len, ProtFlags::PROT_READ | ProtFlags::PROT_EXEC)
            .map_err(|errno| PatchError::from_errno(self.address(), errno))?;
        flush_instruction_cache(self.address(), code.len());
        Ok(())
    }

    /// ページの先頭アドレス
    pub fn address(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// 確保した大きさ
    pub fn len(&self) -> usize {
        self.len
    }

    /// 大きさが0か
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for CodePage {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.base, self.len) } {
            log::error!("munmap of code page {:#x} failed: {}", self.address(), e);
        }
    }
}

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
