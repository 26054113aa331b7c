use crate::error::PatchError;
use crate::maps::{find_region, MemoryRegion};
use log::{debug, error};
use nix::sys::mman::{mprotect, ProtFlags};
use std::ffi::c_void;
use std::ptr::NonNull;

/// ページ境界に揃えたアドレス範囲
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    /// 先頭ページのアドレス
    pub start: usize,
    /// 範囲の長さ（ページサイズの倍数）
    pub len: usize,
}

impl PageRange {
    /// `address`から`len`バイトを覆うページ範囲
    pub fn covering(address: usize, len: usize, page_size: usize) -> Self {
        let start = address & !(page_size - 1);
        let last = address + len.max(1) - 1;
        let end = (last & !(page_size - 1)) + page_size;
        Self {
            start,
            len: end - start,
        }
    }

    /// 範囲の終端（含まない）
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// 書き換え対象のページと、その書き換え前の保護属性
///
/// `unprotect`でRWXにし、`restore`で領域ごとの元の属性に戻す。
pub(crate) struct ProtectedSpan {
    address: usize,
    range: PageRange,
    pieces: Vec<(usize, usize, ProtFlags)>,
}

impl ProtectedSpan {
    /// `address`から`len`バイトを含むページを調べる
    ///
    /// 範囲全体が実行可能な領域で隙間なく覆われていなければ`InvalidTarget`。
    pub(crate) fn inspect(
        regions: &[MemoryRegion],
        address: usize,
        len: usize,
    ) -> Result<Self, PatchError> {
        let range = PageRange::covering(address, len, page_size::get());
        let mut pieces = Vec::new();
        let mut cursor = range.start;

        while cursor < range.end() {
            let region = find_region(regions, cursor).ok_or_else(|| {
                PatchError::invalid(address, format!("page {:#x} is not mapped", cursor))
            })?;
            if !region.is_executable() {
                return Err(PatchError::invalid(
                    address,
                    format!("region {:#x}-{:#x} is not executable", region.start, region.end),
                ));
            }
            let piece_end = region.end.min(range.end());
            pieces.push((cursor, piece_end - cursor, region.prot_flags()));
            cursor = piece_end;
        }

        Ok(Self {
            address,
            range,
            pieces,
        })
    }

    pub(crate) fn range(&self) -> PageRange {
        self.range
    }

    /// ページをRWXにする
    pub(crate) unsafe fn unprotect(&self) -> Result<(), PatchError> {
        debug!(
            "unprotecting {:#x}-{:#x} for {:#x}",
            self.range.start,
            self.range.end(),
            self.address
        );
        protect(
            self.address,
            self.range.start,
            self.range.len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
        )
    }

    /// 各領域を書き換え前の保護属性に戻す
    ///
    /// 失敗しても残りの領域は戻しに行き、最初のエラーを返す。
    pub(crate) unsafe fn restore(&self) -> Result<(), PatchError> {
        let mut first_error = None;
        for &(start, len, flags) in &self.pieces {
            if let Err(e) = protect(self.address, start, len, flags) {
                error!(
                    "failed to restore protection {:?} on {:#x}-{:#x}: {}",
                    flags,
                    start,
                    start + len,
                    e
                );
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

unsafe fn protect(
    address: usize,
    start: usize,
    len: usize,
    flags: ProtFlags,
) -> Result<(), PatchError> {
    let ptr = NonNull::new(start as *mut c_void)
        .ok_or_else(|| PatchError::invalid(address, "page range starts at null"))?;
    mprotect(ptr, len, flags).map_err(|errno| PatchError::from_errno(address, errno))
}

/// 命令キャッシュを同期する（x86_64では不要）
pub(crate) fn flush_instruction_cache(address: usize, len: usize) {
    #[cfg(target_arch = "aarch64")]
    {
        extern "C" {
            fn __clear_cache(begin: *mut c_void, end: *mut c_void);
        }
        unsafe {
            __clear_cache(address as *mut c_void, (address + len) as *mut c_void);
        }
    }

    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = (address, len);
    }
}

/// 保護属性を変更した状態で`bytes`を`address`に書き込み、元に戻す
///
/// 呼び出し側で同じページへの書き込みが直列化されていること。
pub(crate) unsafe fn write_code(
    span: &ProtectedSpan,
    address: usize,
    bytes: &[u8],
) -> Result<(), PatchError> {
    span.unprotect()?;
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
    flush_instruction_cache(address, bytes.len());
    span.restore()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: usize, end: usize, perms: &str) -> MemoryRegion {
        let line = format!("{:x}-{:x} {}p 00000000 00:00 0", start, end, perms);
        crate::maps::parse_maps(&line).remove(0)
    }

    #[test]
    fn test_page_range_single_page() {
        let range = PageRange::covering(0x1010, 14, 0x1000);
        assert_eq!(range, PageRange { start: 0x1000, len: 0x1000 });
    }

    #[test]
    fn test_page_range_straddles_boundary() {
        let range = PageRange::covering(0x1ff8, 14, 0x1000);
        assert_eq!(range.start, 0x1000);
        assert_eq!(range.len, 0x2000);
        assert_eq!(range.end(), 0x3000);
    }

    #[test]
    fn test_inspect_records_each_region() {
        let page = page_size::get();
        let regions = vec![
            region(page, 2 * page, "r-x"),
            region(2 * page, 3 * page, "rwx"),
        ];
        let span = ProtectedSpan::inspect(&regions, 2 * page - 4, 8).unwrap();
        assert_eq!(span.range().start, page);
        assert_eq!(span.pieces.len(), 2);
        assert_eq!(span.pieces[0].2, ProtFlags::PROT_READ | ProtFlags::PROT_EXEC);
        assert!(span.pieces[1].2.contains(ProtFlags::PROT_WRITE));
    }

    #[test]
    fn test_inspect_rejects_unmapped_and_data_pages() {
        let page = page_size::get();
        let regions = vec![region(page, 2 * page, "rw-")];

        let data = ProtectedSpan::inspect(&regions, page + 8, 14);
        assert!(matches!(data, Err(PatchError::InvalidTarget { .. })));

        let unmapped = ProtectedSpan::inspect(&regions, 8 * page, 14);
        assert!(matches!(unmapped, Err(PatchError::InvalidTarget { .. })));
    }
}
