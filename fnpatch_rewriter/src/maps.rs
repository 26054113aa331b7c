use nix::sys::mman::ProtFlags;
use std::fs;
use std::path::PathBuf;

/// `/proc/self/maps`の1行分
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRegion {
    /// 開始アドレス
    pub start: usize,
    /// 終了アドレス（含まない）
    pub end: usize,
    /// `r` `w` `x` に対応する保護属性
    pub prot: ProtFlags,
    /// `s`（共有マッピング）
    pub shared: bool,
    /// ファイル内のオフセット
    pub offset: u64,
    /// ファイル名、または`[stack]`のような擬似名。匿名マッピングでは`None`
    pub pathname: Option<PathBuf>,
}

impl MemoryRegion {
    /// 読み取り可能か
    pub fn is_readable(&self) -> bool {
        self.prot.contains(ProtFlags::PROT_READ)
    }

    /// 書き込み可能か
    pub fn is_writable(&self) -> bool {
        self.prot.contains(ProtFlags::PROT_WRITE)
    }

    /// 実行可能か
    pub fn is_executable(&self) -> bool {
        self.prot.contains(ProtFlags::PROT_EXEC)
    }

    /// 領域の大きさ
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    /// `address`が領域内にあるか
    pub fn contains(&self, address: usize) -> bool {
        (self.start..self.end).contains(&address)
    }

    /// 書き換え後に戻す保護属性
    pub fn prot_flags(&self) -> ProtFlags {
        self.prot
    }
}

/// 現在のプロセスのマッピングを開始アドレス順に返す
pub fn parse_proc_maps() -> std::io::Result<Vec<MemoryRegion>> {
    Ok(parse_maps(&fs::read_to_string("/proc/self/maps")?))
}

/// maps形式のテキストをパースする。読めない行は飛ばす
pub fn parse_maps(text: &str) -> Vec<MemoryRegion> {
    let mut regions: Vec<MemoryRegion> = text.lines().filter_map(parse_maps_line).collect();
    regions.sort_by_key(|region| region.start);
    regions
}

/// `address`を含む領域
pub fn find_region(regions: &[MemoryRegion], address: usize) -> Option<&MemoryRegion> {
    let index = regions.partition_point(|region| region.end <= address);
    regions.get(index).filter(|region| region.contains(address))
}

/// 例: `7f8b4c000000-7f8b4c021000 r-xp 00000000 08:01 1234 /lib/x86_64-linux-gnu/libc.so.6`
fn parse_maps_line(line: &str) -> Option<MemoryRegion> {
    let mut fields = line.split_whitespace();
    let (start, end) = fields.next()?.split_once('-')?;
    let start = usize::from_str_radix(start, 16).ok()?;
    let end = usize::from_str_radix(end, 16).ok()?;
    if end <= start {
        return None;
    }

    let perms: [u8; 4] = fields.next()?.as_bytes().try_into().ok()?;
    let mut prot = ProtFlags::PROT_NONE;
    for (flag, expected, bit) in [
        (perms[0], b'r', ProtFlags::PROT_READ),
        (perms[1], b'w', ProtFlags::PROT_WRITE),
        (perms[2], b'x', ProtFlags::PROT_EXEC),
    ] {
        match flag {
            b'-' => {}
            f if f == expected => prot |= bit,
            _ => return None,
        }
    }

    let offset = u64::from_str_radix(fields.next()?, 16).ok()?;
    let _device = fields.next()?;
    let _inode: u64 = fields.next()?.parse().ok()?;

    // パス名には空白が含まれることがある
    let rest: Vec<&str> = fields.collect();
    let pathname = (!rest.is_empty()).then(|| PathBuf::from(rest.join(" ")));

    Some(MemoryRegion {
        start,
        end,
        prot,
        shared: perms[3] == b's',
        offset,
        pathname,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_library_mapping() {
        let line = "7f8b4c000000-7f8b4c021000 r-xp 00000000 08:01 1234 /lib/x86_64-linux-gnu/libc.so.6";
        let region = parse_maps_line(line).unwrap();

        assert_eq!(region.start, 0x7f8b4c000000);
        assert_eq!(region.end, 0x7f8b4c021000);
        assert!(region.is_readable());
        assert!(!region.is_writable());
        assert!(region.is_executable());
        assert!(!region.shared);
        assert_eq!(
            region.pathname,
            Some(PathBuf::from("/lib/x86_64-linux-gnu/libc.so.6"))
        );
        assert_eq!(region.prot_flags(), ProtFlags::PROT_READ | ProtFlags::PROT_EXEC);
    }

    #[test]
    fn test_parse_anonymous_mapping() {
        let region = parse_maps_line("7ffd1234000-7ffd1235000 rw-s 00000000 00:00 0").unwrap();
        assert_eq!(region.prot, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE);
        assert!(region.shared);
        assert_eq!(region.pathname, None);
        assert_eq!(region.size(), 0x1000);
    }

    #[test]
    fn test_parse_path_with_spaces() {
        let region = parse_maps_line("1000-2000 r-xp 00001000 fd:00 42 /data/app/my lib/libfoo.so").unwrap();
        assert_eq!(region.pathname, Some(PathBuf::from("/data/app/my lib/libfoo.so")));
        assert_eq!(region.offset, 0x1000);
    }

    #[test]
    fn test_reject_malformed_lines() {
        assert!(parse_maps_line("").is_none());
        assert!(parse_maps_line("zzzz-1000 r-xp 0 00:00 0").is_none());
        assert!(parse_maps_line("2000-1000 r-xp 0 00:00 0").is_none());
        assert!(parse_maps_line("1000-2000 rx 0 00:00 0").is_none());
        assert!(parse_maps_line("1000-2000 rqxp 0 00:00 0").is_none());
    }

    #[test]
    fn test_find_region_between_mappings() {
        let regions = parse_maps(
            "3000-4000 r-xp 0 00:00 0\n\
             1000-2000 r--p 0 00:00 0\n\
             garbage\n",
        );
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].start, 0x1000);
        assert_eq!(find_region(&regions, 0x1fff).map(|r| r.start), Some(0x1000));
        assert!(find_region(&regions, 0x2000).is_none());
        assert_eq!(find_region(&regions, 0x3000).map(|r| r.start), Some(0x3000));
        assert!(find_region(&regions, 0x4000).is_none());
    }

    #[test]
    fn test_find_region_in_self() {
        let regions = parse_proc_maps().unwrap();
        let here = test_find_region_in_self as usize;
        let region = find_region(&regions, here).expect("own code must be mapped");
        assert!(region.is_executable());
        assert!(region.contains(here));
    }
}
