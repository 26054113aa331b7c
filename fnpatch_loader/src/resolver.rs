use crate::config::ResolverConfig;
use crate::error::ResolveError;
use crate::handle::{last_dl_error, LibraryHandle};
use log::debug;
use std::collections::HashMap;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// 解決済みのシンボル
///
/// `handle`を持っている間はライブラリがアンマップされない。
#[derive(Debug)]
pub struct ResolvedSymbol {
    /// シンボルを定義しているライブラリ
    pub handle: LibraryHandle,
    /// シンボルのアドレス
    pub address: usize,
}

/// (ライブラリ, シンボル) からアドレスを求める
///
/// 同じメモリ配置に対しては常に同じ結果を返すこと。
pub trait SymbolResolver: Send + Sync {
    /// `library`自身が定義する`symbol`を探す
    fn resolve(&self, library: &str, symbol: &str) -> Result<ResolvedSymbol, ResolveError>;
}

/// 動的ローダー（`dlopen`/`dlsym`）による解決
///
/// ロード済みのライブラリを開き直しても参照カウントが増えるだけで、
/// 二重にマップされることはない。
#[derive(Debug, Clone, Default)]
pub struct DlResolver {
    config: ResolverConfig,
}

impl DlResolver {
    /// 既定の設定で作成
    pub fn new() -> Self {
        Self::default()
    }

    /// 設定を指定して作成
    pub fn with_config(config: ResolverConfig) -> Self {
        Self { config }
    }

    /// 現在の設定
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// `library`について試すパスを順に並べる
    ///
    /// 1. `/`を含む名前はそのまま
    /// 2. 検索ディレクトリ内に存在するファイル
    /// 3. 名前だけ（ローダー自身の検索に任せる）
    pub(crate) fn candidates(&self, library: &str) -> Vec<PathBuf> {
        if library.contains('/') {
            return vec![PathBuf::from(library)];
        }
        let mut candidates: Vec<PathBuf> = self
            .config
            .search_paths
            .iter()
            .map(|dir| dir.join(library))
            .filter(|path| path.exists())
            .collect();
        candidates.push(PathBuf::from(library));
        candidates
    }

    fn open(&self, library: &str) -> Result<LibraryHandle, ResolveError> {
        let flags = self.config.dlopen_flags();

        // 空の名前はメインプログラム
        if library.is_empty() {
            let raw = unsafe { libc::dlopen(std::ptr::null(), flags) };
            return match NonNull::new(raw) {
                Some(raw) => Ok(unsafe { LibraryHandle::from_raw(raw, "<main program>") }),
                None => Err(ResolveError::LibraryNotFound {
                    library: String::new(),
                    message: last_dl_error(),
                }),
            };
        }

        let mut last_message = String::from("no candidate path");
        for candidate in self.candidates(library) {
            let c_path = match path_to_cstring(&candidate) {
                Some(c_path) => c_path,
                None => {
                    last_message = format!("{} contains a NUL byte", candidate.display());
                    continue;
                }
            };
            let raw = unsafe { libc::dlopen(c_path.as_ptr(), flags) };
            match NonNull::new(raw) {
                Some(raw) => {
                    debug!("opened {} as {}", library, candidate.display());
                    return Ok(unsafe { LibraryHandle::from_raw(raw, library) });
                }
                None => {
                    last_message = last_dl_error();
                    debug!("dlopen({}) failed: {}", candidate.display(), last_message);
                }
            }
        }

        Err(ResolveError::LibraryNotFound {
            library: library.to_string(),
            message: last_message,
        })
    }
}

impl SymbolResolver for DlResolver {
    fn resolve(&self, library: &str, symbol: &str) -> Result<ResolvedSymbol, ResolveError> {
        let handle = self.open(library)?;

        let not_found = |message: String| ResolveError::SymbolNotFound {
            library: library.to_string(),
            symbol: symbol.to_string(),
            message,
        };
        let c_symbol =
            CString::new(symbol).map_err(|_| not_found("symbol name contains a NUL byte".into()))?;

        // 直前のエラーを捨ててから引く
        unsafe { libc::dlerror() };
        let address = unsafe { libc::dlsym(handle.as_ptr(), c_symbol.as_ptr()) } as usize;
        if address == 0 {
            // handleはここでDropされ、dlcloseされる
            return Err(not_found(last_dl_error()));
        }

        // 空の名前はプログラム全体から探す
        if !library.is_empty() {
            if let Some(owner) = handle.foreign_owner(address) {
                debug!("{}!{} is defined by {}", library, symbol, owner);
                return Err(not_found(format!("only found in dependency {}", owner)));
            }
        }

        debug!("resolved {}!{} at {:#x}", handle.name(), symbol, address);
        Ok(ResolvedSymbol { handle, address })
    }
}

fn path_to_cstring(path: &Path) -> Option<CString> {
    CString::new(path.as_os_str().as_bytes()).ok()
}

/// 既知のアドレス表による解決
///
/// アドレスが分かっている呼び出し側やテスト向け。ハンドルは何も所有しない。
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    symbols: HashMap<(String, String), usize>,
}

impl StaticResolver {
    /// 空の表を作成
    pub fn new() -> Self {
        Self::default()
    }

    /// シンボルを登録する（同じキーは上書き）
    pub fn register(
        mut self,
        library: impl Into<String>,
        symbol: impl Into<String>,
        address: usize,
    ) -> Self {
        self.symbols.insert((library.into(), symbol.into()), address);
        self
    }

    fn has_library(&self, library: &str) -> bool {
        self.symbols.keys().any(|(lib, _)| lib == library)
    }
}

impl SymbolResolver for StaticResolver {
    fn resolve(&self, library: &str, symbol: &str) -> Result<ResolvedSymbol, ResolveError> {
        if let Some(&address) = self.symbols.get(&(library.to_string(), symbol.to_string())) {
            return Ok(ResolvedSymbol {
                handle: LibraryHandle::detached(library),
                address,
            });
        }
        if self.has_library(library) {
            Err(ResolveError::SymbolNotFound {
                library: library.to_string(),
                symbol: symbol.to_string(),
                message: "not registered".to_string(),
            })
        } else {
            Err(ResolveError::LibraryNotFound {
                library: library.to_string(),
                message: "not registered".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIBC: &str = "libc.so.6";

    #[test]
    fn test_resolve_getpid_from_libc() {
        let resolver = DlResolver::new();
        let resolved = resolver.resolve(LIBC, "getpid").unwrap();
        assert!(!resolved.handle.is_detached());

        let getpid: extern "C" fn() -> libc::pid_t =
            unsafe { std::mem::transmute(resolved.address) };
        assert_eq!(getpid() as u32, std::process::id());
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let resolver = DlResolver::new();
        let first = resolver.resolve(LIBC, "strlen").unwrap();
        let second = resolver.resolve(LIBC, "strlen").unwrap();
        assert_eq!(first.address, second.address);
    }

    #[test]
    fn test_missing_library() {
        let resolver = DlResolver::new();
        let err = resolver
            .resolve("libfnpatch-does-not-exist.so", "anything")
            .unwrap_err();
        assert!(matches!(err, ResolveError::LibraryNotFound { .. }));
        assert_eq!(err.library(), "libfnpatch-does-not-exist.so");
    }

    #[test]
    fn test_missing_symbol() {
        let resolver = DlResolver::new();
        let err = resolver
            .resolve(LIBC, "fnpatch_no_such_symbol")
            .unwrap_err();
        assert!(matches!(err, ResolveError::SymbolNotFound { .. }));
    }

    #[test]
    fn test_dependency_symbol_is_not_found() {
        let resolver = DlResolver::new();
        // libmはlibcに依存しているが、getpidを定義しているのはlibcだけ
        let err = resolver.resolve("libm.so.6", "getpid").unwrap_err();
        assert!(matches!(err, ResolveError::SymbolNotFound { .. }));
        assert_eq!(err.library(), "libm.so.6");

        let cos = resolver.resolve("libm.so.6", "cos").unwrap();
        let getpid = resolver.resolve(LIBC, "getpid").unwrap();
        assert_ne!(cos.address, getpid.address);
    }

    #[test]
    fn test_main_program() {
        let resolver = DlResolver::new();
        // メインプログラムのハンドルからは依存ライブラリのシンボルも見える
        let resolved = resolver.resolve("", "getpid").unwrap();
        assert_ne!(resolved.address, 0);
    }

    #[test]
    fn test_noload_only_accepts_mapped_libraries() {
        let resolver = DlResolver::with_config(ResolverConfig::new().noload(true));
        assert!(resolver.resolve(LIBC, "getpid").is_ok());
        let err = resolver.resolve("libfnpatch-does-not-exist.so", "x").unwrap_err();
        assert!(matches!(err, ResolveError::LibraryNotFound { .. }));
    }

    #[test]
    fn test_candidate_order() {
        let dir = std::env::temp_dir();
        let file = dir.join("fnpatch-candidate-test.so");
        std::fs::write(&file, b"").unwrap();

        let resolver = DlResolver::with_config(
            ResolverConfig::new()
                .search_path("/fnpatch/does/not/exist")
                .search_path(&dir),
        );
        assert_eq!(
            resolver.candidates("fnpatch-candidate-test.so"),
            vec![file.clone(), PathBuf::from("fnpatch-candidate-test.so")]
        );
        assert_eq!(
            resolver.candidates("/abs/libfoo.so"),
            vec![PathBuf::from("/abs/libfoo.so")]
        );

        std::fs::remove_file(&file).unwrap();
    }

    #[test]
    fn test_static_resolver() {
        let resolver = StaticResolver::new().register("libdemo.so", "add", 0x1234);

        let resolved = resolver.resolve("libdemo.so", "add").unwrap();
        assert_eq!(resolved.address, 0x1234);
        assert!(resolved.handle.is_detached());

        assert!(matches!(
            resolver.resolve("libdemo.so", "sub"),
            Err(ResolveError::SymbolNotFound { .. })
        ));
        assert!(matches!(
            resolver.resolve("libother.so", "add"),
            Err(ResolveError::LibraryNotFound { .. })
        ));
    }
}
