use std::path::PathBuf;

/// 追加の検索ディレクトリを指定する環境変数（`:`区切り）
pub const LIBRARY_PATH_ENV: &str = "FNPATCH_LIBRARY_PATH";

/// `DlResolver`の設定
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// ライブラリ名（`/`を含まないもの）を探すディレクトリ。先頭から順に試す
    pub search_paths: Vec<PathBuf>,
    /// `RTLD_NOW`でロードする（falseなら`RTLD_LAZY`）
    pub bind_now: bool,
    /// ロード済みのライブラリだけを対象にする（`RTLD_NOLOAD`）
    pub noload: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            bind_now: true,
            noload: false,
        }
    }
}

impl ResolverConfig {
    /// 新しい設定を作成
    pub fn new() -> Self {
        Self::default()
    }

    /// 検索ディレクトリを追加
    pub fn search_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_paths.push(dir.into());
        self
    }

    /// シンボルを`dlopen`時にすべて束縛するか（`RTLD_NOW`）
    pub fn bind_now(mut self, enabled: bool) -> Self {
        self.bind_now = enabled;
        self
    }

    /// ロード済みのライブラリだけを開くか（`RTLD_NOLOAD`）
    pub fn noload(mut self, enabled: bool) -> Self {
        self.noload = enabled;
        self
    }

    /// デフォルト設定に`FNPATCH_LIBRARY_PATH`のディレクトリを加えたもの
    pub fn from_env() -> Self {
        match std::env::var(LIBRARY_PATH_ENV) {
            Ok(value) => Self::default().with_path_list(&value),
            Err(_) => Self::default(),
        }
    }

    /// `:`区切りのディレクトリ列を検索パスに追加
    pub fn with_path_list(mut self, list: &str) -> Self {
        for dir in list.split(':') {
            if !dir.is_empty() {
                self = self.search_path(dir);
            }
        }
        self
    }

    pub(crate) fn dlopen_flags(&self) -> libc::c_int {
        let mut flags = if self.bind_now {
            libc::RTLD_NOW
        } else {
            libc::RTLD_LAZY
        };
        flags |= libc::RTLD_LOCAL;
        if self.noload {
            flags |= libc::RTLD_NOLOAD;
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_list_skips_empty_entries() {
        let config = ResolverConfig::new().with_path_list("/opt/a::/opt/b:");
        assert_eq!(
            config.search_paths,
            vec![PathBuf::from("/opt/a"), PathBuf::from("/opt/b")]
        );
    }

    #[test]
    fn test_flags() {
        let config = ResolverConfig::new();
        assert_eq!(config.dlopen_flags() & libc::RTLD_NOW, libc::RTLD_NOW);
        assert_eq!(config.dlopen_flags() & libc::RTLD_NOLOAD, 0);

        let config = config.bind_now(false).noload(true);
        assert_eq!(config.dlopen_flags() & libc::RTLD_NOW, 0);
        assert_eq!(config.dlopen_flags() & libc::RTLD_NOLOAD, libc::RTLD_NOLOAD);
    }
}
