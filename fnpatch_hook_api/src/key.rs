use std::fmt;

/// フックの識別子 (ライブラリ, シンボル)
///
/// ライブラリ名が空ならメインプログラムを指す。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookKey {
    /// ライブラリ名
    pub library: String,
    /// シンボル名
    pub symbol: String,
}

impl HookKey {
    /// キーを作成
    pub fn new(library: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            library: library.into(),
            symbol: symbol.into(),
        }
    }
}

impl fmt::Display for HookKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.library.is_empty() {
            write!(f, "<main>!{}", self.symbol)
        } else {
            write!(f, "{}!{}", self.library, self.symbol)
        }
    }
}

/// キーごとの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    Uninstalled,
    Installing,
    Installed,
    Uninstalling,
    /// 解除に失敗し、書き換えが残っている
    Degraded,
}

impl HookState {
    /// 対象のコードが書き換わっている状態か
    pub fn is_hooked(self) -> bool {
        matches!(self, HookState::Installed | HookState::Degraded)
    }
}
