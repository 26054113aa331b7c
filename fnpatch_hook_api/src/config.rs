use log::warn;

/// 競合時の振る舞いを指定する環境変数（`block` / `fail-fast`）
pub const CONTENTION_ENV: &str = "FNPATCH_CONTENTION";

/// 同じキーで導入・解除が進行中のときの振る舞い
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Contention {
    /// 進行中の遷移が終わるまで待つ
    #[default]
    Block,
    /// すぐに`InstallInProgress`を返す
    FailFast,
}

impl Contention {
    /// 環境変数の値を解釈する（大文字小文字は区別しない）
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "block" => Some(Contention::Block),
            "fail-fast" | "failfast" | "fail_fast" => Some(Contention::FailFast),
            _ => None,
        }
    }
}

/// フックレジストリの設定
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    /// 競合時の振る舞い
    pub contention: Contention,
}

impl RegistryConfig {
    /// 新しい設定を作成
    pub fn new() -> Self {
        Self::default()
    }

    /// 競合時の振る舞いを指定
    pub fn contention(mut self, contention: Contention) -> Self {
        self.contention = contention;
        self
    }

    /// `FNPATCH_CONTENTION`を反映した設定
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var(CONTENTION_ENV) {
            match Contention::parse(&value) {
                Some(contention) => config.contention = contention,
                None => warn!("ignoring {}={:?}", CONTENTION_ENV, value),
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_contention() {
        assert_eq!(Contention::parse("block"), Some(Contention::Block));
        assert_eq!(Contention::parse(" Fail-Fast "), Some(Contention::FailFast));
        assert_eq!(Contention::parse("spin"), None);
    }

    #[test]
    fn test_default_blocks() {
        assert_eq!(RegistryConfig::new().contention, Contention::Block);
        let config = RegistryConfig::new().contention(Contention::FailFast);
        assert_eq!(config.contention, Contention::FailFast);
    }
}
