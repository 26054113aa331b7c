use thiserror::Error;

/// シンボル解決のエラー
#[derive(Debug, Error)]
pub enum ResolveError {
    /// どの候補もロードできなかった
    #[error("library {library:?} not found: {message}")]
    LibraryNotFound { library: String, message: String },

    /// ライブラリはロードできたがシンボルがない
    #[error("symbol {symbol:?} not found in {library:?}: {message}")]
    SymbolNotFound {
        library: String,
        symbol: String,
        message: String,
    },
}

impl ResolveError {
    /// 対象のライブラリ名
    pub fn library(&self) -> &str {
        match self {
            ResolveError::LibraryNotFound { library, .. }
            | ResolveError::SymbolNotFound { library, .. } => library,
        }
    }
}
