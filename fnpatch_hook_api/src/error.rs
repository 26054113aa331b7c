use crate::key::HookKey;
use fnpatch_loader::ResolveError;
use fnpatch_rewriter::PatchError;
use thiserror::Error;

/// フックの導入・解除のエラー
#[derive(Debug, Error)]
pub enum HookError {
    #[error("library {library:?} not found: {message}")]
    LibraryNotFound { library: String, message: String },

    #[error("symbol {symbol:?} not found in {library:?}: {message}")]
    SymbolNotFound {
        library: String,
        symbol: String,
        message: String,
    },

    #[error("changing protection at {address:#x} was denied: {source}")]
    ProtectionDenied {
        address: usize,
        #[source]
        source: nix::Error,
    },

    #[error("{address:#x} is not a patchable code address: {reason}")]
    InvalidTarget { address: usize, reason: String },

    #[error("refusing to patch {address:#x}: {reason}")]
    UnsafeTarget { address: usize, reason: String },

    /// 同じキーで導入・解除が進行中（fail-fast設定時）
    #[error("{key} is being installed or uninstalled by another thread")]
    InstallInProgress { key: HookKey },

    /// 元のバイト列を書き戻せなかった。キーはDegradedのまま残る
    #[error("failed to restore the original code of {key}: {source}")]
    RevertFailed {
        key: HookKey,
        #[source]
        source: PatchError,
    },
}

impl From<ResolveError> for HookError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::LibraryNotFound { library, message } => {
                HookError::LibraryNotFound { library, message }
            }
            ResolveError::SymbolNotFound {
                library,
                symbol,
                message,
            } => HookError::SymbolNotFound {
                library,
                symbol,
                message,
            },
        }
    }
}

impl From<PatchError> for HookError {
    fn from(err: PatchError) -> Self {
        match err {
            PatchError::ProtectionDenied { address, source } => {
                HookError::ProtectionDenied { address, source }
            }
            PatchError::InvalidTarget { address, reason } => {
                HookError::InvalidTarget { address, reason }
            }
            PatchError::UnsafeTarget { address, reason } => {
                HookError::UnsafeTarget { address, reason }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;

    #[test]
    fn test_patch_errors_keep_their_kind() {
        let err: HookError = PatchError::ProtectionDenied {
            address: 0x1000,
            source: Errno::EACCES,
        }
        .into();
        assert!(matches!(
            err,
            HookError::ProtectionDenied {
                address: 0x1000,
                source: Errno::EACCES
            }
        ));
    }

    #[test]
    fn test_resolve_errors_keep_their_names() {
        let err: HookError = ResolveError::SymbolNotFound {
            library: "libdemo.so".into(),
            symbol: "add".into(),
            message: "undefined".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "symbol \"add\" not found in \"libdemo.so\": undefined"
        );
    }
}
