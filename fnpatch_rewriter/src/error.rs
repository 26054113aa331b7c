use nix::errno::Errno;
use thiserror::Error;

/// コード書き換えのエラー
#[derive(Debug, Clone, Error)]
pub enum PatchError {
    /// mprotectが権限不足で拒否された（EACCES / EPERM）
    #[error("changing protection at {address:#x} was denied: {source}")]
    ProtectionDenied {
        address: usize,
        #[source]
        source: nix::Error,
    },

    /// 書き換え可能なコード領域ではない
    #[error("{address:#x} is not a patchable code address: {reason}")]
    InvalidTarget { address: usize, reason: String },

    /// リダイレクトを書き込むと安全でない（関数境界・再配置不可など）
    #[error("refusing to patch {address:#x}: {reason}")]
    UnsafeTarget { address: usize, reason: String },
}

impl PatchError {
    /// 書き換えようとしたアドレス
    pub fn address(&self) -> usize {
        match self {
            PatchError::ProtectionDenied { address, .. }
            | PatchError::InvalidTarget { address, .. }
            | PatchError::UnsafeTarget { address, .. } => *address,
        }
    }

    pub(crate) fn invalid(address: usize, reason: impl Into<String>) -> Self {
        PatchError::InvalidTarget {
            address,
            reason: reason.into(),
        }
    }

    pub(crate) fn unsafe_target(address: usize, reason: impl Into<String>) -> Self {
        PatchError::UnsafeTarget {
            address,
            reason: reason.into(),
        }
    }

    /// mprotect / mmap のerrnoを分類する
    pub(crate) fn from_errno(address: usize, errno: nix::Error) -> Self {
        match errno {
            Errno::EACCES | Errno::EPERM => PatchError::ProtectionDenied {
                address,
                source: errno,
            },
            other => PatchError::invalid(address, format!("mprotect failed: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_classification() {
        let denied = PatchError::from_errno(0x1000, Errno::EACCES);
        assert!(matches!(denied, PatchError::ProtectionDenied { address: 0x1000, .. }));

        let perm = PatchError::from_errno(0x1000, Errno::EPERM);
        assert!(matches!(perm, PatchError::ProtectionDenied { .. }));

        let unmapped = PatchError::from_errno(0x2000, Errno::ENOMEM);
        assert!(matches!(unmapped, PatchError::InvalidTarget { address: 0x2000, .. }));
    }
}
