use super::Prologue;
use crate::error::PatchError;

/// リダイレクトを持たない
pub const REDIRECT_LEN: usize = 0;

/// テスト用の関数はない
pub const PATCHABLE_ADD: &[u8] = &[];

/// 空の命令列
pub fn redirect_bytes(_destination: usize, _stolen_len: usize) -> Vec<u8> {
    Vec::new()
}

/// どの関数も書き換えられない
pub fn analyze(target: usize, _code: &[u8]) -> Result<Prologue, PatchError> {
    Err(PatchError::unsafe_target(
        target,
        "no trampoline encoding for this architecture",
    ))
}

/// サンクは作れない
pub fn build_thunk(prologue: &Prologue, _thunk_address: usize) -> Result<Vec<u8>, PatchError> {
    Err(PatchError::unsafe_target(
        prologue.target,
        "no trampoline encoding for this architecture",
    ))
}
