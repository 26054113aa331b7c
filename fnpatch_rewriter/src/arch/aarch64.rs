use super::Prologue;
use crate::error::PatchError;

/// `ldr x16, #8; br x16; .quad destination`
pub const REDIRECT_LEN: usize = 16;

const LDR_X16_LITERAL_8: u32 = 0x5800_0050;
const BR_X16: u32 = 0xd61f_0200;

/// 書き換え可能な`int add(int a, int b)`
pub const PATCHABLE_ADD: &[u8] = &words_to_bytes([
    0xa9bf_7bfd, // stp x29, x30, [sp, #-16]!
    0x9100_03fd, // mov x29, sp
    0x0b01_0000, // add w0, w0, w1
    0xd503_201f, // nop
    0xd503_201f, // nop
    0xa8c1_7bfd, // ldp x29, x30, [sp], #16
    0xd65f_03c0, // ret
]);

const fn words_to_bytes(words: [u32; 7]) -> [u8; 28] {
    let mut bytes = [0u8; 28];
    let mut i = 0;
    while i < words.len() {
        let le = words[i].to_le_bytes();
        bytes[i * 4] = le[0];
        bytes[i * 4 + 1] = le[1];
        bytes[i * 4 + 2] = le[2];
        bytes[i * 4 + 3] = le[3];
        i += 1;
    }
    bytes
}

fn encode_redirect(destination: u64) -> [u8; REDIRECT_LEN] {
    let mut bytes = [0u8; REDIRECT_LEN];
    bytes[0..4].copy_from_slice(&LDR_X16_LITERAL_8.to_le_bytes());
    bytes[4..8].copy_from_slice(&BR_X16.to_le_bytes());
    bytes[8..16].copy_from_slice(&destination.to_le_bytes());
    bytes
}

/// 上書き範囲に書くバイト列
pub fn redirect_bytes(destination: usize, stolen_len: usize) -> Vec<u8> {
    debug_assert_eq!(stolen_len, REDIRECT_LEN);
    encode_redirect(destination as u64).to_vec()
}

/// PC相対の命令（別の場所へコピーすると意味が変わる）
fn is_pc_relative(insn: u32) -> bool {
    (insn & 0x7c00_0000) == 0x1400_0000 // b / bl
        || (insn & 0xff00_0010) == 0x5400_0000 // b.cond
        || (insn & 0x7e00_0000) == 0x3400_0000 // cbz / cbnz
        || (insn & 0x7e00_0000) == 0x3600_0000 // tbz / tbnz
        || (insn & 0x1f00_0000) == 0x1000_0000 // adr / adrp
        || (insn & 0x3b00_0000) == 0x1800_0000 // ldr (literal)
}

/// 関数の終わりになりうる命令
fn terminates(insn: u32) -> bool {
    let masked = insn & 0xffff_fc1f;
    masked == 0xd65f_0000 // ret
        || masked == 0xd61f_0000 // br
        || (insn & 0xffe0_001f) == 0xd420_0000 // brk
}

/// 先頭4命令を解析する
///
/// AArch64は固定長なので上書き長は常に`REDIRECT_LEN`。PC相対命令の再配置はせず、
/// 含まれていれば`UnsafeTarget`として拒否する。
pub fn analyze(target: usize, code: &[u8]) -> Result<Prologue, PatchError> {
    if target & 0b11 != 0 {
        return Err(PatchError::invalid(target, "instruction address is not 4-byte aligned"));
    }
    if code.len() < REDIRECT_LEN {
        return Err(PatchError::unsafe_target(
            target,
            format!("only {} readable code bytes before the mapping ends", code.len()),
        ));
    }

    let count = REDIRECT_LEN / 4;
    for (index, chunk) in code[..REDIRECT_LEN].chunks_exact(4).enumerate() {
        let insn = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if is_pc_relative(insn) {
            return Err(PatchError::unsafe_target(
                target,
                format!("pc-relative instruction {:#010x} at +{}", insn, index * 4),
            ));
        }
        if terminates(insn) && index + 1 < count {
            return Err(PatchError::unsafe_target(
                target,
                format!("function ends after {} bytes", (index + 1) * 4),
            ));
        }
    }

    Ok(Prologue {
        target,
        bytes: code[..REDIRECT_LEN].to_vec(),
    })
}

/// 上書きした4命令 + 元関数の続きへの絶対ジャンプ
pub fn build_thunk(prologue: &Prologue, thunk_address: usize) -> Result<Vec<u8>, PatchError> {
    if thunk_address & 0b111 != 0 {
        return Err(PatchError::unsafe_target(
            prologue.target,
            format!("thunk {:#x} is not 8-byte aligned", thunk_address),
        ));
    }
    let mut code = prologue.bytes.clone();
    code.extend_from_slice(&encode_redirect(prologue.resume_address() as u64));
    Ok(code)
}
