use super::Prologue;
use crate::error::PatchError;
use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, FlowControl, Instruction,
    InstructionBlock,
};

/// `jmp qword ptr [rip+0]` + 8バイトの絶対アドレス
///
/// レジスタを一切壊さないので、呼び出し規約に関係なく関数先頭に置ける。
pub const REDIRECT_LEN: usize = 14;

const JMP_RIP_INDIRECT: [u8; 6] = [0xff, 0x25, 0x00, 0x00, 0x00, 0x00];
const INT3: u8 = 0xcc;

/// 書き換え可能な`int add(int a, int b)`
///
/// プロローグが`REDIRECT_LEN`より長くなるようにNOPを挟んである。
pub const PATCHABLE_ADD: &[u8] = &[
    0x55, // push rbp
    0x48, 0x89, 0xe5, // mov rbp, rsp
    0x89, 0xf8, // mov eax, edi
    0x01, 0xf0, // add eax, esi
    0x0f, 0x1f, 0x44, 0x00, 0x00, // nop dword ptr [rax+rax]
    0x0f, 0x1f, 0x44, 0x00, 0x00, // nop dword ptr [rax+rax]
    0x5d, // pop rbp
    0xc3, // ret
];

/// 絶対ジャンプを生成
fn encode_redirect(destination: u64) -> [u8; REDIRECT_LEN] {
    let mut bytes = [0u8; REDIRECT_LEN];
    bytes[..6].copy_from_slice(&JMP_RIP_INDIRECT);
    bytes[6..].copy_from_slice(&destination.to_le_bytes());
    bytes
}

/// 上書き範囲に書くバイト列（余りはint3で埋める）
pub fn redirect_bytes(destination: usize, stolen_len: usize) -> Vec<u8> {
    let mut bytes = encode_redirect(destination as u64).to_vec();
    bytes.resize(stolen_len.max(REDIRECT_LEN), INT3);
    bytes
}

/// `code`（`target`から読んだバイト列）の先頭を解析する
///
/// `REDIRECT_LEN`バイト以上を命令単位で覆うまでデコードする。その途中で関数が終わる
/// （ret / jmp / int3 など）場合や、後続の命令が上書き範囲の内側へ分岐する場合は拒否する。
pub fn analyze(target: usize, code: &[u8]) -> Result<Prologue, PatchError> {
    let instructions = decode_prologue(target, code)?;
    let len: usize = instructions.iter().map(|instr| instr.len()).sum();
    let stolen = target..target + len;

    for instr in &instructions {
        let branches = matches!(
            instr.flow_control(),
            FlowControl::ConditionalBranch | FlowControl::UnconditionalBranch | FlowControl::Call
        );
        if branches && stolen.contains(&(instr.near_branch_target() as usize)) {
            return Err(PatchError::unsafe_target(
                target,
                format!(
                    "instruction at {:#x} branches back into the overwritten bytes",
                    instr.ip()
                ),
            ));
        }
    }

    Ok(Prologue {
        target,
        bytes: code[..len].to_vec(),
    })
}

fn decode_prologue(target: usize, code: &[u8]) -> Result<Vec<Instruction>, PatchError> {
    let mut decoder = Decoder::with_ip(64, code, target as u64, DecoderOptions::NONE);
    let mut instructions = Vec::new();
    let mut len = 0;

    while len < REDIRECT_LEN {
        if !decoder.can_decode() {
            return Err(PatchError::unsafe_target(
                target,
                format!("only {} readable code bytes before the mapping ends", len),
            ));
        }
        let instr = decoder.decode();
        if instr.is_invalid() {
            return Err(PatchError::unsafe_target(
                target,
                format!("undecodable instruction at +{}", len),
            ));
        }
        len += instr.len();

        let terminates = matches!(
            instr.flow_control(),
            FlowControl::Return
                | FlowControl::UnconditionalBranch
                | FlowControl::IndirectBranch
                | FlowControl::Interrupt
                | FlowControl::Exception
                | FlowControl::XbeginXabortXend
        );
        if terminates && len < REDIRECT_LEN {
            return Err(PatchError::unsafe_target(
                target,
                format!(
                    "function ends after {} bytes, {} needed for the redirect",
                    len, REDIRECT_LEN
                ),
            ));
        }
        instructions.push(instr);
    }

    Ok(instructions)
}

/// 上書きした命令を`thunk_address`に再配置し、元関数の続きへ戻るコードを作る
///
/// 相対分岐・RIP相対オペランドはiced-x86のBlockEncoderが書き直す。
/// サンクが離れすぎていて届かない場合は`UnsafeTarget`。
pub fn build_thunk(prologue: &Prologue, thunk_address: usize) -> Result<Vec<u8>, PatchError> {
    let instructions = decode_prologue(prologue.target, &prologue.bytes)?;
    let block = InstructionBlock::new(&instructions, thunk_address as u64);
    let encoded = BlockEncoder::encode(64, block, BlockEncoderOptions::NONE).map_err(|e| {
        PatchError::unsafe_target(
            prologue.target,
            format!("prologue cannot be relocated to {:#x}: {}", thunk_address, e),
        )
    })?;

    let mut code = encoded.code_buffer;
    code.extend_from_slice(&encode_redirect(prologue.resume_address() as u64));
    Ok(code)
}
