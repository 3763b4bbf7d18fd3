/// 解析パイプライン共通のエラー型
///
/// ストリーム不足はデコード単位で致命的。
/// それ以外はタスク復元段階のみを失敗させる（`app_parser`参照）

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForensicError {
    #[error("Stream exhausted at offset {offset}: needed {needed} bytes, {remaining} remaining")]
    StreamExhausted {
        offset: usize,
        needed: usize,
        remaining: usize,
    },

    #[error("Unsupported architecture: bytes at 0x{address:08x} are {found:02x?}")]
    UnsupportedArchitecture { address: u32, found: [u8; 4] },

    #[error("Unresolved runtime symbol: {0}")]
    UnresolvedRuntimeSymbol(String),

    #[error("Simulation fault at 0x{address:08x} ({instruction}): {reason}")]
    SimulationFault {
        address: u32,
        instruction: String,
        reason: String,
    },

    #[error("Missing anchor address: {0}")]
    MissingAnchor(&'static str),

    #[error("No candidate function found: {0}")]
    NoCandidate(String),

    #[error("Internal symbol table at 0x{address:08x} declares 0x{declared:x} bytes, 0x{available:x} available")]
    TableOutOfBounds {
        address: u32,
        declared: u64,
        available: u64,
    },

    #[error("Tag nesting deeper than {0} levels")]
    NestingTooDeep(usize),

    #[error("Disassembler error: {0}")]
    Disassembler(String),
}

impl From<capstone::Error> for ForensicError {
    fn from(error: capstone::Error) -> Self {
        ForensicError::Disassembler(error.to_string())
    }
}

impl ForensicError {
    /// シミュレーション失敗を生成するヘルパー
    pub fn fault(address: u32, instruction: impl Into<String>, reason: impl Into<String>) -> Self {
        ForensicError::SimulationFault {
            address,
            instruction: instruction.into(),
            reason: reason.into(),
        }
    }
}

/// Result型エイリアス
pub type Result<T> = std::result::Result<T, ForensicError>;
