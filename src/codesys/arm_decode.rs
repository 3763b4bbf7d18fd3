/// ARMv7命令デコーダ
///
/// Capstoneの出力をオペランドまで含めて所有型に写し取る。
/// シミュレータとxrefグラフ構築の両方から使われる

use crate::error::{ForensicError, Result};
use crate::memory::MemoryImage;
use capstone::arch::arm::{ArchMode, ArmOperandType, ArmShift};
use capstone::prelude::*;

const CONDITION_CODES: [&str; 17] = [
    "eq", "ne", "cs", "hs", "cc", "lo", "mi", "pl", "vs", "vc", "hi", "ls", "ge", "lt", "gt", "le", "al",
];

/// メモリオペランド `[base, ±index, #disp]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemOperand {
    pub base: String,
    pub index: Option<String>,
    pub subtracted: bool,
    pub disp: i32,
    pub shifted: bool,
}

/// オペランド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Reg(String),
    /// シフト付きレジスタ（シミュレータ非対応）
    ShiftedReg(String),
    Imm(i64),
    Mem(MemOperand),
    Other,
}

/// デコード済み命令
#[derive(Debug, Clone)]
pub struct DecodedInsn {
    pub address: u32,
    pub size: u32,
    pub mnemonic: String,
    pub op_str: String,
    pub operands: Vec<Operand>,
    pub writeback: bool,
}

impl DecodedInsn {
    /// `"mnemonic op_str"` 形式のテキスト
    pub fn text(&self) -> String {
        if self.op_str.is_empty() {
            self.mnemonic.clone()
        } else {
            format!("{} {}", self.mnemonic, self.op_str)
        }
    }

    pub fn is(&self, text: &str) -> bool {
        self.text() == text
    }

    /// 分岐系（b/bl/bx/blxと条件付き変種）
    pub fn is_branch(&self) -> bool {
        let m = self.mnemonic.trim_end_matches(".w").trim_end_matches(".n");
        ["blx", "bl", "bx", "b"].iter().any(|base| {
            m.strip_prefix(base)
                .map_or(false, |cond| cond.is_empty() || CONDITION_CODES.contains(&cond))
        })
    }

    /// 無条件分岐
    pub fn is_unconditional_branch(&self) -> bool {
        matches!(self.mnemonic.as_str(), "b" | "bl" | "bx" | "blx")
    }

    /// 即値の分岐先
    pub fn branch_target(&self) -> Option<u32> {
        if !self.is_branch() {
            return None;
        }
        match self.operands.first() {
            Some(Operand::Imm(target)) => Some(*target as u32),
            _ => None,
        }
    }
}

/// Capstoneのラッパー
pub struct ArmDecoder {
    cs: Capstone,
    thumb: bool,
}

impl ArmDecoder {
    pub fn new(thumb: bool) -> Result<Self> {
        let mode = if thumb { ArchMode::Thumb } else { ArchMode::Arm };
        let cs = Capstone::new().arm().mode(mode).detail(true).build()?;

        Ok(Self { cs, thumb })
    }

    pub fn is_thumb(&self) -> bool {
        self.thumb
    }

    /// PC読み出し時に加算される値
    pub fn pc_read_offset(&self) -> u32 {
        if self.thumb {
            4
        } else {
            8
        }
    }

    /// メモリイメージ上の1命令をデコード
    pub fn decode_at(&self, memory: &MemoryImage, address: u32) -> Result<DecodedInsn> {
        let code = memory.read_bytes(address, 4);
        self.decode(&code, address)
    }

    /// バイト列先頭の1命令をデコード
    pub fn decode(&self, code: &[u8], address: u32) -> Result<DecodedInsn> {
        let insns = self.cs.disasm_count(code, address as u64, 1)?;
        let insn = insns.iter().next().ok_or_else(|| {
            ForensicError::fault(address, format!("{:02x?}", code), "undecodable bytes")
        })?;

        let mnemonic = insn.mnemonic().unwrap_or("").to_string();
        let op_str = insn.op_str().unwrap_or("").to_string();
        let size = insn.bytes().len() as u32;

        let detail = self.cs.insn_detail(&insn)?;
        let arch_detail = detail.arch_detail();
        let arm = arch_detail.arm().ok_or_else(|| {
            ForensicError::Disassembler("instruction detail is not ARM".to_string())
        })?;

        let mut operands = Vec::new();
        for op in arm.operands() {
            let shifted = !matches!(op.shift, ArmShift::Invalid);
            let operand = match op.op_type {
                ArmOperandType::Reg(reg) => {
                    let name = self.reg_name(reg);
                    if shifted {
                        Operand::ShiftedReg(name)
                    } else {
                        Operand::Reg(name)
                    }
                }
                ArmOperandType::Imm(imm) => Operand::Imm(imm as i64),
                ArmOperandType::Mem(mem) => {
                    let index = if mem.index().0 != 0 {
                        Some(self.reg_name(mem.index()))
                    } else {
                        None
                    };
                    Operand::Mem(MemOperand {
                        base: self.reg_name(mem.base()),
                        index,
                        subtracted: op.subtracted,
                        disp: mem.disp(),
                        shifted,
                    })
                }
                _ => Operand::Other,
            };
            operands.push(operand);
        }

        Ok(DecodedInsn {
            address,
            size,
            mnemonic,
            op_str,
            operands,
            writeback: arm.writeback(),
        })
    }

    fn reg_name(&self, reg: RegId) -> String {
        self.cs
            .reg_name(reg)
            .unwrap_or_else(|| format!("reg{}", reg.0))
    }
}
