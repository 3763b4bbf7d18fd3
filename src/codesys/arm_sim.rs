/// ARM命令シミュレータ
///
/// 起動時に実行される少数の関数だけを動かすための最小インタプリタ。
/// 汎用エミュレータではなく、観測された命令サブセットのみをサポートし、
/// それ以外はすべて`SimulationFault`になる。
///
/// 状態遷移: Running --(pcがセンチネル)--> Hooked --(ハンドラ実行, pc=lr)--> Running
///          Running --(pc == END_ADDRESS)--> Terminated

use super::arm_decode::{ArmDecoder, DecodedInsn, MemOperand, Operand};
use crate::error::{ForensicError, Result};
use crate::memory::MemoryImage;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, trace};

/// 関数呼び出しごとの初期スタックポインタ
pub const STACK_BASE: u32 = 0xF000_0000;
/// 戻り先として`lr`に置く終了アドレス
pub const END_ADDRESS: u32 = 0xFFFF_FFFE;
/// 最初に払い出すセンチネル
pub const FIRST_SENTINEL: u32 = 0xFFFF_FFFD;

/// フックのハンドラ
pub type PatchHandler = Rc<dyn Fn(&mut ArmSimulator) -> Result<()>>;

/// フック済み関数
#[derive(Clone)]
pub struct PatchedFunction {
    pub name: String,
    pub sentinel_pc: u32,
    pub real_target_address: u32,
    handler: PatchHandler,
}

impl std::fmt::Debug for PatchedFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchedFunction")
            .field("name", &self.name)
            .field("sentinel_pc", &format_args!("0x{:08x}", self.sentinel_pc))
            .field("real_target_address", &format_args!("0x{:08x}", self.real_target_address))
            .finish()
    }
}

/// レジスタファイル（フラグ n/z/c/v を含む）。未設定は0
#[derive(Debug, Clone, Default)]
pub struct RegisterFile {
    regs: HashMap<String, u32>,
}

impl RegisterFile {
    pub fn get(&self, name: &str) -> u32 {
        self.regs.get(name).copied().unwrap_or(0)
    }

    pub fn set(&mut self, name: &str, value: u32) {
        self.regs.insert(name.to_string(), value);
    }

    pub fn flag(&self, name: &str) -> bool {
        self.get(name) != 0
    }

    pub fn set_flag(&mut self, name: &str, value: bool) {
        self.set(name, value as u32);
    }

    pub fn clear(&mut self) {
        self.regs.clear();
    }
}

/// メモリアクセス幅
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Word,
    Half,
    Byte,
}

/// 算術命令の右オペランド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Reg(String),
    Imm(u32),
}

/// 実行可能な命令（サポート範囲のすべて）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Mov { dst: String, src: Source },
    Push { regs: Vec<String> },
    Pop { regs: Vec<String> },
    Load { width: Width, dst: String, mem: MemOperand, writeback: bool },
    Store { width: Width, src: String, mem: MemOperand, writeback: bool },
    Add { dst: String, lhs: String, rhs: Source },
    Sub { dst: String, lhs: String, rhs: Source },
    Mul { dst: String, lhs: String, rhs: Source },
    /// `andvs`はVフラグが立っている時のみ実行
    And { dst: String, lhs: String, rhs: Source, only_if_overflow: bool },
    Cmp { lhs: String, rhs: Source },
    Branch { target: u32, link: bool },
    BranchGt { target: u32 },
}

impl Instruction {
    /// デコード結果からサポート命令へ変換
    pub fn lift(insn: &DecodedInsn) -> Result<Self> {
        let ops = insn.operands.as_slice();
        let unsupported = || ForensicError::fault(insn.address, insn.text(), "unsupported operand shape");

        let lifted = match insn.mnemonic.as_str() {
            "mov" => match ops {
                [Operand::Reg(dst), src] => Instruction::Mov {
                    dst: dst.clone(),
                    src: source(src).ok_or_else(unsupported)?,
                },
                _ => return Err(unsupported()),
            },
            "push" | "pop" => {
                let regs = ops
                    .iter()
                    .map(|op| match op {
                        Operand::Reg(r) => Some(r.clone()),
                        _ => None,
                    })
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(unsupported)?;
                if insn.mnemonic == "push" {
                    Instruction::Push { regs }
                } else {
                    Instruction::Pop { regs }
                }
            }
            "ldr" | "ldrb" | "ldrh" | "str" | "strb" | "strh" => {
                let (reg, mem) = match ops {
                    [Operand::Reg(reg), Operand::Mem(mem)] if !mem.shifted => (reg.clone(), mem.clone()),
                    _ => return Err(unsupported()),
                };
                let width = match insn.mnemonic.as_bytes().last() {
                    Some(b'b') => Width::Byte,
                    Some(b'h') => Width::Half,
                    _ => Width::Word,
                };
                if insn.mnemonic.starts_with("ldr") {
                    Instruction::Load { width, dst: reg, mem, writeback: insn.writeback }
                } else {
                    Instruction::Store { width, src: reg, mem, writeback: insn.writeback }
                }
            }
            "add" | "sub" | "mul" | "and" | "andvs" => {
                let (dst, lhs, rhs) = match ops {
                    [Operand::Reg(dst), Operand::Reg(lhs), rhs] => {
                        (dst.clone(), lhs.clone(), source(rhs).ok_or_else(unsupported)?)
                    }
                    _ => return Err(unsupported()),
                };
                match insn.mnemonic.as_str() {
                    "add" => Instruction::Add { dst, lhs, rhs },
                    "sub" => Instruction::Sub { dst, lhs, rhs },
                    "mul" => Instruction::Mul { dst, lhs, rhs },
                    m => Instruction::And { dst, lhs, rhs, only_if_overflow: m == "andvs" },
                }
            }
            "cmp" => match ops {
                [Operand::Reg(lhs), rhs] => Instruction::Cmp {
                    lhs: lhs.clone(),
                    rhs: source(rhs).ok_or_else(unsupported)?,
                },
                _ => return Err(unsupported()),
            },
            "b" | "bl" | "bgt" => {
                let target = match ops {
                    [Operand::Imm(target)] => *target as u32,
                    _ => return Err(unsupported()),
                };
                match insn.mnemonic.as_str() {
                    "bgt" => Instruction::BranchGt { target },
                    m => Instruction::Branch { target, link: m == "bl" },
                }
            }
            _ => {
                return Err(ForensicError::fault(
                    insn.address,
                    insn.text(),
                    "unsupported instruction",
                ))
            }
        };

        Ok(lifted)
    }
}

fn source(op: &Operand) -> Option<Source> {
    match op {
        Operand::Reg(r) => Some(Source::Reg(r.clone())),
        Operand::Imm(v) => Some(Source::Imm(*v as u32)),
        _ => None,
    }
}

/// シミュレータ本体
pub struct ArmSimulator {
    memory: MemoryImage,
    registers: RegisterFile,
    decoder: ArmDecoder,
    patches: HashMap<u32, PatchedFunction>,
    next_sentinel: u32,
    /// フックが結果を置く名前付きスロット
    pub function_storage: HashMap<String, u32>,
    pc_written: bool,
}

impl ArmSimulator {
    pub fn new(memory: MemoryImage, thumb: bool) -> Result<Self> {
        Ok(Self {
            memory,
            registers: RegisterFile::default(),
            decoder: ArmDecoder::new(thumb)?,
            patches: HashMap::new(),
            next_sentinel: FIRST_SENTINEL,
            function_storage: HashMap::new(),
            pc_written: false,
        })
    }

    pub fn memory(&self) -> &MemoryImage {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut MemoryImage {
        &mut self.memory
    }

    pub fn into_memory(self) -> MemoryImage {
        self.memory
    }

    pub fn decoder(&self) -> &ArmDecoder {
        &self.decoder
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    pub fn reg(&self, name: &str) -> u32 {
        self.registers.get(name)
    }

    /// レジスタ書き込み。pcへの書き込みは自動インクリメントを抑止する
    pub fn set_reg(&mut self, name: &str, value: u32) {
        if name == "pc" {
            self.pc_written = true;
        }
        self.registers.set(name, value);
    }

    pub fn pc(&self) -> u32 {
        self.registers.get("pc")
    }

    pub fn patched_functions(&self) -> impl Iterator<Item = &PatchedFunction> {
        self.patches.values()
    }

    /// `address`の関数をフックする。センチネルを書き込み、それを返す
    pub fn add_patch_function<F>(&mut self, name: &str, address: u32, handler: F) -> u32
    where
        F: Fn(&mut ArmSimulator) -> Result<()> + 'static,
    {
        let sentinel = self.next_sentinel;
        self.next_sentinel = self.next_sentinel.wrapping_sub(1);

        self.memory.write_u32(address, sentinel);
        self.patches.insert(
            sentinel,
            PatchedFunction {
                name: name.to_string(),
                sentinel_pc: sentinel,
                real_target_address: address,
                handler: Rc::new(handler),
            },
        );

        debug!("Patched {} at 0x{:08x} with sentinel 0x{:08x}", name, address, sentinel);
        sentinel
    }

    /// 呼び出し単位の初期化（フラグ・レジスタはクリア）
    pub fn reset(&mut self, start: u32) {
        self.registers.clear();
        self.registers.set("sp", STACK_BASE);
        self.registers.set("lr", END_ADDRESS);
        self.registers.set("pc", start);
    }

    /// `start`から終了アドレスに戻るまで実行
    pub fn simulate_function(&mut self, start: u32) -> Result<()> {
        debug!("Simulating function at 0x{:08x}", start);
        self.reset(start);

        while !self.is_terminated() {
            self.step()?;
        }

        Ok(())
    }

    pub fn is_terminated(&self) -> bool {
        self.pc() == END_ADDRESS
    }

    /// 1ステップ: センチネルならハンドラ、そうでなければ1命令
    pub fn step(&mut self) -> Result<()> {
        let pc = self.pc();

        if let Some(patch) = self.patches.get(&pc) {
            let handler = Rc::clone(&patch.handler);
            trace!("0x{:08x}: hook {}", pc, patch.name);
            handler(self)?;
            let lr = self.reg("lr");
            self.registers.set("pc", lr);
            return Ok(());
        }

        let insn = self.decoder.decode_at(&self.memory, pc)?;
        trace!("0x{:08x}: {}", pc, insn.text());
        let instruction = Instruction::lift(&insn)?;

        self.pc_written = false;
        self.execute(&instruction, &insn)?;
        if !self.pc_written {
            self.registers.set("pc", pc.wrapping_add(insn.size));
        }

        Ok(())
    }

    /// オペランドとしてのレジスタ読み出し（pcは+8/+4）
    fn read_operand(&self, name: &str) -> u32 {
        if name == "pc" {
            self.pc().wrapping_add(self.decoder.pc_read_offset())
        } else {
            self.registers.get(name)
        }
    }

    fn read_source(&self, src: &Source) -> u32 {
        match src {
            Source::Reg(r) => self.read_operand(r),
            Source::Imm(v) => *v,
        }
    }

    fn effective_address(&self, mem: &MemOperand) -> u32 {
        let mut address = self.read_operand(&mem.base);
        if let Some(index) = &mem.index {
            let value = self.read_operand(index);
            address = if mem.subtracted {
                address.wrapping_sub(value)
            } else {
                address.wrapping_add(value)
            };
        }
        address.wrapping_add(mem.disp as u32)
    }

    fn push_stack(&mut self, value: u32) {
        let sp = self.reg("sp").wrapping_sub(4);
        self.memory.write_u32(sp, value);
        self.registers.set("sp", sp);
    }

    fn pop_stack(&mut self) -> u32 {
        let sp = self.reg("sp");
        let value = self.memory.read_u32(sp);
        self.registers.set("sp", sp.wrapping_add(4));
        value
    }

    fn execute(&mut self, instruction: &Instruction, insn: &DecodedInsn) -> Result<()> {
        match instruction {
            Instruction::Mov { dst, src } => {
                let value = self.read_source(src);
                self.set_reg(dst, value);
            }
            Instruction::Push { regs } => {
                for reg in regs.iter().rev() {
                    let value = self.reg(reg);
                    self.push_stack(value);
                }
            }
            Instruction::Pop { regs } => {
                for reg in regs {
                    let value = self.pop_stack();
                    self.set_reg(reg, value);
                }
            }
            Instruction::Load { width, dst, mem, writeback } => {
                let address = self.effective_address(mem);
                let value = match width {
                    Width::Word => self.memory.read_u32(address),
                    Width::Half => self.memory.read_u16(address) as u32,
                    Width::Byte => self.memory.read_u8(address) as u32,
                };
                self.set_reg(dst, value);
                if *writeback {
                    self.move_stack();
                }
            }
            Instruction::Store { width, src, mem, writeback } => {
                let address = self.effective_address(mem);
                let value = self.read_operand(src);
                match width {
                    Width::Word => self.memory.write_u32(address, value),
                    Width::Half => self.memory.write_u16(address, value as u16),
                    Width::Byte => self.memory.write_u8(address, value as u8),
                }
                if *writeback {
                    self.move_stack();
                }
            }
            Instruction::Add { dst, lhs, rhs } => {
                let value = self.read_operand(lhs).wrapping_add(self.read_source(rhs));
                self.set_reg(dst, value);
            }
            Instruction::Sub { dst, lhs, rhs } => {
                let value = self.read_operand(lhs).wrapping_sub(self.read_source(rhs));
                self.set_reg(dst, value);
            }
            Instruction::Mul { dst, lhs, rhs } => {
                let value = self.read_operand(lhs).wrapping_mul(self.read_source(rhs));
                self.set_reg(dst, value);
            }
            Instruction::And { dst, lhs, rhs, only_if_overflow } => {
                if !*only_if_overflow || self.registers.flag("v") {
                    let value = self.read_operand(lhs) & self.read_source(rhs);
                    self.set_reg(dst, value);
                }
            }
            Instruction::Cmp { lhs, rhs } => {
                let a = self.read_operand(lhs);
                let b = self.read_source(rhs);
                self.set_compare_flags(a, b);
            }
            Instruction::Branch { target, link } => {
                if *link {
                    let ret = insn.address.wrapping_add(insn.size);
                    self.registers.set("lr", ret);
                }
                self.set_reg("pc", *target);
            }
            Instruction::BranchGt { target } => {
                let n = self.registers.flag("n");
                let v = self.registers.flag("v");
                let z = self.registers.flag("z");
                if n == v && !z {
                    self.set_reg("pc", *target);
                }
            }
        }

        Ok(())
    }

    /// ライトバックの近似（常にスタックを4バイト下げる）
    fn move_stack(&mut self) {
        let sp = self.reg("sp").wrapping_sub(4);
        self.registers.set("sp", sp);
    }

    /// `a - b` の結果でフラグを設定
    fn set_compare_flags(&mut self, a: u32, b: u32) {
        let result = a.wrapping_sub(b);
        let overflow = (a as i32).checked_sub(b as i32).is_none();

        self.registers.set_flag("n", result >> 31 == 1);
        self.registers.set_flag("z", result == 0);
        self.registers.set_flag("c", b > a);
        self.registers.set_flag("v", overflow);
    }
}
