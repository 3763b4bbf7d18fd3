/// タスク情報の復元
///
/// 起動コードの一部をシミュレートして、ランタイムに渡される
/// タスク構造体のポインタを捕まえ、各タスク記述子を読み出す。
///
/// 手順:
/// 1. `@init_jump_table`のプロローグでアーキテクチャを確認
/// 2. `__SYS__SETUP__TASKS` / `__MEMCOPY` をフック
/// 3. `@init_jump_table`を実行（ジャンプテーブルの修正）
/// 4. `@entry_point`からxrefを辿り、`__SYS__RTS__CYCLE__2`の呼び出し元の呼び出し元を実行
/// 5. `@init_application`からxrefを辿り、`__SYS__SETUP__TASKS`の呼び出し元を実行
/// 6. 捕まえたタスク構造体から記述子を読む

use super::arm_sim::{ArmSimulator, END_ADDRESS};
use super::memory_layout::{AnchorAddresses, MemoryLayout};
use super::symbols::SymbolTable;
use super::tags::AnchorKind;
use super::xref::{XrefGraph, XrefGraphBuilder};
use crate::error::{ForensicError, Result};
use crate::memory::MemoryImage;
use crate::stream::{FieldSpec, Record};
use serde::Serialize;
use tracing::{debug, info, warn};

/// サポートするプロローグ `push {sl, lr}` のバイト列
pub const SUPPORTED_PROLOGUE: [u8; 4] = [0x00, 0x44, 0x2D, 0xE9];
/// ランタイムが引数の前に置くスタックカナリア
pub const STACK_CANARY: u32 = 0xCDE1_F2CD;

pub const SYS_SETUP_TASKS: &str = "__SYS__SETUP__TASKS";
pub const MEMCOPY: &str = "__MEMCOPY";
pub const RTS_CYCLE: &str = "__SYS__RTS__CYCLE__2";

/// `sys_setup_tasks`が結果を置くスロット名
pub const TASK_STRUCT_SLOT: &str = "task_struct";
pub const DEFAULT_TASK_NAME_MAX_LEN: usize = 0x33;

// 1回のコピーの上限
const MAX_MEMCOPY_LEN: u32 = 0x0100_0000;

const TASK_STRUCT: &[FieldSpec] = &[
    FieldSpec::u16("unk_zero"),
    FieldSpec::u16("taskinfo_count"),
    FieldSpec::u32("app_name_pointer"),
    FieldSpec::u32("taskinfo_arr_pointer"),
];

/// ランタイムのタスク記述子
pub const TASK_INFO: &[FieldSpec] = &[
    FieldSpec::u32("dwVersion"),
    FieldSpec::u32("pszName"),
    FieldSpec::u16("nPriority"),
    FieldSpec::u16("KindOfTask"),
    FieldSpec::u8("bWatchdog"),
    FieldSpec::u8("bProfiling"),
    FieldSpec::u16("_padding"),
    FieldSpec::u32("dwEventFunctionPointer"),
    FieldSpec::u32("pszExternalEvent"),
    FieldSpec::u32("dwTaskEntryFunctionPointer"),
    FieldSpec::u32("dwWatchdogSensitivity"),
    FieldSpec::u32("dwInterval"),
    FieldSpec::u32("dwWatchdogTime"),
    FieldSpec::u32("dwCycleTime"),
    FieldSpec::u32("dwAverageCycleTime"),
    FieldSpec::u32("dwMaxCycleTime"),
    FieldSpec::u32("dwMinCycleTime"),
    FieldSpec::u32("iJitter"),
    FieldSpec::u32("iJitterMin"),
    FieldSpec::u32("iJitterMax"),
    FieldSpec::u32("dwCycleCount"),
    FieldSpec::u16("iState"),
    FieldSpec::u16("wNumOfJitterDistributions"),
    FieldSpec::u32("pJitterDistribution"),
    FieldSpec::u8("bTimeSlicing"),
    FieldSpec::u8("byDummy"),
    FieldSpec::u16("wDummy"),
    FieldSpec::u32("dwIECCycleCount"),
    FieldSpec::u32("unk0"),
    FieldSpec::u32("unk1"),
];

/// 復元したタスク
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub name: String,
    pub entry_point: u32,
    pub fields: Record,
    pub xrefs: XrefGraph,
}

impl TaskInfo {
    /// 記述子フィールドのJSON表現
    pub fn fields_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(&self.fields)
    }
}

/// `@init_jump_table`が対応アーキテクチャ（ARM little endian）か確認
pub fn validate_supported_arch(memory: &MemoryImage, anchors: &AnchorAddresses) -> Result<()> {
    let address = anchors
        .get(AnchorKind::InitJumpTable)
        .ok_or(ForensicError::MissingAnchor(AnchorKind::InitJumpTable.symbol_name()))?;

    let bytes = memory.read_bytes(address, 4);
    let found = [bytes[0], bytes[1], bytes[2], bytes[3]];
    if found != SUPPORTED_PROLOGUE {
        return Err(ForensicError::UnsupportedArchitecture { address, found });
    }

    Ok(())
}

/// `validate_supported_arch`の真偽値版
pub fn is_supported_arch(memory: &MemoryImage, anchors: &AnchorAddresses) -> bool {
    validate_supported_arch(memory, anchors).is_ok()
}

/// `__MEMCOPY(dst, src, size)` の置き換え
pub fn memcopy(sim: &mut ArmSimulator) -> Result<()> {
    let sp = sim.reg("sp");
    let offset = if sim.memory().read_u32(sp) == STACK_CANARY { 8 } else { 0 };
    let args = sp.wrapping_add(offset);

    let dst = sim.memory().read_u32(args);
    let src = sim.memory().read_u32(args.wrapping_add(4));
    let size = sim.memory().read_u32(args.wrapping_add(8));

    if size > MAX_MEMCOPY_LEN {
        return Err(ForensicError::fault(
            sim.pc(),
            MEMCOPY,
            format!("copy of 0x{:x} bytes exceeds limit", size),
        ));
    }

    debug!("memcopy 0x{:08x} <- 0x{:08x} ({} bytes)", dst, src, size);
    let data = sim.memory().read_bytes(src, size as usize);
    sim.memory_mut().write_bytes(dst, &data);

    Ok(())
}

/// `__SYS__SETUP__TASKS(task_struct)` の置き換え。引数を保存して実行を終える
pub fn sys_setup_tasks(sim: &mut ArmSimulator) -> Result<()> {
    let sp = sim.reg("sp");
    let offset: u32 = if sim.memory().read_u32(sp) != STACK_CANARY { 8 } else { 0 };
    let slot = sp.wrapping_sub(offset).wrapping_sub(4);

    let task_struct = sim.memory().read_u32(slot);
    debug!("__SYS__SETUP__TASKS called with task struct 0x{:08x}", task_struct);
    sim.function_storage.insert(TASK_STRUCT_SLOT.to_string(), task_struct);

    // 呼び出し元には戻らずに終了
    sim.set_reg("lr", END_ADDRESS);
    Ok(())
}

/// グラフのラベル `"0x1234 name"` からアドレスを取り出す
pub fn label_address(label: &str) -> Option<u32> {
    let hex = label.split_whitespace().next()?.strip_prefix("0x")?;
    u32::from_str_radix(hex, 16).ok()
}

/// タスク復元の実行器
pub struct TaskRecoveryOrchestrator<'a> {
    layout: &'a MemoryLayout,
    symbols: &'a mut SymbolTable,
    simulator: ArmSimulator,
    task_name_max_len: usize,
    entry_point_graph: Option<XrefGraph>,
}

impl<'a> TaskRecoveryOrchestrator<'a> {
    pub fn new(
        layout: &'a MemoryLayout,
        symbols: &'a mut SymbolTable,
        thumb: bool,
        task_name_max_len: usize,
    ) -> Result<Self> {
        Ok(Self {
            layout,
            symbols,
            simulator: ArmSimulator::new(layout.memory.clone(), thumb)?,
            task_name_max_len,
            entry_point_graph: None,
        })
    }

    /// 途中で失敗しても、構築済みならエントリポイントのグラフは残る
    pub fn take_entry_point_graph(&mut self) -> Option<XrefGraph> {
        self.entry_point_graph.take()
    }

    pub fn simulator(&self) -> &ArmSimulator {
        &self.simulator
    }

    pub fn run(&mut self) -> Result<Vec<TaskInfo>> {
        validate_supported_arch(self.simulator.memory(), &self.layout.anchors)?;
        self.install_hooks()?;

        let init_jump_table = self.anchor(AnchorKind::InitJumpTable)?;
        info!("Simulating init jump table at 0x{:08x}", init_jump_table);
        self.simulator.simulate_function(init_jump_table)?;

        let cycle_parent = self.find_cycle_grandparent()?;
        info!("Simulating cycle setup function at 0x{:08x}", cycle_parent);
        self.simulator.simulate_function(cycle_parent)?;

        let setup_caller = self.find_task_setup_caller()?;
        info!("Simulating task setup caller at 0x{:08x}", setup_caller);
        self.simulator.simulate_function(setup_caller)?;

        let task_struct = self
            .simulator
            .function_storage
            .get(TASK_STRUCT_SLOT)
            .copied()
            .ok_or_else(|| {
                ForensicError::NoCandidate(format!("{} was never called", SYS_SETUP_TASKS))
            })?;

        self.read_tasks(task_struct)
    }

    fn anchor(&self, kind: AnchorKind) -> Result<u32> {
        self.layout
            .anchors
            .get(kind)
            .ok_or(ForensicError::MissingAnchor(kind.symbol_name()))
    }

    fn install_hooks(&mut self) -> Result<()> {
        let setup = self
            .symbols
            .address_of(SYS_SETUP_TASKS)
            .ok_or_else(|| ForensicError::UnresolvedRuntimeSymbol(SYS_SETUP_TASKS.to_string()))?;
        let memcopy_addr = self
            .symbols
            .address_of(MEMCOPY)
            .ok_or_else(|| ForensicError::UnresolvedRuntimeSymbol(MEMCOPY.to_string()))?;

        self.simulator.add_patch_function(SYS_SETUP_TASKS, setup, sys_setup_tasks);
        self.simulator.add_patch_function(MEMCOPY, memcopy_addr, memcopy);
        Ok(())
    }

    fn xref_graph(&self, root: u32) -> XrefGraph {
        XrefGraphBuilder::new(
            self.simulator.decoder(),
            self.simulator.memory(),
            &self.layout.code_blocks,
            &*self.symbols,
        )
        .build(root)
    }

    /// `__SYS__RTS__CYCLE__2`を参照する関数の呼び出し元
    fn find_cycle_grandparent(&mut self) -> Result<u32> {
        let anchor = self.anchor(AnchorKind::EntryPoint)?;
        let entry = self.simulator.memory().read_u32(anchor);
        let graph = self.xref_graph(entry);

        let mut candidates: Vec<String> = Vec::new();
        for parent in graph.callers_of(RTS_CYCLE) {
            for grandparent in graph.callers_of(&parent) {
                if !candidates.contains(&grandparent) {
                    candidates.push(grandparent);
                }
            }
        }

        self.entry_point_graph = Some(graph);
        first_candidate(&candidates, &format!("caller of a {} user", RTS_CYCLE))
    }

    /// `__SYS__SETUP__TASKS`を呼ぶ関数
    fn find_task_setup_caller(&mut self) -> Result<u32> {
        let anchor = self.anchor(AnchorKind::InitApplication)?;
        let init = self.simulator.memory().read_u32(anchor);
        let graph = self.xref_graph(init);

        first_candidate(&graph.callers_of(SYS_SETUP_TASKS), &format!("caller of {}", SYS_SETUP_TASKS))
    }

    fn read_tasks(&mut self, task_struct_address: u32) -> Result<Vec<TaskInfo>> {
        let task_struct = self.simulator.memory().read_record(task_struct_address, TASK_STRUCT)?;
        let count = task_struct.u32("taskinfo_count");
        let array = task_struct.u32("taskinfo_arr_pointer");

        info!(
            "Task struct at 0x{:08x}: {} tasks, descriptors at 0x{:08x}",
            task_struct_address, count, array
        );

        let mut tasks = Vec::new();
        for index in 0..count {
            let pointer = self.simulator.memory().read_u32(array.wrapping_add(index * 4));
            let fields = self.simulator.memory().read_record(pointer, TASK_INFO)?;

            let name = self
                .simulator
                .memory()
                .read_cstring(fields.u32("pszName"), self.task_name_max_len);
            let entry_point = self
                .simulator
                .memory()
                .read_u32(fields.u32("dwTaskEntryFunctionPointer"));

            info!("Task '{}' entry at 0x{:08x}", name, entry_point);
            self.symbols.insert(entry_point, name.clone());
            let xrefs = self.xref_graph(entry_point);

            tasks.push(TaskInfo {
                name,
                entry_point,
                fields,
                xrefs,
            });
        }

        Ok(tasks)
    }
}

/// 候補の先頭（エッジ追加順）を選ぶ
fn first_candidate(candidates: &[String], what: &str) -> Result<u32> {
    if candidates.len() > 1 {
        warn!(
            "{} candidates for {}: {:?}; using the first",
            candidates.len(),
            what,
            candidates
        );
    }

    let label = candidates
        .first()
        .ok_or_else(|| ForensicError::NoCandidate(what.to_string()))?;
    label_address(label).ok_or_else(|| ForensicError::NoCandidate(format!("{} ({})", what, label)))
}
