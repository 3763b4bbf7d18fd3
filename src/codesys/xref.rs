/// 静的クロスリファレンスグラフ
///
/// エミュレーションせずに関数を線形に辿り、`ldr reg, [pc, #disp]`で
/// 読み込まれる関数ポインタから呼び出し関係を組み立てる

use super::arm_decode::{ArmDecoder, DecodedInsn, Operand};
use super::memory_layout::block_containing;
use super::symbols::SymbolTable;
use crate::memory::MemoryImage;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::{debug, trace};

/// 関数プロローグ
pub const PROLOGUE: &str = "push {sl, lr}";
/// 関数エピローグ
pub const EPILOGUE: &str = "pop {sl, pc}";

/// ラベル付き有向グラフ
#[derive(Debug, Clone, Default)]
pub struct XrefGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl XrefGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, label: &str) -> NodeIndex {
        if let Some(&idx) = self.index.get(label) {
            return idx;
        }
        let idx = self.graph.add_node(label.to_string());
        self.index.insert(label.to_string(), idx);
        idx
    }

    /// 重複エッジは追加しない
    pub fn add_edge(&mut self, from: &str, to: &str) {
        let a = self.add_node(from);
        let b = self.add_node(to);
        if self.graph.find_edge(a, b).is_none() {
            self.graph.add_edge(a, b, ());
        }
    }

    pub fn contains_node(&self, label: &str) -> bool {
        self.index.contains_key(label)
    }

    pub fn contains_edge(&self, from: &str, to: &str) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&a), Some(&b)) => self.graph.find_edge(a, b).is_some(),
            _ => false,
        }
    }

    /// `label`を呼び出すノード（エッジ追加順）
    pub fn callers_of(&self, label: &str) -> Vec<String> {
        let Some(&target) = self.index.get(label) else {
            return Vec::new();
        };

        let mut callers: Vec<String> = Vec::new();
        for edge in self.graph.edge_references() {
            if edge.target() == target {
                let caller = &self.graph[edge.source()];
                if !callers.contains(caller) {
                    callers.push(caller.clone());
                }
            }
        }
        callers
    }

    /// アドレスに対応するノードラベル
    pub fn node_for_address(&self, address: u32) -> Option<&str> {
        let prefix = format!("{:#x}", address);
        self.graph
            .node_weights()
            .find(|label| {
                label.as_str() == prefix
                    || label
                        .strip_prefix(prefix.as_str())
                        .map_or(false, |rest| rest.starts_with(' '))
            })
            .map(String::as_str)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.graph.node_weights().map(String::as_str)
    }

    pub fn edges(&self) -> impl Iterator<Item = (&str, &str)> {
        self.graph.edge_references().map(move |e| {
            (
                self.graph[e.source()].as_str(),
                self.graph[e.target()].as_str(),
            )
        })
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn inner(&self) -> &DiGraph<String, ()> {
        &self.graph
    }
}

impl Serialize for XrefGraph {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let nodes: Vec<&str> = self.nodes().collect();
        let edges: Vec<[&str; 2]> = self.edges().map(|(a, b)| [a, b]).collect();

        let mut state = serializer.serialize_struct("XrefGraph", 2)?;
        state.serialize_field("nodes", &nodes)?;
        state.serialize_field("edges", &edges)?;
        state.end()
    }
}

/// グラフ構築器
pub struct XrefGraphBuilder<'a> {
    decoder: &'a ArmDecoder,
    memory: &'a MemoryImage,
    code_blocks: &'a BTreeMap<u32, Vec<u8>>,
    symbols: &'a SymbolTable,
}

impl<'a> XrefGraphBuilder<'a> {
    pub fn new(
        decoder: &'a ArmDecoder,
        memory: &'a MemoryImage,
        code_blocks: &'a BTreeMap<u32, Vec<u8>>,
        symbols: &'a SymbolTable,
    ) -> Self {
        Self {
            decoder,
            memory,
            code_blocks,
            symbols,
        }
    }

    /// `root`から幅優先でグラフを構築
    pub fn build(&self, root: u32) -> XrefGraph {
        let mut graph = XrefGraph::new();
        let mut visited = HashSet::new();
        let mut functions = VecDeque::from([root]);

        while let Some(function) = functions.pop_front() {
            let caller = self.symbols.label(function);

            for insn in self.walk_function(function) {
                if !visited.insert(insn.address) {
                    break;
                }

                let Some(disp) = pc_relative_load(&insn) else {
                    continue;
                };

                let slot_address = insn
                    .address
                    .wrapping_add(self.decoder.pc_read_offset())
                    .wrapping_add(disp as u32);
                let slot = self.memory.read_u32(slot_address);
                let target = self.memory.read_u32(slot);

                if block_containing(self.code_blocks, target).is_some() {
                    trace!("{} -> 0x{:08x}", caller, target);
                    if !visited.contains(&target) {
                        functions.push_back(target);
                    }
                    graph.add_edge(&caller, &self.symbols.label(target));
                } else if let Some(name) = self.symbols.get(slot) {
                    trace!("{} -> {}", caller, name);
                    graph.add_edge(&caller, name.trim());
                }
            }
        }

        debug!(
            "Xref graph from 0x{:08x}: {} nodes, {} edges",
            root,
            graph.node_count(),
            graph.edge_count()
        );
        graph
    }

    /// 関数本体の命令列（分岐先も含む）
    ///
    /// コード領域の外に出たら打ち切る。シミュレーションのスタック書き込みは対象外
    pub fn walk_function(&self, start: u32) -> Vec<DecodedInsn> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        let mut pending = VecDeque::from([start]);

        while let Some(block_start) = pending.pop_front() {
            let mut address = block_start;

            while block_containing(self.code_blocks, address).is_some() {
                if !visited.insert(address) {
                    break;
                }
                let insn = match self.decoder.decode_at(self.memory, address) {
                    Ok(insn) => insn,
                    Err(_) => break,
                };

                if address == start && !insn.is(PROLOGUE) {
                    debug!("0x{:08x} does not start with a prologue", start);
                    break;
                }

                if insn.is(EPILOGUE) {
                    out.push(insn);
                    break;
                }

                if let Some(target) = insn.branch_target() {
                    pending.push_back(target);
                }
                if insn.is_unconditional_branch() {
                    out.push(insn);
                    break;
                }

                address = address.wrapping_add(insn.size);
                out.push(insn);
            }
        }

        out
    }
}

/// `ldr reg, [pc, #disp]` なら disp を返す
fn pc_relative_load(insn: &DecodedInsn) -> Option<i32> {
    if insn.mnemonic != "ldr" {
        return None;
    }
    match insn.operands.as_slice() {
        [Operand::Reg(_), Operand::Mem(mem)] if mem.base == "pc" => Some(mem.disp),
        _ => None,
    }
}
