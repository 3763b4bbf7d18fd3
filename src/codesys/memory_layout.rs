/// アドレス空間の再構築
///
/// タグツリーからコード領域を集めてスパースなメモリイメージに展開し、
/// アンカーアドレス・静的シンボル・プロジェクト情報を抽出する

use super::symbols::SymbolTable;
use super::tags::{AnchorKind, ProjectAttribute, Tag, TagKind};
use crate::memory::MemoryImage;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// フッタから得た重要アドレス
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnchorAddresses {
    anchors: BTreeMap<AnchorKind, u32>,
}

impl AnchorAddresses {
    pub fn get(&self, kind: AnchorKind) -> Option<u32> {
        self.anchors.get(&kind).copied()
    }

    pub fn insert(&mut self, kind: AnchorKind, pointer: u32) {
        self.anchors.insert(kind, pointer);
    }

    pub fn iter(&self) -> impl Iterator<Item = (AnchorKind, u32)> + '_ {
        self.anchors.iter().map(|(&k, &v)| (k, v))
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }
}

/// 平坦化したプロジェクト情報の値
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectValue {
    DateTime(DateTime<Utc>),
    Text(String),
    Bytes(Vec<u8>),
}

impl Serialize for ProjectValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ProjectValue::DateTime(dt) => {
                serializer.serialize_str(&dt.format("%Y-%m-%dT%H:%M:%S").to_string())
            }
            ProjectValue::Text(s) => serializer.serialize_str(s),
            ProjectValue::Bytes(b) => serializer.serialize_str(&STANDARD.encode(b)),
        }
    }
}

/// 再構築したアドレス空間とメタデータ
#[derive(Debug, Clone, Default)]
pub struct MemoryLayout {
    pub application_name: Option<String>,
    /// ポインタ → コード
    pub code_blocks: BTreeMap<u32, Vec<u8>>,
    pub memory: MemoryImage,
    pub anchors: AnchorAddresses,
    pub symbols: SymbolTable,
    pub project_info: IndexMap<String, ProjectValue>,
}

impl MemoryLayout {
    /// タグ列からレイアウトを構築
    pub fn build(tags: &[Tag]) -> Self {
        let mut layout = MemoryLayout::default();

        walk(tags, &mut |tag| layout.visit(tag));

        layout.memory = reconstruct_memory(&layout.code_blocks);
        for (kind, pointer) in layout.anchors.iter() {
            layout.symbols.insert(pointer, kind.symbol_name());
        }

        info!(
            "Rebuilt memory from {} code blocks ({} pages), {} anchors, {} static symbols",
            layout.code_blocks.len(),
            layout.memory.page_count(),
            layout.anchors.iter().count(),
            layout.symbols.len()
        );

        layout
    }

    fn visit(&mut self, tag: &Tag) {
        match &tag.kind {
            TagKind::ApplicationName(name) => {
                if self.application_name.is_none() {
                    self.application_name = Some(name.clone());
                }
            }
            TagKind::ListOfCodeAreas(areas) => {
                for area in areas {
                    match &area.kind {
                        TagKind::CodeArea(Some(ca)) => {
                            if self.code_blocks.insert(ca.pointer, ca.code.clone()).is_some() {
                                debug!("Duplicate code area at 0x{:08x}, keeping the later one", ca.pointer);
                            }
                        }
                        TagKind::CodeArea(None) => debug!("Skipping incomplete code area"),
                        _ => debug!("Unexpected tag 0x{:x} in code area list", area.id),
                    }
                }
            }
            TagKind::FooterAddresses(sub_tags) => {
                for sub_tag in sub_tags {
                    if let TagKind::Anchor(kind, ptr) = &sub_tag.kind {
                        self.anchors.insert(*kind, ptr.pointer);
                    }
                }
            }
            TagKind::Symbols(entries) => {
                for entry in entries {
                    if let TagKind::Symbol(sym) = &entry.kind {
                        self.symbols.insert(sym.pointer, sym.name.clone());
                    }
                }
            }
            TagKind::FunctionSymbols(fs) => {
                for (&pointer, sym) in &fs.symbols {
                    self.symbols.insert(pointer, sym.name.clone());
                }
            }
            TagKind::ProjectInfo(pi) => {
                for (key, attr) in &pi.attributes {
                    let value = match attr {
                        ProjectAttribute::DateTime(dt) => ProjectValue::DateTime(*dt),
                        ProjectAttribute::Text(raw) => {
                            ProjectValue::Text(String::from_utf8_lossy(raw).into_owned())
                        }
                        ProjectAttribute::Raw(raw) => ProjectValue::Bytes(raw.clone()),
                    };
                    self.project_info.insert(key.clone(), value);
                }
            }
            _ => {}
        }
    }

    /// アドレスを含むコードブロックの開始アドレス
    pub fn code_block_containing(&self, address: u32) -> Option<u32> {
        block_containing(&self.code_blocks, address)
    }
}

/// タグツリーを深さ優先で走査
fn walk<F: FnMut(&Tag)>(tags: &[Tag], f: &mut F) {
    for tag in tags {
        f(tag);
        if let TagKind::ListOfTags(children) = &tag.kind {
            walk(children, f);
        }
    }
}

/// ポインタ昇順で書き込む。重なった場合は後（高いポインタ）が勝つ
pub fn reconstruct_memory(code_blocks: &BTreeMap<u32, Vec<u8>>) -> MemoryImage {
    let mut memory = MemoryImage::new();
    let mut previous_end: Option<(u32, u64)> = None;

    for (&pointer, code) in code_blocks {
        if let Some((prev_start, prev_end)) = previous_end {
            if (pointer as u64) < prev_end {
                warn!(
                    "Code area 0x{:08x} overlaps area 0x{:08x} (ends 0x{:x}); later area wins",
                    pointer, prev_start, prev_end
                );
            }
        }

        memory.write_bytes(pointer, code);

        let end = pointer as u64 + code.len() as u64;
        previous_end = match previous_end {
            Some((start, prev)) if prev >= end => Some((start, prev)),
            _ => Some((pointer, end)),
        };
    }

    memory
}

/// `address`を含むブロックを探す
pub fn block_containing(code_blocks: &BTreeMap<u32, Vec<u8>>, address: u32) -> Option<u32> {
    let (&start, code) = code_blocks.range(..=address).next_back()?;
    if (address as u64) < start as u64 + code.len() as u64 {
        Some(start)
    } else {
        None
    }
}
