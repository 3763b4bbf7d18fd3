/// タグカタログ
///
/// タグIDから型付きバリアントへの静的な対応表。
/// 未知のIDは常に`TagKind::Unknown`として生ペイロードを保持する

use super::tag_decoder::{read_nested_list, read_nested_tag};
use crate::error::Result;
use crate::stream::{decode_cstring, null_terminated, BinaryReader};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::collections::BTreeMap;
use tracing::debug;

pub const TAG_APPLICATION_NAME: u64 = 0x10;
pub const TAG_CODE_AREA_HEADER: u64 = 0x21;
pub const TAG_CODE_AREA_DATA: u64 = 0x22;
pub const TAG_SYMBOL: u64 = 0x50;
pub const TAG_INIT_JUMP_TABLE: u64 = 0x60;
pub const TAG_ENTRY_POINT: u64 = 0x61;
pub const TAG_INIT_APPLICATION: u64 = 0x63;
pub const TAG_INTERNAL_SYMBOL_TABLE_START: u64 = 0x6F;
pub const TAG_INTERNAL_SYMBOL_TABLE_END: u64 = 0x71;
pub const TAG_LIST_OF_TAGS: u64 = 0x81;
pub const TAG_LIST_OF_CODE_AREAS: u64 = 0x82;
pub const TAG_SYMBOLS: u64 = 0x85;
pub const TAG_FOOTER_ADDRESSES: u64 = 0x86;
pub const TAG_PROJECT_INFO: u64 = 0x87;
pub const TAG_FUNCTION_SYMBOLS: u64 = 0x88;
pub const TAG_CODE_AREA: u64 = 0xA0;

/// デコード済みタグ
#[derive(Debug, Clone)]
pub struct Tag {
    pub id: u64,
    pub size: u64,
    /// 葉タグの生ペイロード（コンテナ系は空）
    pub payload: Vec<u8>,
    pub kind: TagKind,
}

/// タグの種類
#[derive(Debug, Clone)]
pub enum TagKind {
    ListOfTags(Vec<Tag>),
    ApplicationName(String),
    ListOfCodeAreas(Vec<Tag>),
    CodeAreaHeader,
    CodeAreaData,
    /// ヘッダ・データのどちらかが欠けていればNone
    CodeArea(Option<CodeArea>),
    ProjectInfo(ProjectInfo),
    FunctionSymbols(FunctionSymbols),
    FooterAddresses(Vec<Tag>),
    Anchor(AnchorKind, AnchorPointer),
    Symbols(Vec<Tag>),
    Symbol(SymbolEntry),
    Unknown,
}

impl TagKind {
    /// ペイロードを子要素へ分解する種類
    pub fn is_composite(&self) -> bool {
        matches!(
            self,
            TagKind::ListOfTags(_)
                | TagKind::ListOfCodeAreas(_)
                | TagKind::CodeArea(_)
                | TagKind::ProjectInfo(_)
                | TagKind::FunctionSymbols(_)
                | TagKind::FooterAddresses(_)
                | TagKind::Symbols(_)
        )
    }
}

/// コード領域
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeArea {
    pub area_type: u16,
    pub pointer: u32,
    pub code: Vec<u8>,
}

/// フッタに格納される重要アドレスの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AnchorKind {
    InitJumpTable,
    EntryPoint,
    InitApplication,
    TableStart,
    TableEnd,
}

impl AnchorKind {
    pub const ALL: [AnchorKind; 5] = [
        AnchorKind::InitJumpTable,
        AnchorKind::EntryPoint,
        AnchorKind::InitApplication,
        AnchorKind::TableStart,
        AnchorKind::TableEnd,
    ];

    pub fn from_tag_id(id: u64) -> Option<Self> {
        match id {
            TAG_INIT_JUMP_TABLE => Some(AnchorKind::InitJumpTable),
            TAG_ENTRY_POINT => Some(AnchorKind::EntryPoint),
            TAG_INIT_APPLICATION => Some(AnchorKind::InitApplication),
            TAG_INTERNAL_SYMBOL_TABLE_START => Some(AnchorKind::TableStart),
            TAG_INTERNAL_SYMBOL_TABLE_END => Some(AnchorKind::TableEnd),
            _ => None,
        }
    }

    /// シンボルテーブルに登録する名前
    pub fn symbol_name(&self) -> &'static str {
        match self {
            AnchorKind::InitJumpTable => "@init_jump_table",
            AnchorKind::EntryPoint => "@entry_point",
            AnchorKind::InitApplication => "@init_application",
            AnchorKind::TableStart => "@table_start",
            AnchorKind::TableEnd => "@table_end",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorPointer {
    pub pointer_type: u16,
    pub pointer: u32,
}

/// 0x50 シンボル
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    pub pointer_type: u16,
    pub pointer: u32,
    pub reserved: u32,
    pub name: String,
}

/// 0x88 の1エントリ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSymbol {
    pub symbol_type: u16,
    pub pointer: u32,
    pub trailer: Vec<u8>,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct FunctionSymbols {
    pub symbols: BTreeMap<u32, FunctionSymbol>,
    pub unknown_tags: Vec<Tag>,
}

/// プロジェクト情報の属性値
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectAttribute {
    DateTime(DateTime<Utc>),
    Text(Vec<u8>),
    Raw(Vec<u8>),
}

#[derive(Debug, Clone, Default)]
pub struct ProjectInfo {
    pub attributes: IndexMap<String, ProjectAttribute>,
}

impl Tag {
    /// IDに応じてペイロードを解釈する
    pub fn from_payload(id: u64, payload: &[u8]) -> Result<Tag> {
        Self::from_nested_payload(id, payload, 0)
    }

    pub(crate) fn from_nested_payload(id: u64, payload: &[u8], depth: usize) -> Result<Tag> {
        let inner = depth + 1;
        let kind = match id {
            TAG_LIST_OF_TAGS => TagKind::ListOfTags(read_nested_list(payload, inner)?),
            TAG_APPLICATION_NAME => TagKind::ApplicationName(decode_cstring(payload)),
            TAG_LIST_OF_CODE_AREAS => TagKind::ListOfCodeAreas(read_nested_list(payload, inner)?),
            TAG_CODE_AREA_HEADER => TagKind::CodeAreaHeader,
            TAG_CODE_AREA_DATA => TagKind::CodeAreaData,
            TAG_CODE_AREA => TagKind::CodeArea(parse_code_area(payload, inner)?),
            TAG_PROJECT_INFO => TagKind::ProjectInfo(parse_project_info(payload, inner)?),
            TAG_FUNCTION_SYMBOLS => TagKind::FunctionSymbols(parse_function_symbols(payload, inner)?),
            TAG_FOOTER_ADDRESSES => TagKind::FooterAddresses(read_nested_list(payload, inner)?),
            TAG_SYMBOLS => TagKind::Symbols(read_nested_list(payload, inner)?),
            TAG_SYMBOL => TagKind::Symbol(parse_symbol(payload)?),
            _ => match AnchorKind::from_tag_id(id) {
                Some(anchor) => TagKind::Anchor(anchor, parse_anchor(payload)?),
                None => TagKind::Unknown,
            },
        };

        Ok(Tag {
            id,
            size: payload.len() as u64,
            // 子要素に分解済みのものは生データを保持しない
            payload: if kind.is_composite() { Vec::new() } else { payload.to_vec() },
            kind,
        })
    }

    /// 子タグ（コンテナ系のみ）
    pub fn children(&self) -> &[Tag] {
        match &self.kind {
            TagKind::ListOfTags(tags)
            | TagKind::ListOfCodeAreas(tags)
            | TagKind::FooterAddresses(tags)
            | TagKind::Symbols(tags) => tags,
            _ => &[],
        }
    }
}

fn parse_code_area(payload: &[u8], depth: usize) -> Result<Option<CodeArea>> {
    let mut br = BinaryReader::new(payload);

    let header = read_nested_tag(&mut br, depth)?;
    if !matches!(header.kind, TagKind::CodeAreaHeader) {
        debug!("Code area without header tag (id 0x{:x})", header.id);
        return Ok(None);
    }

    let mut header_br = BinaryReader::new(&header.payload);
    let area_type = header_br.read_u16_le()?;
    let pointer = header_br.read_u32_le()?;

    let data = read_nested_tag(&mut br, depth)?;
    if !matches!(data.kind, TagKind::CodeAreaData) {
        debug!("Code area 0x{:08x} without data tag (id 0x{:x})", pointer, data.id);
        return Ok(None);
    }

    let mut data_br = BinaryReader::new(&data.payload);
    let code_size = data_br.read_u32_le()?;
    let code = data_br.read_bytes(code_size as usize)?.to_vec();

    Ok(Some(CodeArea {
        area_type,
        pointer,
        code,
    }))
}

fn parse_project_info(payload: &[u8], depth: usize) -> Result<ProjectInfo> {
    let mut info = ProjectInfo::default();

    for sub_tag in read_nested_list(payload, depth)? {
        let label = match sub_tag.id {
            1 => "name",
            2 => "project_version",
            3 => "project_build_datetime",
            4 => "author",
            5 => "description",
            6 => "ide_build_version",
            8 => "codesys_version",
            other => {
                info.attributes.insert(
                    format!("unknown_tag {}", other),
                    ProjectAttribute::Raw(sub_tag.payload),
                );
                continue;
            }
        };

        let value = if sub_tag.id == 3 {
            match decode_timestamp(&sub_tag.payload) {
                Some(datetime) => ProjectAttribute::DateTime(datetime),
                None => ProjectAttribute::Raw(sub_tag.payload),
            }
        } else {
            ProjectAttribute::Text(null_terminated(&sub_tag.payload).to_vec())
        };

        info.attributes.insert(label.to_string(), value);
    }

    Ok(info)
}

/// リトルエンディアンのUNIX秒
fn decode_timestamp(data: &[u8]) -> Option<DateTime<Utc>> {
    if data.is_empty() || data.len() > 8 {
        return None;
    }

    let mut raw = [0u8; 8];
    raw[..data.len()].copy_from_slice(data);
    let secs = i64::try_from(u64::from_le_bytes(raw)).ok()?;

    DateTime::<Utc>::from_timestamp(secs, 0)
}

fn parse_function_symbols(payload: &[u8], depth: usize) -> Result<FunctionSymbols> {
    let mut symbols = FunctionSymbols::default();
    let mut pending: Option<(u16, u32, Vec<u8>)> = None;

    for sub_tag in read_nested_list(payload, depth)? {
        match sub_tag.id {
            1 => {
                let mut br = BinaryReader::new(&sub_tag.payload);
                let symbol_type = br.read_u16_le()?;
                let pointer = br.read_u32_le()?;
                let trailer = br.read_rest().to_vec();
                pending = Some((symbol_type, pointer, trailer));
            }
            2 => match pending.take() {
                Some((symbol_type, pointer, trailer)) => {
                    symbols.symbols.insert(
                        pointer,
                        FunctionSymbol {
                            symbol_type,
                            pointer,
                            trailer,
                            name: decode_cstring(&sub_tag.payload),
                        },
                    );
                }
                None => debug!(
                    "Function symbol name without pointer: {}",
                    decode_cstring(&sub_tag.payload)
                ),
            },
            _ => symbols.unknown_tags.push(sub_tag),
        }
    }

    Ok(symbols)
}

fn parse_anchor(payload: &[u8]) -> Result<AnchorPointer> {
    let mut br = BinaryReader::new(payload);
    Ok(AnchorPointer {
        pointer_type: br.read_u16_le()?,
        pointer: br.read_u32_le()?,
    })
}

fn parse_symbol(payload: &[u8]) -> Result<SymbolEntry> {
    let mut br = BinaryReader::new(payload);
    Ok(SymbolEntry {
        pointer_type: br.read_u16_le()?,
        pointer: br.read_u32_le()?,
        reserved: br.read_u32_le()?,
        name: decode_cstring(br.read_rest()),
    })
}
