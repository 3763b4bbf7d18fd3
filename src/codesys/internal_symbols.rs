/// ファームウェア内蔵シンボルテーブルの読み込み
///
/// `@table_start`にヘッダ、続いて6種類の固定長レコード、
/// 残りが文字列テーブル。各レコードの`table_offset`で名前を引く

use crate::error::{ForensicError, Result};
use crate::memory::MemoryImage;
use crate::stream::{decode_cstring, layout_size, FieldSpec, Record};
use tracing::{debug, info};

const HEADER: &[FieldSpec] = &[
    FieldSpec::u32("size"),
    FieldSpec::u32("unk0"),
    FieldSpec::u16("prog_calls_pous_count"),
    FieldSpec::u16("structs_count"),
    FieldSpec::u16("vals_structs_count"),
    FieldSpec::u16("lib_pous_count"),
    FieldSpec::u16("methods_count"),
    FieldSpec::u16("system_funcs_count"),
];

const PROG_CALLS_POU: &[FieldSpec] = &[
    FieldSpec::u32("unk0"),
    FieldSpec::u32("unk1"),
    FieldSpec::u32("table_offset"),
    FieldSpec::u16("pointer_type_0"),
    FieldSpec::u16("pointer_type_1"),
    FieldSpec::u32("pointer"),
    FieldSpec::u32("pointer_offset"),
];

const STRUCT: &[FieldSpec] = &[FieldSpec::u32("checksum"), FieldSpec::u32("table_offset")];

const LIB_POU: &[FieldSpec] = &[
    FieldSpec::bytes("unk0", 8),
    FieldSpec::u32("table_offset"),
    FieldSpec::bytes("unk1", 0x18),
];

const METHOD: &[FieldSpec] = &[
    FieldSpec::u32("unk0"),
    FieldSpec::u32("unk1"),
    FieldSpec::u32("table_offset"),
    FieldSpec::u16("pointer_type_0"),
    FieldSpec::u16("pointer_type_1"),
    FieldSpec::u32("pointer"),
    FieldSpec::u32("pointer_offset"),
    FieldSpec::u32("zero"),
];

const SYSTEM_FUNC: &[FieldSpec] = &[FieldSpec::u32("table_offset")];

/// レコードの種類（テーブル内の並び順）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolCategory {
    ProgCallsPous,
    Structs,
    ValStructs,
    LibPous,
    Methods,
    SystemFuncs,
}

impl SymbolCategory {
    pub const ALL: [SymbolCategory; 6] = [
        SymbolCategory::ProgCallsPous,
        SymbolCategory::Structs,
        SymbolCategory::ValStructs,
        SymbolCategory::LibPous,
        SymbolCategory::Methods,
        SymbolCategory::SystemFuncs,
    ];

    pub fn layout(&self) -> &'static [FieldSpec] {
        match self {
            SymbolCategory::ProgCallsPous => PROG_CALLS_POU,
            SymbolCategory::Structs | SymbolCategory::ValStructs => STRUCT,
            SymbolCategory::LibPous => LIB_POU,
            SymbolCategory::Methods => METHOD,
            SymbolCategory::SystemFuncs => SYSTEM_FUNC,
        }
    }

    fn count_field(&self) -> &'static str {
        match self {
            SymbolCategory::ProgCallsPous => "prog_calls_pous_count",
            SymbolCategory::Structs => "structs_count",
            SymbolCategory::ValStructs => "vals_structs_count",
            SymbolCategory::LibPous => "lib_pous_count",
            SymbolCategory::Methods => "methods_count",
            SymbolCategory::SystemFuncs => "system_funcs_count",
        }
    }
}

#[derive(Debug, Clone)]
pub struct InternalSymbol {
    pub category: SymbolCategory,
    pub record: Record,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InternalSymbolTable {
    pub header: Record,
    pub entries: Vec<InternalSymbol>,
}

impl InternalSymbolTable {
    /// `pointer`/`pointer_offset` → 名前 のペア
    pub fn symbol_pairs(&self) -> Vec<(u32, String)> {
        let mut pairs = Vec::new();

        for entry in &self.entries {
            let Some(name) = &entry.name else { continue };
            if entry.record.contains("pointer") {
                pairs.push((entry.record.u32("pointer"), name.clone()));
            }
            if entry.record.contains("pointer_offset") {
                pairs.push((entry.record.u32("pointer_offset"), name.clone()));
            }
        }

        pairs
    }
}

/// メモリイメージ上の内部シンボルテーブルを読む
///
/// `table_limit`はテーブルが収まるべき終端（排他的）。ヘッダの`size`や
/// レコード数がそれを超える場合は読まずにエラーを返す
pub fn read_internal_symbols(
    memory: &MemoryImage,
    table_start: u32,
    table_limit: u64,
) -> Result<InternalSymbolTable> {
    let mut cursor = table_start;

    let header = read_at(memory, &mut cursor, HEADER)?;
    let declared = header.u32("size") as u64;
    let available = table_limit.saturating_sub(table_start as u64);

    let records_len: u64 = layout_size(HEADER) as u64
        + SymbolCategory::ALL
            .iter()
            .map(|c| header.u32(c.count_field()) as u64 * layout_size(c.layout()) as u64)
            .sum::<u64>();

    if declared > available || records_len > available {
        return Err(ForensicError::TableOutOfBounds {
            address: table_start,
            declared: declared.max(records_len),
            available,
        });
    }

    let mut entries = Vec::new();

    for category in SymbolCategory::ALL {
        let count = header.u32(category.count_field());
        for _ in 0..count {
            let record = read_at(memory, &mut cursor, category.layout())?;
            entries.push(InternalSymbol {
                category,
                record,
                name: None,
            });
        }
    }

    // 残りが文字列テーブル
    let consumed = cursor.wrapping_sub(table_start) as u64;
    let strings_len = declared.saturating_sub(consumed);
    let strings = memory.read_bytes(cursor, strings_len as usize);

    for entry in &mut entries {
        if !entry.record.contains("table_offset") {
            continue;
        }

        let offset = entry.record.u32("table_offset") as usize;
        if offset < strings.len() {
            entry.name = Some(decode_cstring(&strings[offset..]));
        } else {
            debug!(
                "String table offset 0x{:x} outside table of 0x{:x} bytes",
                offset,
                strings.len()
            );
        }
    }

    info!(
        "Internal symbol table at 0x{:08x}: {} records, {} bytes of strings",
        table_start,
        entries.len(),
        strings.len()
    );

    Ok(InternalSymbolTable { header, entries })
}

fn read_at(memory: &MemoryImage, cursor: &mut u32, layout: &[FieldSpec]) -> Result<Record> {
    let record = memory.read_record(*cursor, layout)?;
    *cursor = cursor.wrapping_add(layout_size(layout) as u32);
    Ok(record)
}
