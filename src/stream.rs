/// バイナリストリーム読み込み
///
/// 境界チェック付きのリーダーと、フィールド記述子のリストから
/// 固定レイアウトの構造体を読む汎用リーダーを提供

use crate::error::{ForensicError, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use indexmap::IndexMap;
use serde::{Serialize, Serializer};

/// スライス上のカーソル付きリーダー（リトルエンディアン既定）
#[derive(Debug, Clone)]
pub struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn tell(&self) -> usize {
        self.pos
    }

    /// 末尾を超える位置も許容する（次の読み込みで失敗する）
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// 指定バイト数をちょうど読む
    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        let remaining = self.remaining();
        if count > remaining {
            return Err(ForensicError::StreamExhausted {
                offset: self.pos,
                needed: count,
                remaining,
            });
        }

        let start = self.pos;
        self.pos += count;
        Ok(&self.data[start..self.pos])
    }

    /// 残り全部を読む
    pub fn read_rest(&mut self) -> &'a [u8] {
        let start = self.pos.min(self.data.len());
        self.pos = self.data.len();
        &self.data[start..]
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u16_be(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// 最初のNULまでを切り出す（NULがなければ全体）
pub fn null_terminated(data: &[u8]) -> &[u8] {
    match data.iter().position(|&b| b == 0) {
        Some(end) => &data[..end],
        None => data,
    }
}

/// NUL終端文字列を非ASCIIを置換しつつデコード
pub fn decode_cstring(data: &[u8]) -> String {
    String::from_utf8_lossy(null_terminated(data)).into_owned()
}

/// フィールドの型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    U8,
    U16,
    U32,
    Bytes(usize),
    /// 汎用リーダーでは読まない（個別ロジックで埋める）
    Dynamic,
}

impl FieldKind {
    pub fn size(&self) -> usize {
        match self {
            FieldKind::U8 => 1,
            FieldKind::U16 => 2,
            FieldKind::U32 => 4,
            FieldKind::Bytes(n) => *n,
            FieldKind::Dynamic => 0,
        }
    }
}

/// 構造体フィールド記述子（宣言順に読まれる）
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub const fn u8(name: &'static str) -> Self {
        Self { name, kind: FieldKind::U8 }
    }

    pub const fn u16(name: &'static str) -> Self {
        Self { name, kind: FieldKind::U16 }
    }

    pub const fn u32(name: &'static str) -> Self {
        Self { name, kind: FieldKind::U32 }
    }

    pub const fn bytes(name: &'static str, len: usize) -> Self {
        Self { name, kind: FieldKind::Bytes(len) }
    }

    pub const fn dynamic(name: &'static str) -> Self {
        Self { name, kind: FieldKind::Dynamic }
    }
}

/// レイアウト全体のバイト数
pub fn layout_size(layout: &[FieldSpec]) -> usize {
    layout.iter().map(|f| f.kind.size()).sum()
}

/// 読み込んだフィールド値
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Int(u64),
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            FieldValue::Int(v) => u32::try_from(*v).ok(),
            FieldValue::Bytes(_) => None,
        }
    }
}

// 生バイト列はbase64文字列としてJSONに出す
impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            FieldValue::Int(v) => serializer.serialize_u64(*v),
            FieldValue::Bytes(b) => serializer.serialize_str(&STANDARD.encode(b)),
        }
    }
}

/// 宣言順を保持したレコード
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Record {
    fields: IndexMap<&'static str, FieldValue>,
}

impl Record {
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// 整数フィールドを取得（存在しなければ0）
    pub fn u32(&self, name: &str) -> u32 {
        self.get(name).and_then(FieldValue::as_u32).unwrap_or(0)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn insert(&mut self, name: &'static str, value: FieldValue) {
        self.fields.insert(name, value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&&'static str, &FieldValue)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// 記述子リストに従ってレコードを読む
pub fn read_record(reader: &mut BinaryReader<'_>, layout: &[FieldSpec]) -> Result<Record> {
    let mut record = Record::default();

    for field in layout {
        let value = match field.kind {
            FieldKind::U8 => FieldValue::Int(reader.read_u8()? as u64),
            FieldKind::U16 => FieldValue::Int(reader.read_u16_le()? as u64),
            FieldKind::U32 => FieldValue::Int(reader.read_u32_le()? as u64),
            FieldKind::Bytes(n) => FieldValue::Bytes(reader.read_bytes(n)?.to_vec()),
            FieldKind::Dynamic => continue,
        };
        record.insert(field.name, value);
    }

    Ok(record)
}
