/// CODESYS V3 アプリケーションイメージのタグデコーダ
///
/// タグは `id(varint) | size(varint) | payload[size]` の再帰的なTLV形式。
/// ファイル全体はルートタグ1つの後に、マジック`0x55CD`で始まる
/// セクションが続く

use super::tags::Tag;
use crate::error::{ForensicError, Result};
use crate::stream::BinaryReader;
use tracing::debug;

/// varintの最大バイト数（42bitで打ち切り）
pub const MAX_VARINT_BYTES: usize = 6;
/// varintで表現できる最大値
pub const VARINT_MAX: u64 = (1 << (7 * MAX_VARINT_BYTES)) - 1;

/// コンテナタグの最大ネスト深さ
pub const MAX_TAG_DEPTH: usize = 64;

/// セクションヘッダのマジック（ビッグエンディアン）
pub const SECTION_MAGIC: u16 = 0x55CD;
/// 運転状態設定ハンドラ：ペイロードは単一タグ
pub const HANDLER_SET_OPERATION_STATE: u16 = 3;
/// アプリケーション全体アップロード：ペイロードはタグ列
pub const HANDLER_APP_UPLOAD_FULL_APPLICATION: u16 = 5;

/// varintを読む（最大6バイト）
pub fn decode_varint(br: &mut BinaryReader<'_>) -> Result<u64> {
    let mut value = 0u64;

    for index in 0..MAX_VARINT_BYTES {
        let byte = br.read_u8()?;
        value |= ((byte & 0x7F) as u64) << (7 * index);
        if byte & 0x80 == 0 {
            break;
        }
    }

    Ok(value)
}

/// varintを書く（42bitを超える部分は切り捨て）
pub fn encode_varint(value: u64) -> Vec<u8> {
    let mut v = value & VARINT_MAX;
    let mut out = Vec::with_capacity(MAX_VARINT_BYTES);

    loop {
        let mut byte = (v & 0x7F) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if v == 0 {
            break;
        }
    }

    out
}

/// タグを1つ書く（テスト・合成イメージ用）
pub fn encode_tag(id: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = encode_varint(id);
    out.extend(encode_varint(payload.len() as u64));
    out.extend_from_slice(payload);
    out
}

/// タグを1つ読み、カタログで型付けする
pub fn read_tag(br: &mut BinaryReader<'_>) -> Result<Tag> {
    read_nested_tag(br, 0)
}

/// バッファが尽きるまでタグを読む
pub fn read_list_of_tags(data: &[u8]) -> Result<Vec<Tag>> {
    read_nested_list(data, 0)
}

pub(crate) fn read_nested_tag(br: &mut BinaryReader<'_>, depth: usize) -> Result<Tag> {
    if depth > MAX_TAG_DEPTH {
        return Err(ForensicError::NestingTooDeep(MAX_TAG_DEPTH));
    }

    let id = decode_varint(br)?;
    let size = decode_varint(br)?;
    let payload = br.read_bytes(size as usize)?;

    Tag::from_nested_payload(id, payload, depth)
}

pub(crate) fn read_nested_list(data: &[u8], depth: usize) -> Result<Vec<Tag>> {
    let mut br = BinaryReader::new(data);
    let mut tags = Vec::new();

    while br.remaining() > 0 {
        tags.push(read_nested_tag(&mut br, depth)?);
    }

    Ok(tags)
}

/// セクションヘッダとペイロード
#[derive(Debug, Clone)]
pub struct Section<'a> {
    pub handler_id: u16,
    pub session_id: u32,
    pub data: &'a [u8],
}

/// セクションを1つ読む。マジック不一致ならNone
pub fn read_section<'a>(br: &mut BinaryReader<'a>) -> Result<Option<Section<'a>>> {
    let magic = br.read_u16_be()?;
    if magic != SECTION_MAGIC {
        debug!("Section magic mismatch: 0x{:04x} at offset {}", magic, br.tell() - 2);
        return Ok(None);
    }

    let header_size = br.read_u16_le()?;
    let _reserved = br.read_u16_le()?;
    let handler_id = br.read_u16_le()?;
    let session_id = br.read_u32_le()?;
    let payload_len = br.read_u32_le()?;

    // 拡張ヘッダ
    if header_size as u32 + 4 > 0x10 {
        br.read_u32_le()?;
    }

    let data = br.read_bytes(payload_len as usize)?;

    Ok(Some(Section {
        handler_id,
        session_id,
        data,
    }))
}

/// ファイル全体を解析してトップレベルのタグ列を返す
pub fn parse(file_data: &[u8]) -> Result<Vec<Tag>> {
    let mut br = BinaryReader::new(file_data);
    let mut all_tags = vec![read_tag(&mut br)?];

    while br.remaining() > 0 {
        let section = match read_section(&mut br)? {
            Some(section) => section,
            None => break,
        };

        match section.handler_id {
            HANDLER_SET_OPERATION_STATE => {
                let mut section_br = BinaryReader::new(section.data);
                all_tags.push(read_tag(&mut section_br)?);
            }
            HANDLER_APP_UPLOAD_FULL_APPLICATION => {
                all_tags.extend(read_list_of_tags(section.data)?);
            }
            other => {
                debug!("Skipping section with handler {} ({} bytes)", other, section.data.len());
            }
        }
    }

    debug!("Parsed {} top-level tags", all_tags.len());
    Ok(all_tags)
}

/// セクションを1つ書く（テスト・合成イメージ用）
pub fn encode_section(handler_id: u16, session_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = SECTION_MAGIC.to_be_bytes().to_vec();
    out.extend_from_slice(&0x0Cu16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&handler_id.to_le_bytes());
    out.extend_from_slice(&session_id.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codesys::tags::TagKind;
    use crate::error::ForensicError;

    #[test]
    fn test_varint_round_trip() {
        for value in [0u64, 1, 0x7F, 0x80, 0x3FFF, 0x4000, 0xA0, 0xDEAD_BEEF, VARINT_MAX] {
            let encoded = encode_varint(value);
            assert!(encoded.len() <= MAX_VARINT_BYTES);

            let mut br = BinaryReader::new(&encoded);
            assert_eq!(decode_varint(&mut br).unwrap(), value);
            assert_eq!(br.remaining(), 0);
        }
    }

    #[test]
    fn test_varint_caps_at_six_bytes() {
        // 継続ビットが立ち続けても6バイトで止まる
        let data = [0xFF; 8];
        let mut br = BinaryReader::new(&data);

        assert_eq!(decode_varint(&mut br).unwrap(), VARINT_MAX);
        assert_eq!(br.tell(), MAX_VARINT_BYTES);

        // 上限を超える値は42bitに切り詰められる
        assert_eq!(encode_varint(VARINT_MAX + 1), vec![0x00]);
        assert_eq!(encode_varint(VARINT_MAX).len(), MAX_VARINT_BYTES);
    }

    #[test]
    fn test_varint_exhausted() {
        let data = [0x80, 0x80];
        let mut br = BinaryReader::new(&data);
        assert!(matches!(
            decode_varint(&mut br),
            Err(ForensicError::StreamExhausted { .. })
        ));
    }

    #[test]
    fn test_read_list_preserves_order() {
        let mut data = Vec::new();
        for id in [0x30u64, 0x31, 0x32, 0x4000] {
            data.extend(encode_tag(id, &[id as u8; 3]));
        }

        let tags = read_list_of_tags(&data).unwrap();
        assert_eq!(tags.len(), 4);
        let ids: Vec<_> = tags.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![0x30, 0x31, 0x32, 0x4000]);
        assert!(tags.iter().all(|t| matches!(t.kind, TagKind::Unknown)));
    }

    #[test]
    fn test_truncated_payload_is_fatal() {
        let mut data = encode_varint(0x30);
        data.extend(encode_varint(10));
        data.extend_from_slice(&[1, 2, 3]);

        assert!(matches!(
            read_list_of_tags(&data),
            Err(ForensicError::StreamExhausted { needed: 10, remaining: 3, .. })
        ));
    }

    #[test]
    fn test_demo_application_name() {
        let inner = encode_tag(0x10, b"demo\0");
        let root = encode_tag(0x81, &inner);

        let tags = parse(&root).unwrap();
        assert_eq!(tags.len(), 1);

        match &tags[0].kind {
            TagKind::ListOfTags(children) => {
                assert_eq!(children.len(), 1);
                match &children[0].kind {
                    TagKind::ApplicationName(name) => assert_eq!(name, "demo"),
                    other => panic!("unexpected: {:?}", other),
                }
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_sections() {
        let mut file = encode_tag(0x81, &encode_tag(0x10, b"app\0"));
        file.extend(encode_section(
            HANDLER_APP_UPLOAD_FULL_APPLICATION,
            7,
            &[encode_tag(0x30, b"a"), encode_tag(0x31, b"b")].concat(),
        ));
        file.extend(encode_section(0x42, 7, b"ignored payload"));
        file.extend(encode_section(HANDLER_SET_OPERATION_STATE, 7, &encode_tag(0x32, b"c")));
        // マジック不一致で終了
        file.extend_from_slice(&[0x00, 0x00, 0xFF]);

        let tags = parse(&file).unwrap();
        let ids: Vec<_> = tags.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![0x81, 0x30, 0x31, 0x32]);
    }

    #[test]
    fn test_extended_section_header() {
        let mut file = encode_tag(0x30, b"");
        file.extend_from_slice(&SECTION_MAGIC.to_be_bytes());
        file.extend_from_slice(&0x10u16.to_le_bytes());
        file.extend_from_slice(&0u16.to_le_bytes());
        file.extend_from_slice(&HANDLER_SET_OPERATION_STATE.to_le_bytes());
        file.extend_from_slice(&1u32.to_le_bytes());
        let payload = encode_tag(0x33, b"x");
        file.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        file.extend_from_slice(&0xAAAA_AAAAu32.to_le_bytes());
        file.extend_from_slice(&payload);

        let tags = parse(&file).unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[1].id, 0x33);
    }

    fn nested_lists(levels: usize) -> Vec<u8> {
        let mut data = encode_tag(0x10, b"deep\0");
        for _ in 0..levels {
            data = encode_tag(0x81, &data);
        }
        data
    }

    #[test]
    fn test_nesting_within_limit() {
        let tags = parse(&nested_lists(MAX_TAG_DEPTH)).unwrap();

        let mut tag = &tags[0];
        let mut levels = 1;
        while let [child] = tag.children() {
            tag = child;
            levels += 1;
        }
        assert_eq!(levels, MAX_TAG_DEPTH + 1);
        assert!(matches!(&tag.kind, TagKind::ApplicationName(name) if name == "deep"));
    }

    #[test]
    fn test_nesting_too_deep() {
        assert!(matches!(
            parse(&nested_lists(MAX_TAG_DEPTH + 10)),
            Err(ForensicError::NestingTooDeep(MAX_TAG_DEPTH))
        ));
    }

    #[test]
    fn test_container_payload_not_duplicated() {
        let root = encode_tag(0x81, &encode_tag(0x10, b"app\0"));
        let tags = parse(&root).unwrap();

        assert!(tags[0].payload.is_empty());
        assert_eq!(tags[0].size, 6);
        assert_eq!(tags[0].children()[0].payload, b"app\0".to_vec());
    }
}
