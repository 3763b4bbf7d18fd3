/// スパースなメモリイメージ
///
/// 32bitアドレス空間全体をページ単位（4KB）で遅延確保する。
/// 未書き込みのアドレスは常に0として読める

use crate::error::Result;
use crate::stream::{layout_size, read_record, BinaryReader, FieldSpec, Record};
use std::collections::HashMap;

const PAGE_BITS: u32 = 12;
const PAGE_SIZE: usize = 1 << PAGE_BITS;
const PAGE_MASK: u32 = (PAGE_SIZE as u32) - 1;

type Page = Box<[u8; PAGE_SIZE]>;

#[derive(Debug, Clone, Default)]
pub struct MemoryImage {
    pages: HashMap<u32, Page>,
    /// 書き込まれた最大アドレス + 1
    extent: u64,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// 書き込み済み領域の終端（次のアドレス）
    pub fn extent(&self) -> u64 {
        self.extent
    }

    /// 確保済みページ数
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn read_u8(&self, address: u32) -> u8 {
        self.pages
            .get(&(address >> PAGE_BITS))
            .map(|page| page[(address & PAGE_MASK) as usize])
            .unwrap_or(0)
    }

    pub fn write_u8(&mut self, address: u32, value: u8) {
        self.write_bytes(address, &[value]);
    }

    /// 連続領域を読む（アドレスは32bitで折り返す）
    pub fn read_bytes(&self, address: u32, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut addr = address;
        let mut left = len;

        while left > 0 {
            let offset = (addr & PAGE_MASK) as usize;
            let chunk = left.min(PAGE_SIZE - offset);

            match self.pages.get(&(addr >> PAGE_BITS)) {
                Some(page) => out.extend_from_slice(&page[offset..offset + chunk]),
                None => out.resize(out.len() + chunk, 0),
            }

            addr = addr.wrapping_add(chunk as u32);
            left -= chunk;
        }

        out
    }

    /// 連続領域に書き込む（必要なページを確保）
    pub fn write_bytes(&mut self, address: u32, data: &[u8]) {
        let mut addr = address;
        let mut rest = data;

        while !rest.is_empty() {
            let offset = (addr & PAGE_MASK) as usize;
            let chunk = rest.len().min(PAGE_SIZE - offset);

            let page = self
                .pages
                .entry(addr >> PAGE_BITS)
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
            page[offset..offset + chunk].copy_from_slice(&rest[..chunk]);

            self.extent = self.extent.max(addr as u64 + chunk as u64);
            addr = addr.wrapping_add(chunk as u32);
            rest = &rest[chunk..];
        }
    }

    pub fn read_u16(&self, address: u32) -> u16 {
        let b = self.read_bytes(address, 2);
        u16::from_le_bytes([b[0], b[1]])
    }

    pub fn write_u16(&mut self, address: u32, value: u16) {
        self.write_bytes(address, &value.to_le_bytes());
    }

    pub fn read_u32(&self, address: u32) -> u32 {
        let b = self.read_bytes(address, 4);
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    pub fn write_u32(&mut self, address: u32, value: u32) {
        self.write_bytes(address, &value.to_le_bytes());
    }

    /// 最大`max_len`バイトのNUL終端文字列を読む
    pub fn read_cstring(&self, address: u32, max_len: usize) -> String {
        crate::stream::decode_cstring(&self.read_bytes(address, max_len))
    }

    /// `address`から記述子リストに従ってレコードを読む
    pub fn read_record(&self, address: u32, layout: &[FieldSpec]) -> Result<Record> {
        let raw = self.read_bytes(address, layout_size(layout));
        read_record(&mut BinaryReader::new(&raw), layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwritten_reads_zero() {
        let mem = MemoryImage::new();
        assert_eq!(mem.read_u32(0xDEAD_BEEF), 0);
        assert_eq!(mem.read_bytes(0x1000, 3), vec![0, 0, 0]);
        assert_eq!(mem.page_count(), 0);
    }

    #[test]
    fn test_write_across_page_boundary() {
        let mut mem = MemoryImage::new();
        mem.write_u32(0x0FFE, 0x11223344);

        assert_eq!(mem.read_u32(0x0FFE), 0x11223344);
        assert_eq!(mem.read_u8(0x1000), 0x22);
        assert_eq!(mem.page_count(), 2);
        assert_eq!(mem.extent(), 0x1002);
    }

    #[test]
    fn test_high_addresses() {
        let mut mem = MemoryImage::new();
        mem.write_u32(0xEFFF_FFFC, 0xCAFEBABE);
        assert_eq!(mem.read_u32(0xEFFF_FFFC), 0xCAFEBABE);
        assert_eq!(mem.read_u16(0xEFFF_FFFE), 0xCAFE);
    }

    #[test]
    fn test_read_cstring() {
        let mut mem = MemoryImage::new();
        mem.write_bytes(0x200, b"MainTask\0garbage");
        assert_eq!(mem.read_cstring(0x200, 0x33), "MainTask");
        assert_eq!(mem.read_cstring(0x200, 4), "Main");
    }

    #[test]
    fn test_read_record() {
        let mut mem = MemoryImage::new();
        mem.write_bytes(0x300, &[0x01, 0x00, 0x02, 0x00, 0x00, 0x40, 0x00, 0x00]);

        let layout = [FieldSpec::u16("a"), FieldSpec::u16("b"), FieldSpec::u32("c")];
        let record = mem.read_record(0x300, &layout).unwrap();
        assert_eq!(record.u32("a"), 1);
        assert_eq!(record.u32("b"), 2);
        assert_eq!(record.u32("c"), 0x4000);
    }
}
