/// シンボルテーブル
///
/// アドレス → 名前 のマッピング。静的タグ、アンカー、内部テーブル、
/// 復元したタスクの順に段階的に追記される。検索は失敗しない

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTable {
    symbols: BTreeMap<u32, String>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// シンボルを追加（同一アドレスは上書き）
    pub fn insert(&mut self, address: u32, name: impl Into<String>) {
        self.symbols.insert(address, name.into());
    }

    pub fn extend<I: IntoIterator<Item = (u32, String)>>(&mut self, entries: I) {
        self.symbols.extend(entries);
    }

    pub fn get(&self, address: u32) -> Option<&str> {
        self.symbols.get(&address).map(String::as_str)
    }

    pub fn contains(&self, address: u32) -> bool {
        self.symbols.contains_key(&address)
    }

    /// 名前からアドレスを逆引き（最小アドレスを返す）
    pub fn address_of(&self, name: &str) -> Option<u32> {
        self.symbols
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(&addr, _)| addr)
    }

    /// グラフのノード名: `"0x1234 name"`（名前がなければアドレスのみ）
    pub fn label(&self, address: u32) -> String {
        match self.get(address) {
            Some(name) if !name.is_empty() => format!("{:#x} {}", address, name),
            _ => format!("{:#x}", address),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        self.symbols.iter().map(|(&a, n)| (a, n.as_str()))
    }

    pub fn as_map(&self) -> &BTreeMap<u32, String> {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_table() {
        let mut table = SymbolTable::new();
        table.insert(0x2000, "__MEMCOPY");
        table.insert(0x1000, "__MEMCOPY");
        table.insert(0x3000, "MainTask");

        assert_eq!(table.len(), 3);
        assert_eq!(table.get(0x3000), Some("MainTask"));
        assert_eq!(table.get(0x4000), None);
        assert_eq!(table.address_of("__MEMCOPY"), Some(0x1000));
        assert_eq!(table.address_of("missing"), None);
    }

    #[test]
    fn test_label() {
        let mut table = SymbolTable::new();
        table.insert(0x1a2b, "PLC_PRG");

        assert_eq!(table.label(0x1a2b), "0x1a2b PLC_PRG");
        assert_eq!(table.label(0x10), "0x10");
    }
}
