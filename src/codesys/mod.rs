/// CODESYS V3 アプリケーションイメージ解析
///
/// タグコンテナのデコードからタスク復元までのパイプライン

pub mod tag_decoder;
pub mod tags;
pub mod symbols;
pub mod memory_layout;
pub mod internal_symbols;

// 動的解析（ARMシミュレーション）
pub mod arm_decode;
pub mod arm_sim;
pub mod xref;
pub mod task_recovery;

pub mod app_parser;

pub use app_parser::{analyze, AnalysisOptions, AnalysisSummary, AppAnalysis, TaskRecoveryStatus};
pub use memory_layout::{AnchorAddresses, MemoryLayout, ProjectValue};
pub use symbols::SymbolTable;
pub use tags::{AnchorKind, Tag, TagKind};
pub use task_recovery::TaskInfo;
pub use xref::XrefGraph;
