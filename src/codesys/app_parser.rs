/// アプリケーションイメージ解析のエントリポイント
///
/// デコード → アドレス空間再構築 → 内部シンボル → タスク復元 の順に実行する。
/// デコードの失敗は致命的だが、それ以降の段階の失敗は
/// `task_recovery`に記録されるだけで、それまでの結果は常に返る。

use super::internal_symbols::{read_internal_symbols, InternalSymbolTable};
use super::memory_layout::{block_containing, AnchorAddresses, MemoryLayout, ProjectValue};
use super::symbols::SymbolTable;
use super::tag_decoder;
use super::tags::AnchorKind;
use super::task_recovery::{TaskInfo, TaskRecoveryOrchestrator, DEFAULT_TASK_NAME_MAX_LEN};
use super::xref::XrefGraph;
use crate::error::{ForensicError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// 解析オプション
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisOptions {
    /// シミュレーションによるタスク復元を行う
    pub recover_tasks: bool,
    /// Thumbモードでデコードする
    pub thumb: bool,
    /// タスク名の最大長
    pub task_name_max_len: usize,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            recover_tasks: true,
            thumb: false,
            task_name_max_len: DEFAULT_TASK_NAME_MAX_LEN,
        }
    }
}

/// タスク復元段階の結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum TaskRecoveryStatus {
    Skipped(String),
    Failed(String),
    Recovered(usize),
}

/// 解析結果
#[derive(Debug, Clone)]
pub struct AppAnalysis {
    pub application_name: Option<String>,
    pub project_info: IndexMap<String, ProjectValue>,
    pub symbols: SymbolTable,
    pub code_blocks: BTreeMap<u32, Vec<u8>>,
    pub anchors: AnchorAddresses,
    pub internal_symbols: Option<InternalSymbolTable>,
    pub tasks: Vec<TaskInfo>,
    pub entry_point_graph: Option<XrefGraph>,
    pub task_recovery: TaskRecoveryStatus,
}

/// 概要レポート
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisSummary {
    pub application_name: Option<String>,
    pub code_blocks: usize,
    pub code_bytes: usize,
    pub symbols: usize,
    pub internal_symbols: usize,
    pub anchors: IndexMap<&'static str, String>,
    pub tasks: Vec<String>,
    pub entry_point_graph_edges: Option<usize>,
    pub task_recovery: TaskRecoveryStatus,
}

#[derive(Serialize)]
struct AnalysisReport<'a> {
    summary: AnalysisSummary,
    project_info: &'a IndexMap<String, ProjectValue>,
    symbols: BTreeMap<String, &'a str>,
    tasks: &'a [TaskInfo],
    entry_point_graph: Option<&'a XrefGraph>,
}

impl AppAnalysis {
    pub fn project_info_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(&self.project_info)
    }

    pub fn tasks_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(&self.tasks)
    }

    pub fn summary(&self) -> AnalysisSummary {
        let anchors = AnchorKind::ALL
            .iter()
            .filter_map(|&kind| {
                self.anchors
                    .get(kind)
                    .map(|ptr| (kind.symbol_name(), format!("{:#010x}", ptr)))
            })
            .collect();

        AnalysisSummary {
            application_name: self.application_name.clone(),
            code_blocks: self.code_blocks.len(),
            code_bytes: self.code_blocks.values().map(Vec::len).sum(),
            symbols: self.symbols.len(),
            internal_symbols: self.internal_symbols.as_ref().map_or(0, |t| t.entries.len()),
            anchors,
            tasks: self.tasks.iter().map(|t| t.name.clone()).collect(),
            entry_point_graph_edges: self.entry_point_graph.as_ref().map(XrefGraph::edge_count),
            task_recovery: self.task_recovery.clone(),
        }
    }

    /// 完全なJSONレポート
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        let report = AnalysisReport {
            summary: self.summary(),
            project_info: &self.project_info,
            symbols: self
                .symbols
                .iter()
                .map(|(addr, name)| (format!("{:#010x}", addr), name))
                .collect(),
            tasks: &self.tasks,
            entry_point_graph: self.entry_point_graph.as_ref(),
        };
        serde_json::to_value(report)
    }
}

/// アプリケーションイメージを解析する
pub fn analyze(data: &[u8], options: &AnalysisOptions) -> Result<AppAnalysis> {
    let tags = tag_decoder::parse(data)?;
    let layout = MemoryLayout::build(&tags);
    let mut symbols = layout.symbols.clone();

    let internal_symbols = match layout.anchors.get(AnchorKind::TableStart) {
        Some(table_start) => match read_internal_symbols(
            &layout.memory,
            table_start,
            internal_table_limit(&layout, table_start),
        ) {
            Ok(table) => {
                let pairs = table.symbol_pairs();
                info!("Merged {} internal symbol entries", pairs.len());
                symbols.extend(pairs);
                Some(table)
            }
            Err(e) => {
                warn!("Failed to read internal symbol table: {}", e);
                None
            }
        },
        None => {
            debug!("No internal symbol table anchor");
            None
        }
    };

    let (tasks, entry_point_graph, task_recovery) = if options.recover_tasks {
        recover_tasks(&layout, &mut symbols, options)
    } else {
        (
            Vec::new(),
            None,
            TaskRecoveryStatus::Skipped("disabled by options".to_string()),
        )
    };

    let MemoryLayout {
        application_name,
        code_blocks,
        anchors,
        project_info,
        ..
    } = layout;

    Ok(AppAnalysis {
        application_name,
        project_info,
        symbols,
        code_blocks,
        anchors,
        internal_symbols,
        tasks,
        entry_point_graph,
        task_recovery,
    })
}

/// 内部シンボルテーブルの終端: `@table_end`、なければ含まれるコード領域の終端
fn internal_table_limit(layout: &MemoryLayout, table_start: u32) -> u64 {
    if let Some(end) = layout.anchors.get(AnchorKind::TableEnd) {
        if end > table_start {
            return end as u64;
        }
    }
    block_containing(&layout.code_blocks, table_start)
        .and_then(|start| layout.code_blocks.get(&start).map(|code| start as u64 + code.len() as u64))
        .unwrap_or(table_start as u64)
}

fn recover_tasks(
    layout: &MemoryLayout,
    symbols: &mut SymbolTable,
    options: &AnalysisOptions,
) -> (Vec<TaskInfo>, Option<XrefGraph>, TaskRecoveryStatus) {
    let mut orchestrator =
        match TaskRecoveryOrchestrator::new(layout, symbols, options.thumb, options.task_name_max_len) {
            Ok(orchestrator) => orchestrator,
            Err(e) => return (Vec::new(), None, failed(e)),
        };

    let result = orchestrator.run();
    let graph = orchestrator.take_entry_point_graph();

    match result {
        Ok(tasks) => {
            info!("Recovered {} tasks", tasks.len());
            let status = TaskRecoveryStatus::Recovered(tasks.len());
            (tasks, graph, status)
        }
        Err(e @ ForensicError::UnsupportedArchitecture { .. }) => {
            warn!("Task recovery skipped: {}", e);
            (Vec::new(), graph, TaskRecoveryStatus::Skipped(e.to_string()))
        }
        Err(e) => (Vec::new(), graph, failed(e)),
    }
}

fn failed(error: ForensicError) -> TaskRecoveryStatus {
    warn!("Task recovery failed: {}", error);
    TaskRecoveryStatus::Failed(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codesys::tag_decoder::encode_tag;
    use crate::codesys::tags::*;

    fn pointer_payload(pointer: u32) -> Vec<u8> {
        let mut out = 1u16.to_le_bytes().to_vec();
        out.extend_from_slice(&pointer.to_le_bytes());
        out
    }

    fn image(init_code: &[u8]) -> Vec<u8> {
        image_with_anchors(init_code, &[])
    }

    fn image_with_anchors(init_code: &[u8], anchors: &[(u64, u32)]) -> Vec<u8> {
        let header = encode_tag(TAG_CODE_AREA_HEADER, &pointer_payload(0x1000));
        let mut data = (init_code.len() as u32).to_le_bytes().to_vec();
        data.extend_from_slice(init_code);
        let area = encode_tag(
            TAG_CODE_AREA,
            &[header, encode_tag(TAG_CODE_AREA_DATA, &data)].concat(),
        );

        let mut footer = encode_tag(TAG_INIT_JUMP_TABLE, &pointer_payload(0x1000));
        for &(tag, pointer) in anchors {
            footer.extend(encode_tag(tag, &pointer_payload(pointer)));
        }

        let inner = [
            encode_tag(TAG_APPLICATION_NAME, b"App\0"),
            encode_tag(TAG_LIST_OF_CODE_AREAS, &area),
            encode_tag(TAG_FOOTER_ADDRESSES, &footer),
            encode_tag(TAG_PROJECT_INFO, &encode_tag(1, b"Demo\0")),
        ]
        .concat();
        encode_tag(TAG_LIST_OF_TAGS, &inner)
    }

    #[test]
    fn test_options_from_json() {
        let options: AnalysisOptions = serde_json::from_str(r#"{"thumb": true}"#).unwrap();
        assert!(options.thumb);
        assert!(options.recover_tasks);
        assert_eq!(options.task_name_max_len, 0x33);
    }

    #[test]
    fn test_recovery_disabled() {
        let options = AnalysisOptions {
            recover_tasks: false,
            ..Default::default()
        };
        let analysis = analyze(&image(&[0x00, 0x44, 0x2D, 0xE9]), &options).unwrap();

        assert_eq!(analysis.application_name.as_deref(), Some("App"));
        assert!(matches!(analysis.task_recovery, TaskRecoveryStatus::Skipped(_)));
    }

    #[test]
    fn test_unsupported_architecture_keeps_static_results() {
        let analysis = analyze(&image(&[0x10, 0xB5, 0x00, 0x00]), &AnalysisOptions::default()).unwrap();

        assert!(matches!(analysis.task_recovery, TaskRecoveryStatus::Skipped(_)));
        assert!(analysis.tasks.is_empty());
        assert_eq!(analysis.code_blocks.len(), 1);
        assert_eq!(analysis.symbols.get(0x1000), Some("@init_jump_table"));
        assert_eq!(
            analysis.project_info_json().unwrap(),
            serde_json::json!({"name": "Demo"})
        );
    }

    #[test]
    fn test_missing_runtime_symbol_fails_recovery() {
        let analysis = analyze(&image(&[0x00, 0x44, 0x2D, 0xE9]), &AnalysisOptions::default()).unwrap();

        match &analysis.task_recovery {
            TaskRecoveryStatus::Failed(reason) => assert!(reason.contains("__SYS__SETUP__TASKS")),
            other => panic!("unexpected status: {:?}", other),
        }
        assert!(analysis.entry_point_graph.is_none());
    }

    #[test]
    fn test_truncated_input_is_fatal() {
        let mut data = image(&[0x00, 0x44, 0x2D, 0xE9]);
        data.truncate(data.len() - 3);

        assert!(matches!(
            analyze(&data, &AnalysisOptions::default()).unwrap_err(),
            ForensicError::StreamExhausted { .. }
        ));
    }

    #[test]
    fn test_summary_json() {
        let analysis = analyze(&image(&[0x10, 0xB5, 0x00, 0x00]), &AnalysisOptions::default()).unwrap();
        let summary = serde_json::to_value(analysis.summary()).unwrap();

        assert_eq!(summary["application_name"], "App");
        assert_eq!(summary["code_blocks"], 1);
        assert_eq!(summary["anchors"]["@init_jump_table"], "0x00001000");
        assert_eq!(summary["task_recovery"]["status"], "skipped");

        let report = analysis.to_json().unwrap();
        assert_eq!(report["symbols"]["0x00001000"], "@init_jump_table");
    }

    #[test]
    fn test_oversized_internal_table_is_skipped() {
        let mut code = vec![0x10, 0xB5, 0x00, 0x00];
        code.extend_from_slice(&0xFFFF_FFF0u32.to_le_bytes());
        code.extend_from_slice(&[0; 16]);

        let data = image_with_anchors(&code, &[(TAG_INTERNAL_SYMBOL_TABLE_START, 0x1004)]);
        let analysis = analyze(&data, &AnalysisOptions::default()).unwrap();

        assert!(analysis.internal_symbols.is_none());
        assert_eq!(analysis.application_name.as_deref(), Some("App"));
        assert!(matches!(analysis.task_recovery, TaskRecoveryStatus::Skipped(_)));
    }
}
