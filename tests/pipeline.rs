//! 合成アプリケーションイメージを使ったパイプライン全体のテスト

use codesys_forensics::codesys::tag_decoder::{encode_section, encode_tag};
use codesys_forensics::codesys::tags::*;
use codesys_forensics::codesys::{analyze, AnalysisOptions, TaskRecoveryStatus};

const PUSH: u32 = 0xE92D4400; // push {sl, lr}
const POP: u32 = 0xE8BD8400; // pop {sl, pc}
const MOV_LR_PC: u32 = 0xE1A0E00F; // mov lr, pc
const LDR_PC_R3: u32 = 0xE593F000; // ldr pc, [r3]

/// `ldr rd, [pc, #(lit - at - 8)]`
fn ldr_lit(rd: u32, at: u32, lit: u32) -> u32 {
    0xE59F_0000 | (rd << 12) | (lit - (at + 8))
}

fn words(ws: &[u32]) -> Vec<u8> {
    ws.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn pointer_payload(pointer: u32) -> Vec<u8> {
    let mut out = 1u16.to_le_bytes().to_vec();
    out.extend_from_slice(&pointer.to_le_bytes());
    out
}

fn code_area(pointer: u32, code: &[u8]) -> Vec<u8> {
    let mut data = (code.len() as u32).to_le_bytes().to_vec();
    data.extend_from_slice(code);
    encode_tag(
        TAG_CODE_AREA,
        &[
            encode_tag(TAG_CODE_AREA_HEADER, &pointer_payload(pointer)),
            encode_tag(TAG_CODE_AREA_DATA, &data),
        ]
        .concat(),
    )
}

fn symbol(pointer: u32, name: &str) -> Vec<u8> {
    let mut payload = pointer_payload(pointer);
    payload.extend_from_slice(&0u32.to_le_bytes());
    payload.extend_from_slice(name.as_bytes());
    payload.push(0);
    encode_tag(TAG_SYMBOL, &payload)
}

/// ランタイム関数スロット・タスク構造体・記述子を置くデータ領域 (0x8000)
fn data_area() -> Vec<u8> {
    let mut d = vec![0u8; 0x300];

    // 0x8000 __SYS__SETUP__TASKS, 0x8004 __MEMCOPY, 0x8008 __SYS__RTS__CYCLE__2 のスロット
    put_u32(&mut d, 0x10, 0x2000); // @entry_point
    put_u32(&mut d, 0x14, 0x3000); // @init_application
    put_u32(&mut d, 0x18, 0x2100);
    put_u32(&mut d, 0x1C, 0x2200);
    put_u32(&mut d, 0x24, 0x4000); // タスクのエントリ関数
    put_u32(&mut d, 0x28, 0x4100);

    // タスク構造体のテンプレート（memcopyで0xA000へ複製される）
    d[0x102..0x104].copy_from_slice(&1u16.to_le_bytes());
    put_u32(&mut d, 0x104, 0x8200);
    put_u32(&mut d, 0x108, 0x8120);
    put_u32(&mut d, 0x120, 0x8140);

    // タスク記述子
    put_u32(&mut d, 0x140, 1); // dwVersion
    put_u32(&mut d, 0x144, 0x8250); // pszName
    d[0x148..0x14A].copy_from_slice(&1u16.to_le_bytes()); // nPriority
    put_u32(&mut d, 0x158, 0x8024); // dwTaskEntryFunctionPointer
    put_u32(&mut d, 0x160, 20000); // dwInterval

    d[0x200..0x20C].copy_from_slice(b"Application\0");
    d[0x250..0x259].copy_from_slice(b"MainTask\0");
    d
}

fn internal_symbol_table() -> Vec<u8> {
    let strings = b"PLC_PRG\0";
    let size = 20 + 24 + strings.len() as u32;

    let mut t = Vec::new();
    t.extend_from_slice(&size.to_le_bytes());
    t.extend_from_slice(&0u32.to_le_bytes());
    for count in [1u16, 0, 0, 0, 0, 0] {
        t.extend_from_slice(&count.to_le_bytes());
    }
    t.extend(words(&[0, 0, 0]));
    t.extend_from_slice(&[0, 0, 0, 0]);
    t.extend(words(&[0x4100, 0x4100]));
    t.extend_from_slice(strings);
    t
}

fn build_image(init_code: &[u8], with_cycle_symbol: bool) -> Vec<u8> {
    let areas = [
        code_area(0x1000, init_code),
        code_area(0x2000, &words(&[PUSH, ldr_lit(3, 0x2004, 0x200C), POP, 0x8018])),
        code_area(
            0x2100,
            &words(&[
                PUSH,
                ldr_lit(2, 0x2104, 0x2138),
                0xE24DD00C, // sub sp, sp, #12
                ldr_lit(0, 0x210C, 0x213C),
                0xE58D0000, // str r0, [sp]
                ldr_lit(0, 0x2114, 0x2140),
                0xE58D0004, // str r0, [sp, #4]
                0xE3A0000C, // mov r0, #12
                0xE58D0008, // str r0, [sp, #8]
                ldr_lit(3, 0x2124, 0x2144),
                MOV_LR_PC,
                LDR_PC_R3, // __MEMCOPY(0xA000, 0x8100, 12)
                0xE28DD00C, // add sp, sp, #12
                POP,
                0x801C,
                0xA000,
                0x8100,
                0x8004,
            ]),
        ),
        code_area(0x2200, &words(&[PUSH, ldr_lit(3, 0x2204, 0x220C), POP, 0x8008])),
        code_area(
            0x3000,
            &words(&[
                PUSH,
                0xE24DD010, // sub sp, sp, #16
                ldr_lit(0, 0x3008, 0x3024),
                0xE58D0004, // str r0, [sp, #4]
                0xE28DD010, // add sp, sp, #16
                ldr_lit(3, 0x3014, 0x3028),
                MOV_LR_PC,
                LDR_PC_R3, // __SYS__SETUP__TASKS(0xA000)
                POP,
                0xA000,
                0x8000,
            ]),
        ),
        code_area(0x4000, &words(&[PUSH, ldr_lit(3, 0x4004, 0x400C), POP, 0x8028])),
        code_area(0x4100, &words(&[PUSH, POP])),
        code_area(0x8000, &data_area()),
        code_area(0x9000, &internal_symbol_table()),
    ]
    .concat();

    let footer = [
        encode_tag(TAG_INIT_JUMP_TABLE, &pointer_payload(0x1000)),
        encode_tag(TAG_ENTRY_POINT, &pointer_payload(0x8010)),
        encode_tag(TAG_INIT_APPLICATION, &pointer_payload(0x8014)),
        encode_tag(TAG_INTERNAL_SYMBOL_TABLE_START, &pointer_payload(0x9000)),
        encode_tag(TAG_INTERNAL_SYMBOL_TABLE_END, &pointer_payload(0x9034)),
    ]
    .concat();

    let mut symbols = vec![symbol(0x8000, "__SYS__SETUP__TASKS"), symbol(0x8004, "__MEMCOPY")];
    if with_cycle_symbol {
        symbols.push(symbol(0x8008, "__SYS__RTS__CYCLE__2"));
    }

    let mut function_symbol = 0u16.to_le_bytes().to_vec();
    function_symbol.extend_from_slice(&0x2200u32.to_le_bytes());
    let function_symbols = [
        encode_tag(1, &function_symbol),
        encode_tag(2, b"CycleUser\0"),
    ]
    .concat();

    let inner = [
        encode_tag(TAG_APPLICATION_NAME, b"Application\0"),
        encode_tag(TAG_LIST_OF_CODE_AREAS, &areas),
        encode_tag(TAG_FOOTER_ADDRESSES, &footer),
        encode_tag(TAG_SYMBOLS, &symbols.concat()),
        encode_tag(TAG_FUNCTION_SYMBOLS, &function_symbols),
    ]
    .concat();

    let project_info = [
        encode_tag(1, b"Demo\0"),
        encode_tag(3, &1_600_000_000u32.to_le_bytes()),
        encode_tag(4, b"someone\0"),
    ]
    .concat();

    let mut file = encode_tag(TAG_LIST_OF_TAGS, &inner);
    file.extend(encode_section(7, 1, b"ignored"));
    file.extend(encode_section(5, 1, &encode_tag(TAG_PROJECT_INFO, &project_info)));
    file
}

#[test]
fn test_full_task_recovery() {
    let image = build_image(&words(&[PUSH, POP]), true);
    let analysis = analyze(&image, &AnalysisOptions::default()).unwrap();

    assert_eq!(analysis.task_recovery, TaskRecoveryStatus::Recovered(1));
    assert_eq!(analysis.application_name.as_deref(), Some("Application"));
    assert_eq!(analysis.code_blocks.len(), 9);

    // シンボル: 静的タグ + 0x88 + アンカー + 内部テーブル + 復元したタスク
    assert_eq!(analysis.symbols.get(0x8004), Some("__MEMCOPY"));
    assert_eq!(analysis.symbols.get(0x2200), Some("CycleUser"));
    assert_eq!(analysis.symbols.get(0x8010), Some("@entry_point"));
    assert_eq!(analysis.symbols.get(0x4100), Some("PLC_PRG"));
    assert_eq!(analysis.symbols.get(0x4000), Some("MainTask"));

    let graph = analysis.entry_point_graph.as_ref().unwrap();
    assert_eq!(graph.callers_of("__SYS__RTS__CYCLE__2"), vec!["0x2200 CycleUser"]);
    assert_eq!(graph.callers_of("0x2200 CycleUser"), vec!["0x2100"]);
    assert!(graph.contains_edge("0x2100", "__MEMCOPY"));

    let task = &analysis.tasks[0];
    assert_eq!(task.name, "MainTask");
    assert_eq!(task.entry_point, 0x4000);
    assert_eq!(task.fields.u32("dwInterval"), 20000);
    assert_eq!(task.fields.u32("nPriority"), 1);
    assert!(task.xrefs.contains_edge("0x4000 MainTask", "0x4100 PLC_PRG"));

    let fields = task.fields_json().unwrap();
    assert_eq!(fields["dwTaskEntryFunctionPointer"], 0x8024);

    let tasks = analysis.tasks_json().unwrap();
    assert_eq!(tasks[0]["name"], "MainTask");
    assert_eq!(tasks[0]["xrefs"]["edges"][0][1], "0x4100 PLC_PRG");
}

#[test]
fn test_project_info_from_section() {
    let image = build_image(&words(&[PUSH, POP]), true);
    let options = AnalysisOptions {
        recover_tasks: false,
        ..Default::default()
    };
    let analysis = analyze(&image, &options).unwrap();

    let info = analysis.project_info_json().unwrap();
    assert_eq!(info["name"], "Demo");
    assert_eq!(info["project_build_datetime"], "2020-09-13T12:26:40");
    assert_eq!(info["author"], "someone");
}

#[test]
fn test_unsupported_architecture_degrades() {
    // Thumb の push {r4, lr} ; nop
    let image = build_image(&[0x10, 0xB5, 0x00, 0xBF], true);
    let analysis = analyze(&image, &AnalysisOptions::default()).unwrap();

    match &analysis.task_recovery {
        TaskRecoveryStatus::Skipped(reason) => assert!(reason.contains("Unsupported architecture")),
        other => panic!("unexpected status: {:?}", other),
    }
    assert!(analysis.tasks.is_empty());
    assert!(analysis.entry_point_graph.is_none());

    // 静的な結果は残る
    assert_eq!(analysis.symbols.get(0x4100), Some("PLC_PRG"));
    assert_eq!(analysis.symbols.get(0x4000), None);
    assert_eq!(analysis.project_info_json().unwrap()["name"], "Demo");
}

#[test]
fn test_missing_cycle_reference_keeps_entry_graph() {
    let image = build_image(&words(&[PUSH, POP]), false);
    let analysis = analyze(&image, &AnalysisOptions::default()).unwrap();

    assert!(matches!(analysis.task_recovery, TaskRecoveryStatus::Failed(_)));
    let graph = analysis.entry_point_graph.as_ref().unwrap();
    assert!(graph.contains_edge("0x2000", "0x2100"));
    assert!(graph.callers_of("__SYS__RTS__CYCLE__2").is_empty());
}

#[test]
fn test_summary_report() {
    let image = build_image(&words(&[PUSH, POP]), true);
    let analysis = analyze(&image, &AnalysisOptions::default()).unwrap();
    let summary = analysis.summary();

    assert_eq!(summary.tasks, vec!["MainTask".to_string()]);
    assert_eq!(summary.internal_symbols, 1);
    assert_eq!(summary.anchors.len(), 5);

    let report = analysis.to_json().unwrap();
    assert_eq!(report["summary"]["task_recovery"]["status"], "recovered");
    assert_eq!(report["summary"]["task_recovery"]["detail"], 1);
    assert_eq!(report["symbols"]["0x00004000"], "MainTask");
}
