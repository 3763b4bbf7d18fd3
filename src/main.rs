/// CODESYS V3 アプリケーションイメージ解析ツール
///
/// Usage:
///   codesys-forensics Application.app
///   codesys-forensics Application.app --json > report.json
///   codesys-forensics Application.app --config options.json --no-tasks

use anyhow::{Context, Result};
use clap::Parser;
use codesys_forensics::codesys::{analyze, AnalysisOptions, AppAnalysis, ProjectValue, TaskRecoveryStatus};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "codesys-forensics")]
#[command(about = "Extract code, symbols and task configuration from CODESYS V3 application images", long_about = None)]
struct Cli {
    /// Application image file
    #[arg(value_name = "APP_FILE")]
    app_file: PathBuf,

    /// Skip simulation-based task recovery
    #[arg(long)]
    no_tasks: bool,

    /// Decode machine code as Thumb instead of ARM
    #[arg(long)]
    thumb: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Print the full report as JSON
    #[arg(long)]
    json: bool,

    /// JSON file with analysis options (command line flags take precedence)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let options = load_options(&cli)?;
    let data = std::fs::read(&cli.app_file)
        .with_context(|| format!("Failed to read {}", cli.app_file.display()))?;

    info!("Analyzing {} ({} bytes)", cli.app_file.display(), data.len());
    let analysis = analyze(&data, &options)
        .with_context(|| format!("Failed to decode {}", cli.app_file.display()))?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&analysis.to_json()?)?);
    } else {
        print_summary(&analysis);
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // 標準出力はレポート用
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .init();
}

fn load_options(cli: &Cli) -> Result<AnalysisOptions> {
    let mut options = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Invalid config {}", path.display()))?
        }
        None => AnalysisOptions::default(),
    };

    if cli.no_tasks {
        options.recover_tasks = false;
    }
    if cli.thumb {
        options.thumb = true;
    }

    Ok(options)
}

fn print_summary(analysis: &AppAnalysis) {
    let summary = analysis.summary();

    println!("🏭 CODESYS V3 Application");
    println!("{}", "=".repeat(80));
    println!(
        "Application: {}",
        summary.application_name.as_deref().unwrap_or("(unknown)")
    );

    if !analysis.project_info.is_empty() {
        println!("\n📋 Project info:");
        for (key, value) in &analysis.project_info {
            let text = match value {
                ProjectValue::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                ProjectValue::Text(s) => s.clone(),
                ProjectValue::Bytes(b) => format!("{} raw bytes", b.len()),
            };
            println!("   {:<24} {}", key, text);
        }
    }

    println!("\n📦 Code: {} blocks, {} bytes", summary.code_blocks, summary.code_bytes);
    println!(
        "🔖 Symbols: {} ({} from internal table)",
        summary.symbols, summary.internal_symbols
    );
    for (name, address) in &summary.anchors {
        println!("   {:<20} {}", name, address);
    }

    println!("\n⏱️  Tasks:");
    match &summary.task_recovery {
        TaskRecoveryStatus::Recovered(_) => {
            for task in &analysis.tasks {
                println!(
                    "   {:<24} entry 0x{:08X}  priority {}  interval {}  ({} xrefs)",
                    task.name,
                    task.entry_point,
                    task.fields.u32("nPriority"),
                    task.fields.u32("dwInterval"),
                    task.xrefs.edge_count()
                );
            }
        }
        TaskRecoveryStatus::Skipped(reason) => println!("   ⚠️  Skipped: {}", reason),
        TaskRecoveryStatus::Failed(reason) => println!("   ❌ Failed: {}", reason),
    }

    if let Some(edges) = summary.entry_point_graph_edges {
        println!("\n🔗 Entry point call graph: {} edges", edges);
    }
}
