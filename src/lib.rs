/// codesys-forensics ライブラリ
///
/// 産業用コントローラ（CODESYS V3）のアプリケーションイメージから
/// コード・シンボル・プロジェクト情報・タスク構成を抽出する

pub mod error;
pub mod stream;
pub mod memory;

pub mod codesys;

pub use codesys::{analyze, AnalysisOptions, AppAnalysis};
pub use error::{ForensicError, Result};
