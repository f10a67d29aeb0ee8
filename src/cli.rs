// CLI subcommand definitions using clap derive macros
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use crate::config::{self, TestConfig};
use crate::error::LoadTestError;
use crate::job::{JobInfo, JobManager, JobStatus};

/// IoTブローカ負荷試験ツール
#[derive(Parser, Debug, PartialEq)]
#[command(name = "iot-load-test")]
pub enum Cli {
    /// 負荷試験を実行する
    Run {
        /// JSON設定ファイルパス
        config: PathBuf,
        /// JSON結果出力先
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// 設定ファイルを検証する
    Validate {
        /// JSON設定ファイルパス
        config: PathBuf,
    },
    /// ワーカープロセスのエントリポイント（ジョブマネージャから起動される）
    #[command(hide = true)]
    Worker,
}

/// runサブコマンドの実行
///
/// 設定ファイルを読み込み、ジョブマネージャ経由でワーカーを起動し、
/// 終端状態になるまでポーリングする。Ctrl-Cで実行中のジョブを停止する。
pub async fn run_load_test(
    config_path: &Path,
    output: Option<&Path>,
) -> Result<(), LoadTestError> {
    let config = config::load_from_file(config_path)?;
    run_job(config, output).await
}

async fn run_job(config: TestConfig, output: Option<&Path>) -> Result<(), LoadTestError> {
    let manager = JobManager::new();
    let info = manager.create_job(config).await?;
    println!(
        "Job {} created ({} devices, {} scenario, {}s runtime)",
        info.id, info.config.devices, info.config.scenario.as_str(), info.config.runtime_seconds
    );

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    })
    .map_err(|e| LoadTestError::ConfigError(format!("Failed to set signal handler: {}", e)))?;

    let mut last_status = info.status;
    let finished = loop {
        if interrupted.load(Ordering::Relaxed) {
            println!("Interrupt received, stopping job {}", info.id);
            manager.stop_job(&info.id).await?;
        }
        let current = manager.get_job(&info.id)?;
        if current.status != last_status {
            println!("Job {} is {}", info.id, current.status.as_str());
            last_status = current.status;
        }
        if current.status.is_terminal() {
            break current;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    };

    if let Some(path) = output {
        write_json_result(&finished, path)
            .map_err(|e| LoadTestError::ConfigError(format!("Failed to write result file: {}", e)))?;
    }

    match finished.status {
        JobStatus::Failed => Err(LoadTestError::WorkerFailed(
            finished.error.unwrap_or_else(|| "unknown failure".to_string()),
        )),
        _ => Ok(()),
    }
}

/// validateサブコマンドの実行
///
/// 設定ファイルを読み込み、検証エラーをすべて表示する。
pub fn run_validate(config_path: &Path) -> Result<(), LoadTestError> {
    let config = config::load_from_file(config_path)?;
    match config.validate() {
        Ok(()) => {
            println!("Configuration OK");
            Ok(())
        }
        Err(problems) => {
            for problem in &problems {
                eprintln!("  - {}", problem);
            }
            Err(LoadTestError::ConfigError(format!(
                "{} validation error(s)",
                problems.len()
            )))
        }
    }
}

fn write_json_result(info: &JobInfo, path: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(info).context("serialize job result")?;
    std::fs::write(path, json)
        .with_context(|| format!("write result file '{}'", path.display()))?;
    Ok(())
}
