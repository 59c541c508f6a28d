use anyhow::{Context, Result};
use bucketsync_lib::core::EtagHasher;
use bucketsync_lib::storage::s3::PART_SIZE;
use bucketsync_lib::storage::{LocalSource, S3ObjectStore};
use bucketsync_lib::{logging, SyncConfig, SyncEngine};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// 将源目录增量同步到对象存储，支持断点续传
#[derive(Debug, Parser)]
#[command(name = "bucketsync", version)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long)]
    config: PathBuf,

    /// 并发上传数，覆盖配置文件中的 worker
    #[arg(short, long)]
    worker: Option<usize>,

    /// 忽略已有快照，重新扫描源目录
    #[arg(long)]
    rescan: bool,
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = SyncConfig::load(&cli.config)?;
    if let Some(worker) = cli.worker {
        config.worker = worker;
    }
    config.rescan_local |= cli.rescan;
    config.validate()?;

    let job_dir = config.job_dir();
    logging::init(
        &config.log,
        &job_dir.join(format!("{}.log", config.job_id())),
    )?;

    let source = LocalSource::new(&config.src_dir)?;
    let dest = S3ObjectStore::new(
        &config.bucket,
        &config.region,
        &config.access_key,
        &config.secret_key,
        config.endpoint.clone(),
        &config.upload_policy(),
    )?;

    let engine = SyncEngine::new(
        config,
        Arc::new(source),
        Arc::new(dest),
        Arc::new(EtagHasher::new(PART_SIZE)),
    )?;
    let report = engine.run().await?;

    tracing::info!(
        "{}",
        serde_json::to_string(&report).context("序列化同步报告失败")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("同步失败: {:#}", e);
            eprintln!("同步失败: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
