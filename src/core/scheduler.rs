//! 传输调度 - 固定数量的 worker 从任务队列取任务上传

use super::engine::SyncError;
use super::record::RecordStore;
use super::snapshot::SourceEntry;
use crate::storage::{ObjectStore, SourceStore, StoreError, UploadBody, UploadToken};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// 汇总中最多保留的错误条数
const MAX_REPORTED_ERRORS: usize = 100;

/// 单个上传任务，由一个 worker 消费一次
#[derive(Debug)]
pub struct SyncJob {
    pub entry: SourceEntry,
    pub key: String,
    pub record_key: String,
    pub token: UploadToken,
}

/// worker 共享的依赖
#[derive(Clone)]
pub struct TransferContext {
    pub source: Arc<dyn SourceStore>,
    pub dest: Arc<dyn ObjectStore>,
    pub records: Arc<dyn RecordStore>,
}

/// 单个任务的失败原因，在任务边界处理，不影响其他任务
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("签发上传凭证失败: {0}")]
    Token(StoreError),

    #[error("打开源文件失败: {0}")]
    Open(std::io::Error),

    #[error("上传失败: {0}")]
    Upload(StoreError),

    #[error("写入上传记录失败: {0:#}")]
    Record(anyhow::Error),
}

/// 单个任务的结果
#[derive(Debug)]
pub struct TransferOutcome {
    pub source_path: String,
    pub key: String,
    pub size: u64,
    pub result: Result<Duration, TransferError>,
}

/// 传输汇总
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub bytes_uploaded: u64,
    pub errors: Vec<String>,
}

impl TransferSummary {
    /// 计入一个失败（包括未进入队列的任务）
    pub fn record_failure(&mut self, source_path: &str, key: &str, err: &TransferError) {
        self.failed += 1;
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push(format!("{} -> {}: {}", source_path, key, err));
        }
    }

    fn record(&mut self, outcome: &TransferOutcome) {
        match &outcome.result {
            Ok(_) => {
                self.succeeded += 1;
                self.bytes_uploaded += outcome.size;
            }
            Err(e) => self.record_failure(&outcome.source_path, &outcome.key, e),
        }
    }
}

/// 传输调度器
pub struct TransferScheduler {
    job_tx: mpsc::UnboundedSender<SyncJob>,
    workers: JoinSet<()>,
    collector: JoinHandle<TransferSummary>,
    submitted: u64,
}

impl TransferScheduler {
    /// 启动 workers 个 worker（至少一个）
    pub fn start(workers: usize, ctx: TransferContext) -> Self {
        let workers = workers.max(1);
        let (job_tx, job_rx) = mpsc::unbounded_channel::<SyncJob>();
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<TransferOutcome>();
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut handles = JoinSet::new();
        for id in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let ctx = ctx.clone();
            handles.spawn(async move { worker_loop(id, job_rx, result_tx, ctx).await });
        }
        drop(result_tx);

        let collector = tokio::spawn(async move {
            let mut summary = TransferSummary::default();
            while let Some(outcome) = result_rx.recv().await {
                summary.record(&outcome);
            }
            summary
        });

        debug!("启动 {} 个上传 worker", workers);
        Self {
            job_tx,
            workers: handles,
            collector,
            submitted: 0,
        }
    }

    /// 提交任务
    pub fn submit(&mut self, job: SyncJob) -> Result<(), SyncError> {
        self.job_tx
            .send(job)
            .map_err(|_| SyncError::SchedulerClosed)?;
        self.submitted += 1;
        Ok(())
    }

    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    /// 关闭任务队列，等待所有任务完成
    ///
    /// 超过 ceiling 时取消所有 worker，未完成的任务不会写入上传记录。
    pub async fn finish(self, ceiling: Duration) -> Result<TransferSummary, SyncError> {
        let Self {
            job_tx,
            mut workers,
            collector,
            submitted,
        } = self;
        drop(job_tx);

        info!("任务已全部提交 ({} 个)，等待上传完成", submitted);
        let drained = tokio::time::timeout(ceiling, async {
            while let Some(result) = workers.join_next().await {
                if let Err(e) = result {
                    error!("上传 worker 异常退出: {}", e);
                }
            }
        })
        .await;

        if drained.is_err() {
            error!("等待上传完成超时 ({:?})，取消 {} 个 worker", ceiling, workers.len());
            workers.abort_all();
            while workers.join_next().await.is_some() {}
            collector.abort();
            let _ = collector.await;
            return Err(SyncError::DrainTimeout(ceiling));
        }

        let mut summary = match collector.await {
            Ok(summary) => summary,
            Err(e) => {
                error!("汇总上传结果失败: {}", e);
                TransferSummary::default()
            }
        };

        summary.submitted = submitted;
        let finished = summary.succeeded + summary.failed;
        if finished < submitted {
            warn!("{} 个任务没有返回结果", submitted - finished);
            summary.failed += submitted - finished;
        }
        Ok(summary)
    }
}

async fn worker_loop(
    id: usize,
    job_rx: Arc<Mutex<mpsc::UnboundedReceiver<SyncJob>>>,
    result_tx: mpsc::UnboundedSender<TransferOutcome>,
    ctx: TransferContext,
) {
    loop {
        let job = {
            let mut rx = job_rx.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            break;
        };

        let outcome = transfer(&ctx, job).await;
        if result_tx.send(outcome).is_err() {
            break;
        }
    }
    debug!("上传 worker {} 退出", id);
}

/// 执行单个任务，成功后才写入上传记录
async fn transfer(ctx: &TransferContext, job: SyncJob) -> TransferOutcome {
    let SyncJob {
        entry,
        key,
        record_key,
        token,
    } = job;

    info!("开始上传: {} -> {}", entry.source_path, key);
    let start = Instant::now();
    let result = upload(ctx, &entry, &key, &record_key, &token)
        .await
        .map(|_| start.elapsed());

    match &result {
        Ok(elapsed) => info!(
            "上传成功: {} -> {}, 耗时 {:.2}s",
            entry.source_path,
            key,
            elapsed.as_secs_f64()
        ),
        Err(e) => error!("上传失败: {} -> {}: {}", entry.source_path, key, e),
    }

    TransferOutcome {
        source_path: entry.source_path,
        key,
        size: entry.size,
        result,
    }
}

async fn upload(
    ctx: &TransferContext,
    entry: &SourceEntry,
    key: &str,
    record_key: &str,
    token: &UploadToken,
) -> Result<(), TransferError> {
    let body = if entry.is_empty() {
        UploadBody::Empty
    } else {
        let reader = ctx
            .source
            .open(&entry.source_path)
            .await
            .map_err(TransferError::Open)?;
        UploadBody::Stream {
            reader,
            size: entry.size,
        }
    };

    ctx.dest
        .put(token, key, body)
        .await
        .map_err(TransferError::Upload)?;

    ctx.records
        .put(record_key, entry.mod_time)
        .await
        .map_err(TransferError::Record)
}
