use crate::config::SyncConfig;
use crate::core::decision::{Decision, DecisionEngine, DecisionPolicy, SkipReason};
use crate::core::hash::ContentHasher;
use crate::core::record::{RecordStore, SqliteRecordStore};
use crate::core::scheduler::{
    SyncJob, TransferContext, TransferError, TransferScheduler, TransferSummary,
};
use crate::core::snapshot::{SnapshotCache, SnapshotOrigin};
use crate::storage::{ObjectStore, SourceStore, UploadPolicy, UploadToken};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

// ============ 公共常量 ============

/// 等待上传全部完成的最长时间
pub const DRAIN_CEILING: Duration = Duration::from_secs(10 * 3600);
/// 上传凭证有效期
pub const UPLOAD_TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// 导致整个任务失败的错误
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("配置无效: {0:#}")]
    Config(anyhow::Error),

    #[error("创建任务目录失败: {path:?}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("生成源文件快照失败: {0:#}")]
    Snapshot(anyhow::Error),

    #[error("打开上传记录失败: {0:#}")]
    RecordStore(anyhow::Error),

    #[error("上传队列已关闭")]
    SchedulerClosed,

    #[error("等待上传完成超时 ({0:?})")]
    DrainTimeout(Duration),
}

/// 跳过统计（按原因）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkipStats {
    pub empty_file: u64,
    pub rule: u64,
    pub unchanged: u64,
    pub same_size: u64,
    pub same_hash: u64,
    pub overwrite_disabled: u64,
}

impl SkipStats {
    fn record(&mut self, reason: SkipReason) {
        let counter = match reason {
            SkipReason::EmptyFile => &mut self.empty_file,
            SkipReason::Rule(_) => &mut self.rule,
            SkipReason::Unchanged => &mut self.unchanged,
            SkipReason::SameSize => &mut self.same_size,
            SkipReason::SameHash => &mut self.same_hash,
            SkipReason::OverwriteDisabled => &mut self.overwrite_disabled,
        };
        *counter += 1;
    }

    pub fn total(&self) -> u64 {
        self.empty_file
            + self.rule
            + self.unchanged
            + self.same_size
            + self.same_hash
            + self.overwrite_disabled
    }
}

/// 同步报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub job_id: String,
    pub start_time: i64,
    pub end_time: i64,
    /// 本次是否重新扫描了源目录
    pub rescanned: bool,
    pub files_scanned: u64,
    pub skipped: SkipStats,
    pub uploads_succeeded: u64,
    pub uploads_failed: u64,
    pub bytes_uploaded: u64,
    pub duration: f64,
    pub errors: Vec<String>,
}

/// 同步引擎
pub struct SyncEngine {
    config: SyncConfig,
    source: Arc<dyn SourceStore>,
    dest: Arc<dyn ObjectStore>,
    hasher: Arc<dyn ContentHasher>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        source: Arc<dyn SourceStore>,
        dest: Arc<dyn ObjectStore>,
        hasher: Arc<dyn ContentHasher>,
    ) -> Result<Self, SyncError> {
        config.validate().map_err(SyncError::Config)?;
        Ok(Self {
            config,
            source,
            dest,
            hasher,
        })
    }

    /// 运行同步任务
    pub async fn run(&self) -> Result<SyncReport, SyncError> {
        let start_time = chrono::Utc::now().timestamp();
        let started = Instant::now();
        let job_id = self.config.job_id();
        let job_dir = self.config.job_dir();

        info!(
            "开始同步任务: {} ({} -> {}:{})",
            job_id,
            self.config.src_dir,
            self.dest.name(),
            self.config.bucket
        );

        std::fs::create_dir_all(&job_dir).map_err(|source| SyncError::Workspace {
            path: job_dir.clone(),
            source,
        })?;

        let snapshot = SnapshotCache::new(job_dir.join(format!("{}.cache", job_id)));
        let origin = snapshot
            .ensure(self.source.as_ref(), &self.config.src_dir, self.config.rescan_local)
            .await
            .map_err(SyncError::Snapshot)?;

        let records: Arc<dyn RecordStore> = Arc::new(
            SqliteRecordStore::open(&job_dir.join(format!("{}.db", job_id)))
                .await
                .map_err(SyncError::RecordStore)?,
        );

        let decider = DecisionEngine::new(
            self.config.skip_rules(),
            self.config.key_mapper(),
            DecisionPolicy {
                strategy: self.config.verify_strategy(),
                overwrite: self.config.overwrite,
                skip_empty_file: self.config.skip_empty_file,
            },
            self.source.clone(),
            self.dest.clone(),
            self.hasher.clone(),
            records.clone(),
        );
        info!(
            "校验方式: {}, 覆盖: {}, 并发: {}",
            decider.strategy(),
            self.config.overwrite,
            self.config.worker
        );

        let mut scheduler = TransferScheduler::start(
            self.config.worker,
            TransferContext {
                source: self.source.clone(),
                dest: self.dest.clone(),
                records: records.clone(),
            },
        );

        let policy = self.config.upload_policy();
        let mut skipped = SkipStats::default();
        let mut token_failures = TransferSummary::default();
        let mut files_scanned = 0u64;

        // 读取快照出错时先等已提交的任务完成，再返回错误
        let dispatched = async {
            let mut reader = snapshot.open().await?;
            while let Some(entry) = reader.next_entry().await? {
                files_scanned += 1;
                let target = decider.target(&entry);
                match decider.decide(&entry, &target).await {
                    Decision::Skip(reason) => skipped.record(reason),
                    Decision::Upload(_) => {
                        let token = match self.issue_token(&target.key, &policy).await {
                            Ok(token) => token,
                            Err(e) => {
                                error!("上传失败: {} -> {}: {}", entry.source_path, target.key, e);
                                token_failures.record_failure(&entry.source_path, &target.key, &e);
                                continue;
                            }
                        };
                        scheduler.submit(SyncJob {
                            entry,
                            key: target.key,
                            record_key: target.record_key,
                            token,
                        })?;
                    }
                }
            }
            anyhow::Ok(())
        }
        .await;

        let drained = scheduler.finish(DRAIN_CEILING).await;

        if let Err(e) = records.close().await {
            warn!("关闭上传记录失败: {:#}", e);
        }

        if let Err(e) = dispatched {
            error!("读取快照失败: {:#}", e);
            return Err(match e.downcast::<SyncError>() {
                Ok(sync_error) => sync_error,
                Err(e) => SyncError::Snapshot(e),
            });
        }
        let mut summary = drained?;
        summary.failed += token_failures.failed;
        summary.errors.extend(token_failures.errors);

        let report = SyncReport {
            job_id: job_id.clone(),
            start_time,
            end_time: chrono::Utc::now().timestamp(),
            rescanned: matches!(origin, SnapshotOrigin::Rescanned(_)),
            files_scanned,
            skipped,
            uploads_succeeded: summary.succeeded,
            uploads_failed: summary.failed,
            bytes_uploaded: summary.bytes_uploaded,
            duration: started.elapsed().as_secs_f64(),
            errors: summary.errors,
        };

        info!(
            "同步任务完成: {} - 扫描 {}, 跳过 {}, 上传成功 {}, 失败 {}, 耗时 {:.2}s",
            job_id,
            report.files_scanned,
            report.skipped.total(),
            report.uploads_succeeded,
            report.uploads_failed,
            report.duration
        );
        Ok(report)
    }

    /// 覆盖模式签发指定 key 的凭证，否则签发仅新增的凭证
    async fn issue_token(
        &self,
        key: &str,
        policy: &UploadPolicy,
    ) -> Result<UploadToken, TransferError> {
        let scope = self.config.overwrite.then_some(key);
        self.dest
            .upload_token(scope, UPLOAD_TOKEN_TTL, policy)
            .await
            .map_err(TransferError::Token)
    }
}
