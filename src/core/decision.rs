//! 同步决策 - 逐个文件判断跳过还是上传

use super::filter::{SkipRule, SkipRules};
use super::hash::ContentHasher;
use super::key::KeyMapper;
use super::record::RecordStore;
use super::snapshot::SourceEntry;
use crate::storage::{ObjectStore, SourceStore};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 校验策略，运行期间只使用其中一种
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStrategy {
    /// 对比本地上传记录中的修改时间
    LocalRecord,
    /// 对比目标对象大小
    RemoteSize,
    /// 对比目标对象内容哈希
    RemoteHash,
}

impl fmt::Display for VerifyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyStrategy::LocalRecord => write!(f, "本地记录"),
            VerifyStrategy::RemoteSize => write!(f, "远程大小"),
            VerifyStrategy::RemoteHash => write!(f, "远程哈希"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    EmptyFile,
    Rule(SkipRule),
    Unchanged,
    SameSize,
    SameHash,
    OverwriteDisabled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::EmptyFile => write!(f, "空文件"),
            SkipReason::Rule(rule) => write!(f, "匹配跳过规则({})", rule),
            SkipReason::Unchanged => write!(f, "本地记录未变化"),
            SkipReason::SameSize => write!(f, "目标大小一致"),
            SkipReason::SameHash => write!(f, "目标哈希一致"),
            SkipReason::OverwriteDisabled => write!(f, "已变化但未开启覆盖"),
        }
    }
}

impl SkipReason {
    /// 跳过日志的级别，只有本地记录未变化的文件按 debug 记录
    pub fn log_level(&self) -> tracing::Level {
        match self {
            SkipReason::Unchanged => tracing::Level::DEBUG,
            SkipReason::OverwriteDisabled => tracing::Level::WARN,
            _ => tracing::Level::INFO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadReason {
    New,
    Changed,
    /// 校验过程出错，按需要上传处理
    VerifyFailed,
}

impl fmt::Display for UploadReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadReason::New => write!(f, "新文件"),
            UploadReason::Changed => write!(f, "文件已变化"),
            UploadReason::VerifyFailed => write!(f, "校验失败"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Skip(SkipReason),
    Upload(UploadReason),
}

impl Decision {
    pub fn is_upload(&self) -> bool {
        matches!(self, Decision::Upload(_))
    }
}

/// 文件对应的目标 key 和记录 key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub key: String,
    pub record_key: String,
}

/// 决策参数
#[derive(Debug, Clone, Copy)]
pub struct DecisionPolicy {
    pub strategy: VerifyStrategy,
    pub overwrite: bool,
    pub skip_empty_file: bool,
}

/// 同步决策引擎
pub struct DecisionEngine {
    rules: SkipRules,
    mapper: KeyMapper,
    policy: DecisionPolicy,
    source: Arc<dyn SourceStore>,
    dest: Arc<dyn ObjectStore>,
    hasher: Arc<dyn ContentHasher>,
    records: Arc<dyn RecordStore>,
}

impl DecisionEngine {
    pub fn new(
        rules: SkipRules,
        mapper: KeyMapper,
        policy: DecisionPolicy,
        source: Arc<dyn SourceStore>,
        dest: Arc<dyn ObjectStore>,
        hasher: Arc<dyn ContentHasher>,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            rules,
            mapper,
            policy,
            source,
            dest,
            hasher,
            records,
        }
    }

    pub fn strategy(&self) -> VerifyStrategy {
        self.policy.strategy
    }

    pub fn target(&self, entry: &SourceEntry) -> Target {
        let rel = self.mapper.relative_path(&entry.source_path);
        let key = self.mapper.destination_key(rel);
        let record_key = KeyMapper::record_key(&entry.source_path, &key);
        Target { key, record_key }
    }

    /// 判断一个文件是否需要上传，并记录原因
    pub async fn decide(&self, entry: &SourceEntry, target: &Target) -> Decision {
        let decision = self.evaluate(entry, target).await;
        match decision {
            Decision::Upload(reason) => {
                info!("需要上传 [{}]: {} -> {}", reason, entry.source_path, target.key)
            }
            Decision::Skip(SkipReason::OverwriteDisabled) => warn!(
                "目标已变化但未开启覆盖，跳过: {} -> {}",
                entry.source_path, target.key
            ),
            Decision::Skip(reason) if reason.log_level() == tracing::Level::DEBUG => {
                debug!("跳过 [{}]: {}", reason, entry.source_path)
            }
            Decision::Skip(reason) => info!("跳过 [{}]: {}", reason, entry.source_path),
        }
        decision
    }

    async fn evaluate(&self, entry: &SourceEntry, target: &Target) -> Decision {
        if entry.is_empty() && self.policy.skip_empty_file {
            return Decision::Skip(SkipReason::EmptyFile);
        }

        let rel = self.mapper.relative_path(&entry.source_path);
        if let Some(rule) = self.rules.match_rule(rel) {
            return Decision::Skip(SkipReason::Rule(rule));
        }

        match self.policy.strategy {
            VerifyStrategy::LocalRecord => self.check_record(entry, target).await,
            VerifyStrategy::RemoteSize | VerifyStrategy::RemoteHash => {
                self.check_remote(entry, target).await
            }
        }
    }

    async fn check_record(&self, entry: &SourceEntry, target: &Target) -> Decision {
        match self.records.get(&target.record_key).await {
            Ok(None) => Decision::Upload(UploadReason::New),
            Ok(Some(mod_time)) if mod_time == entry.mod_time => {
                Decision::Skip(SkipReason::Unchanged)
            }
            Ok(Some(_)) => self.changed(),
            Err(e) => {
                error!("读取上传记录失败，按需要上传处理: {} - {:#}", target.record_key, e);
                Decision::Upload(UploadReason::VerifyFailed)
            }
        }
    }

    async fn check_remote(&self, entry: &SourceEntry, target: &Target) -> Decision {
        let meta = match self.dest.stat(&target.key).await {
            Ok(meta) => meta,
            Err(e) if e.is_not_found() => return Decision::Upload(UploadReason::New),
            Err(e) => {
                warn!("获取目标信息失败，按需要上传处理: {} - {}", target.key, e);
                return Decision::Upload(UploadReason::VerifyFailed);
            }
        };

        if self.policy.strategy == VerifyStrategy::RemoteSize {
            return if meta.size == entry.size {
                Decision::Skip(SkipReason::SameSize)
            } else {
                self.changed()
            };
        }

        let Some(remote_hash) = meta.content_hash else {
            warn!("目标未返回内容哈希，按需要上传处理: {}", target.key);
            return Decision::Upload(UploadReason::VerifyFailed);
        };

        let local_hash = match self.source.open(&entry.source_path).await {
            Ok(reader) => self.hasher.hash(reader, entry.size).await,
            Err(e) => Err(e),
        };
        match local_hash {
            Ok(hash) if hash == remote_hash => Decision::Skip(SkipReason::SameHash),
            Ok(hash) => {
                debug!("哈希不一致: {} 本地 {} 目标 {}", entry.source_path, hash, remote_hash);
                self.changed()
            }
            Err(e) => {
                error!("计算文件哈希失败，按需要上传处理: {} - {}", entry.source_path, e);
                Decision::Upload(UploadReason::VerifyFailed)
            }
        }
    }

    fn changed(&self) -> Decision {
        if self.policy.overwrite {
            Decision::Upload(UploadReason::Changed)
        } else {
            Decision::Skip(SkipReason::OverwriteDisabled)
        }
    }
}
