//! 同步配置 - JSON 配置文件，字段均有默认值

use crate::core::decision::VerifyStrategy;
use crate::core::filter::SkipRules;
use crate::core::key::KeyMapper;
use crate::logging::LogConfig;
use crate::storage::UploadPolicy;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 同步任务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// 源目录
    #[serde(default)]
    pub src_dir: String,
    /// 目标 bucket
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// 自定义上传域名
    #[serde(default)]
    pub endpoint: Option<String>,
    /// 并发上传数
    #[serde(default = "default_worker")]
    pub worker: usize,
    /// 忽略已有快照，重新扫描源目录
    #[serde(default)]
    pub rescan_local: bool,
    #[serde(default)]
    pub skip_empty_file: bool,
    #[serde(default)]
    pub skip_file_prefixes: String,
    #[serde(default)]
    pub skip_path_prefixes: String,
    #[serde(default)]
    pub skip_suffixes: String,
    #[serde(default)]
    pub skip_fixed_strings: String,
    /// 只用文件名作为 key，不保留目录结构
    #[serde(default)]
    pub ignore_dir: bool,
    #[serde(default)]
    pub key_prefix: String,
    /// 目标已存在且内容变化时是否覆盖
    #[serde(default)]
    pub overwrite: bool,
    /// 通过目标存储判断是否需要上传
    #[serde(default)]
    pub check_exists: bool,
    /// 与 checkExists 一起使用，对比内容哈希而不是大小
    #[serde(default)]
    pub check_hash: bool,
    /// 存储类型：0 标准存储，1 低频存储
    #[serde(default)]
    pub file_type: u8,
    /// 快照、上传记录和日志所在目录
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_worker() -> usize {
    4
}

fn default_data_dir() -> PathBuf {
    crate::dirs::config_dir()
        .map(|p| p.join("bucketsync"))
        .unwrap_or_else(|| PathBuf::from(".bucketsync"))
}

impl SyncConfig {
    /// 读取并校验配置文件
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {:?}", path))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.src_dir.trim().is_empty() {
            bail!("srcDir 不能为空");
        }
        if self.bucket.trim().is_empty() {
            bail!("bucket 不能为空");
        }
        if self.worker == 0 {
            bail!("worker 必须大于 0");
        }
        if self.file_type > 1 {
            bail!("fileType 只能为 0 或 1，实际为 {}", self.file_type);
        }
        Ok(())
    }

    /// 根据 checkExists / checkHash 选择校验策略
    pub fn verify_strategy(&self) -> VerifyStrategy {
        match (self.check_exists, self.check_hash) {
            (false, true) => {
                tracing::warn!("checkHash 需要同时开启 checkExists，将使用本地记录校验");
                VerifyStrategy::LocalRecord
            }
            (false, false) => VerifyStrategy::LocalRecord,
            (true, false) => VerifyStrategy::RemoteSize,
            (true, true) => VerifyStrategy::RemoteHash,
        }
    }

    /// 任务标识，由源目录和 bucket 决定
    pub fn job_id(&self) -> String {
        let hash = blake3::hash(format!("{}:{}", self.src_dir, self.bucket).as_bytes());
        hash.to_hex()[..32].to_string()
    }

    /// 任务目录 `<dataDir>/<jobId>/`
    pub fn job_dir(&self) -> PathBuf {
        self.data_dir.join(self.job_id())
    }

    pub fn skip_rules(&self) -> SkipRules {
        SkipRules::new(
            &self.skip_file_prefixes,
            &self.skip_path_prefixes,
            &self.skip_suffixes,
            &self.skip_fixed_strings,
        )
    }

    pub fn key_mapper(&self) -> KeyMapper {
        KeyMapper::new(&self.src_dir, self.ignore_dir, &self.key_prefix)
    }

    pub fn upload_policy(&self) -> UploadPolicy {
        UploadPolicy {
            file_type: self.file_type,
        }
    }
}
