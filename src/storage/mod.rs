pub mod local;
pub mod s3;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;

pub use local::LocalSource;
pub use s3::S3ObjectStore;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 源文件读取流
pub type SourceReader = Box<dyn AsyncRead + Send + Unpin>;

/// 源存储列表项（单层）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceListing {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    /// 修改时间（毫秒时间戳）
    pub mod_time: i64,
}

/// 源存储抽象接口
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// 列出目录下的直接子项，顺序在同一次运行内保持稳定
    async fn list(&self, path: &str) -> anyhow::Result<Vec<SourceListing>>;

    /// 打开文件读取流
    async fn open(&self, path: &str) -> std::io::Result<SourceReader>;

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 目标对象元数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    /// 内容哈希（与 ContentHasher 的输出直接可比）
    pub content_hash: Option<String>,
}

/// 上传策略
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPolicy {
    /// 存储类型：0 标准存储，1 低频存储
    pub file_type: u8,
}

/// 上传凭证
///
/// 指定 key 的凭证允许覆盖该 key；只有 bucket 的凭证为仅新增模式，
/// 目标已存在时上传失败并返回 [`StoreError::Exists`]。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadToken {
    pub bucket: String,
    pub key: Option<String>,
    /// 过期时间（秒级时间戳）
    pub deadline: i64,
    pub policy: UploadPolicy,
}

impl UploadToken {
    pub fn insert_only(&self) -> bool {
        self.key.is_none()
    }

    pub fn is_expired(&self) -> bool {
        chrono::Utc::now().timestamp() >= self.deadline
    }

    /// 检查凭证是否可用于上传指定 key
    pub fn authorize(&self, key: &str) -> Result<(), StoreError> {
        if self.is_expired() {
            return Err(StoreError::Unauthorized(format!(
                "上传凭证已过期 (deadline={})",
                self.deadline
            )));
        }
        match &self.key {
            Some(scoped) if scoped != key => Err(StoreError::Unauthorized(format!(
                "上传凭证限定 key 为 {}，实际为 {}",
                scoped, key
            ))),
            _ => Ok(()),
        }
    }
}

/// 上传内容
pub enum UploadBody {
    /// 空文件，直接上传 0 字节对象
    Empty,
    /// 流式上传
    Stream { reader: SourceReader, size: u64 },
}

/// 目标存储错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("对象不存在: {0}")]
    NotFound(String),

    #[error("鉴权失败: {0}")]
    Unauthorized(String),

    #[error("对象已存在且上传凭证不允许覆盖: {0}")]
    Exists(String),

    #[error("读取源数据失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("存储服务错误: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// 目标对象存储抽象接口
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// 获取对象元数据，不存在时返回 [`StoreError::NotFound`]
    async fn stat(&self, key: &str) -> Result<ObjectMeta, StoreError>;

    /// 签发上传凭证，key 为 None 时为仅新增模式
    async fn upload_token(
        &self,
        key: Option<&str>,
        ttl: Duration,
        policy: &UploadPolicy,
    ) -> Result<UploadToken, StoreError>;

    /// 上传对象
    async fn put(&self, token: &UploadToken, key: &str, body: UploadBody) -> Result<(), StoreError>;

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}
