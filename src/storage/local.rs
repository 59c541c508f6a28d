use super::{SourceListing, SourceReader, SourceStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tokio::fs;
use tracing::{debug, warn};

/// 本地（或挂载的）文件系统源
pub struct LocalSource {
    name: String,
}

impl LocalSource {
    pub fn new(root: &str) -> Result<Self> {
        let base_path = Path::new(root);
        if !base_path.is_dir() {
            anyhow::bail!("源目录不存在或不是文件夹: {}", root);
        }
        Ok(Self {
            name: format!("local:{}", root),
        })
    }

    /// 修改时间转换为毫秒时间戳
    fn mod_time_millis(metadata: &std::fs::Metadata) -> i64 {
        metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_millis() as i64)
    }
}

#[async_trait]
impl SourceStore for LocalSource {
    async fn list(&self, path: &str) -> Result<Vec<SourceListing>> {
        let mut dir = fs::read_dir(path)
            .await
            .with_context(|| format!("读取目录失败: {}", path))?;

        let mut listings = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .with_context(|| format!("遍历目录失败: {}", path))?
        {
            let entry_path = entry.path();
            let metadata = entry
                .metadata()
                .await
                .with_context(|| format!("读取元数据失败: {:?}", entry_path))?;

            let file_type = metadata.file_type();
            if !file_type.is_dir() && !file_type.is_file() {
                // 符号链接、管道等不参与同步
                debug!("跳过非普通文件: {:?}", entry_path);
                continue;
            }

            let Some(path_str) = entry_path.to_str() else {
                warn!("跳过非 UTF-8 路径: {:?}", entry_path);
                continue;
            };

            listings.push(SourceListing {
                path: path_str.to_string(),
                is_dir: file_type.is_dir(),
                size: if file_type.is_dir() { 0 } else { metadata.len() },
                mod_time: Self::mod_time_millis(&metadata),
            });
        }

        // read_dir 的顺序依赖文件系统，排序后保证同一目录的扫描结果稳定
        listings.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(listings)
    }

    async fn open(&self, path: &str) -> std::io::Result<SourceReader> {
        let file = fs::File::open(path).await?;
        Ok(Box::new(file))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
