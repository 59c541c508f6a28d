//! 源文件快照缓存
//!
//! 完整扫描源目录，按行写入 `path\tsize\tmodTime`。先写临时文件再重命名，
//! 扫描中途失败不会破坏上一次的快照。再次运行时直接复用，不再访问源存储。

use crate::storage::{SourceListing, SourceStore};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tracing::{debug, info, warn};

/// 源文件条目（只包含普通文件，目录会被递归展开）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub source_path: String,
    pub size: u64,
    /// 修改时间（毫秒时间戳）
    pub mod_time: i64,
}

impl SourceEntry {
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn to_line(&self) -> String {
        format!("{}\t{}\t{}\n", self.source_path, self.size, self.mod_time)
    }

    /// 解析一行快照，从右侧切分，路径中包含 tab 也能正确解析
    fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim_end_matches('\r');
        let mut fields = line.rsplitn(3, '\t');
        let mod_time = fields.next()?.trim().parse().ok()?;
        let size = fields.next()?.trim().parse().ok()?;
        let source_path = fields.next()?;
        if source_path.is_empty() {
            return None;
        }
        Some(Self {
            source_path: source_path.to_string(),
            size,
            mod_time,
        })
    }
}

impl From<SourceListing> for SourceEntry {
    fn from(listing: SourceListing) -> Self {
        Self {
            source_path: listing.path,
            size: listing.size,
            mod_time: listing.mod_time,
        }
    }
}

/// 快照来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOrigin {
    /// 复用已有快照
    Reused,
    /// 重新扫描，包含写入的文件数
    Rescanned(u64),
}

/// 快照缓存管理器
pub struct SnapshotCache {
    cache_path: PathBuf,
    temp_path: PathBuf,
}

impl SnapshotCache {
    pub fn new(cache_path: PathBuf) -> Self {
        let mut temp = cache_path.clone().into_os_string();
        temp.push(".temp");
        Self {
            cache_path,
            temp_path: PathBuf::from(temp),
        }
    }

    pub fn path(&self) -> &Path {
        &self.cache_path
    }

    pub fn exists(&self) -> bool {
        self.cache_path.is_file()
    }

    /// 快照不存在或要求重新扫描时重新扫描，否则直接复用
    pub async fn ensure(
        &self,
        source: &dyn SourceStore,
        root: &str,
        force_rescan: bool,
    ) -> Result<SnapshotOrigin> {
        if self.exists() && !force_rescan {
            info!("复用已有快照: {:?}", self.cache_path);
            return Ok(SnapshotOrigin::Reused);
        }

        if force_rescan {
            info!("要求重新扫描源目录: {}", root);
        }
        let count = self.scan(source, root).await?;
        Ok(SnapshotOrigin::Rescanned(count))
    }

    /// 扫描源目录并原子替换快照，返回文件数
    pub async fn scan(&self, source: &dyn SourceStore, root: &str) -> Result<u64> {
        info!("开始扫描源存储: {}, 目录: {}", source.name(), root);

        let file = File::create(&self.temp_path)
            .await
            .with_context(|| format!("创建临时快照失败: {:?}", self.temp_path))?;
        let mut writer = BufWriter::new(file);

        let written = async {
            let count = self.write_entries(source, root, &mut writer).await?;
            writer.flush().await.context("写入快照失败")?;
            writer.get_ref().sync_all().await.context("同步快照失败")?;
            Ok::<_, anyhow::Error>(count)
        }
        .await;
        drop(writer);

        let committed = match written {
            Ok(count) => fs::rename(&self.temp_path, &self.cache_path)
                .await
                .with_context(|| format!("重命名快照失败: {:?}", self.cache_path))
                .map(|_| count),
            Err(e) => Err(e),
        };
        let count = match committed {
            Ok(count) => count,
            Err(e) => {
                let _ = fs::remove_file(&self.temp_path).await;
                return Err(e);
            }
        };

        info!("扫描完成: {} 个文件，快照 {:?}", count, self.cache_path);
        Ok(count)
    }

    /// 深度优先遍历，按源存储的列表顺序写入
    async fn write_entries(
        &self,
        source: &dyn SourceStore,
        root: &str,
        writer: &mut BufWriter<File>,
    ) -> Result<u64> {
        let mut stack = vec![source.list(root).await?.into_iter()];
        let mut count = 0u64;

        loop {
            let next = match stack.last_mut() {
                Some(listings) => listings.next(),
                None => break,
            };
            let Some(listing) = next else {
                stack.pop();
                continue;
            };

            if listing.is_dir {
                let children = source.list(&listing.path).await?;
                stack.push(children.into_iter());
                continue;
            }

            if listing.path.contains('\n') {
                warn!("路径包含换行符，无法写入快照: {:?}", listing.path);
                continue;
            }

            let entry = SourceEntry::from(listing);
            writer.write_all(entry.to_line().as_bytes()).await?;
            count += 1;
            if count % 100_000 == 0 {
                debug!("已扫描 {} 个文件", count);
            }
        }

        Ok(count)
    }

    /// 打开快照逐行读取
    pub async fn open(&self) -> Result<SnapshotReader> {
        let file = File::open(&self.cache_path)
            .await
            .with_context(|| format!("打开快照失败: {:?}", self.cache_path))?;
        Ok(SnapshotReader {
            lines: BufReader::new(file).lines(),
            line_no: 0,
        })
    }
}

/// 快照读取器
pub struct SnapshotReader {
    lines: Lines<BufReader<File>>,
    line_no: u64,
}

impl SnapshotReader {
    /// 读取下一条记录，格式错误的行会被跳过
    pub async fn next_entry(&mut self) -> Result<Option<SourceEntry>> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_no += 1;
            match SourceEntry::parse_line(&line) {
                Some(entry) => return Ok(Some(entry)),
                None if line.trim().is_empty() => {}
                None => warn!("快照第 {} 行格式错误，已跳过: {:?}", self.line_no, line),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemorySource;
    use std::sync::atomic::Ordering;

    fn sample_source() -> MemorySource {
        let source = MemorySource::new();
        source.add_file("/data/a.txt", b"0123456789", 100);
        source.add_file("/data/sub/b.txt", b"", 200);
        source.add_file("/data/sub/deep/c.bin", b"abc", 300);
        source.add_file("/other/x.txt", b"x", 1);
        source
    }

    async fn read_all(cache: &SnapshotCache) -> Vec<SourceEntry> {
        let mut reader = cache.open().await.unwrap();
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await.unwrap() {
            entries.push(entry);
        }
        entries
    }

    #[tokio::test]
    async fn test_scan_flattens_tree() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SnapshotCache::new(dir.path().join("job.cache"));
        let source = sample_source();

        let count = cache.scan(&source, "/data").await.unwrap();
        assert_eq!(count, 3);

        let content = std::fs::read_to_string(cache.path()).unwrap();
        assert_eq!(
            content,
            "/data/a.txt\t10\t100\n/data/sub/b.txt\t0\t200\n/data/sub/deep/c.bin\t3\t300\n"
        );
        assert!(!dir.path().join("job.cache.temp").exists());

        let entries = read_all(&cache).await;
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[0],
            SourceEntry {
                source_path: "/data/a.txt".to_string(),
                size: 10,
                mod_time: 100,
            }
        );
        assert!(entries[1].is_empty());
    }

    #[tokio::test]
    async fn test_ensure_reuses_without_listing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SnapshotCache::new(dir.path().join("job.cache"));
        let source = sample_source();

        let origin = cache.ensure(&source, "/data", false).await.unwrap();
        assert_eq!(origin, SnapshotOrigin::Rescanned(3));
        let lists = source.lists.load(Ordering::SeqCst);

        // 源不可用也不影响复用
        source.set_fail_list(true);
        let origin = cache.ensure(&source, "/data", false).await.unwrap();
        assert_eq!(origin, SnapshotOrigin::Reused);
        assert_eq!(source.lists.load(Ordering::SeqCst), lists);
        assert_eq!(read_all(&cache).await.len(), 3);
    }

    #[tokio::test]
    async fn test_force_rescan_replaces_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SnapshotCache::new(dir.path().join("job.cache"));
        let source = sample_source();
        cache.ensure(&source, "/data", false).await.unwrap();

        source.add_file("/data/new.txt", b"new", 400);
        assert_eq!(
            cache.ensure(&source, "/data", false).await.unwrap(),
            SnapshotOrigin::Reused
        );
        assert_eq!(
            cache.ensure(&source, "/data", true).await.unwrap(),
            SnapshotOrigin::Rescanned(4)
        );
        assert_eq!(read_all(&cache).await.len(), 4);
    }

    #[tokio::test]
    async fn test_failed_scan_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SnapshotCache::new(dir.path().join("job.cache"));
        let source = sample_source();
        cache.scan(&source, "/data").await.unwrap();
        let before = std::fs::read_to_string(cache.path()).unwrap();

        source.set_fail_list(true);
        assert!(cache.ensure(&source, "/data", true).await.is_err());

        assert_eq!(std::fs::read_to_string(cache.path()).unwrap(), before);
        assert!(!dir.path().join("job.cache.temp").exists());
    }

    #[tokio::test]
    async fn test_failed_rename_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("job.cache");
        // 快照路径被非空目录占用，重命名失败
        std::fs::create_dir(&cache_path).unwrap();
        std::fs::write(cache_path.join("keep"), "x").unwrap();
        let cache = SnapshotCache::new(cache_path);

        assert!(cache.scan(&sample_source(), "/data").await.is_err());
        assert!(!dir.path().join("job.cache.temp").exists());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_failed_flush_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("job.cache.temp");
        // 写入 /dev/full 时 flush 返回 ENOSPC
        std::os::unix::fs::symlink("/dev/full", &temp).unwrap();
        let cache = SnapshotCache::new(dir.path().join("job.cache"));

        assert!(cache.scan(&sample_source(), "/data").await.is_err());
        assert!(std::fs::symlink_metadata(&temp).is_err());
        assert!(!cache.exists());
    }

    #[tokio::test]
    async fn test_interrupted_temp_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SnapshotCache::new(dir.path().join("job.cache"));
        let source = sample_source();
        cache.scan(&source, "/data").await.unwrap();

        // 模拟扫描写完临时文件后、重命名前进程退出
        std::fs::write(dir.path().join("job.cache.temp"), "/data/partial\t1\t1\n/data/trunc").unwrap();

        source.set_fail_list(true);
        assert_eq!(
            cache.ensure(&source, "/data", false).await.unwrap(),
            SnapshotOrigin::Reused
        );
        let entries = read_all(&cache).await;
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.source_path != "/data/partial"));
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SnapshotCache::new(dir.path().join("job.cache"));
        std::fs::write(
            cache.path(),
            "/data/ok\t1\t2\nbroken line\n/data/bad\tx\t3\n\n/data/with\ttab\t4\t5\n",
        )
        .unwrap();

        let entries = read_all(&cache).await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].source_path, "/data/ok");
        assert_eq!(entries[1].source_path, "/data/with\ttab");
        assert_eq!(entries[1].size, 4);
        assert_eq!(entries[1].mod_time, 5);
    }
}
