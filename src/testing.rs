//! 测试用的内存实现

use crate::core::record::RecordStore;
use crate::storage::{
    ObjectMeta, ObjectStore, SourceListing, SourceReader, SourceStore, StoreError, UploadBody,
    UploadPolicy, UploadToken,
};
use async_trait::async_trait;
use md5::{Digest, Md5};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;

/// 内存源存储
#[derive(Default)]
pub struct MemorySource {
    files: Mutex<BTreeMap<String, (Vec<u8>, i64)>>,
    failing_opens: Mutex<HashSet<String>>,
    fail_list: AtomicBool,
    pub lists: AtomicUsize,
    pub opens: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, path: &str, data: &[u8], mod_time: i64) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), (data.to_vec(), mod_time));
    }

    pub fn fail_open(&self, path: &str) {
        self.failing_opens.lock().unwrap().insert(path.to_string());
    }

    pub fn set_fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SourceStore for MemorySource {
    async fn list(&self, path: &str) -> anyhow::Result<Vec<SourceListing>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        if self.fail_list.load(Ordering::SeqCst) {
            anyhow::bail!("list failed: {}", path);
        }

        let prefix = format!("{}/", path.trim_end_matches('/'));
        let files = self.files.lock().unwrap();
        let mut dirs = BTreeSet::new();
        let mut listings = Vec::new();

        for (file_path, (data, mod_time)) in files.iter() {
            let Some(rest) = file_path.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((child, _)) => {
                    dirs.insert(format!("{}{}", prefix, child));
                }
                None => listings.push(SourceListing {
                    path: file_path.clone(),
                    is_dir: false,
                    size: data.len() as u64,
                    mod_time: *mod_time,
                }),
            }
        }

        listings.extend(dirs.into_iter().map(|dir| SourceListing {
            path: dir,
            is_dir: true,
            size: 0,
            mod_time: 0,
        }));
        listings.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(listings)
    }

    async fn open(&self, path: &str) -> std::io::Result<SourceReader> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_opens.lock().unwrap().contains(path);
        if failing {
            return Err(std::io::Error::other(format!("open failed: {}", path)));
        }
        let files = self.files.lock().unwrap();
        match files.get(path) {
            Some((data, _)) => Ok(Box::new(std::io::Cursor::new(data.clone()))),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                path.to_string(),
            )),
        }
    }

    fn name(&self) -> &str {
        "memory-source"
    }
}

struct StoredObject {
    data: Vec<u8>,
    hash: Option<String>,
}

/// 内存对象存储，记录调用次数，可注入失败
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    failing_puts: Mutex<HashSet<String>>,
    fail_stat: AtomicBool,
    put_delay: Mutex<Duration>,
    pub stats: AtomicUsize,
    pub tokens: AtomicUsize,
    pub puts: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入对象，hash 为 None 时使用内容 MD5
    pub fn insert_object(&self, key: &str, data: &[u8], hash: Option<&str>) {
        let hash = hash
            .map(str::to_string)
            .unwrap_or_else(|| format!("{:x}", Md5::digest(data)));
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                hash: Some(hash),
            },
        );
    }

    /// 模拟不返回内容哈希的对象
    pub fn clear_hash(&self, key: &str) {
        if let Some(object) = self.objects.lock().unwrap().get_mut(key) {
            object.hash = None;
        }
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).map(|o| o.data.clone())
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn fail_put(&self, key: &str) {
        self.failing_puts.lock().unwrap().insert(key.to_string());
    }

    /// 每次上传前等待，模拟慢速上传
    pub fn set_put_delay(&self, delay: Duration) {
        *self.put_delay.lock().unwrap() = delay;
    }

    pub fn set_fail_stat(&self, fail: bool) {
        self.fail_stat.store(fail, Ordering::SeqCst);
    }

    /// 所有远程调用次数
    pub fn calls(&self) -> usize {
        self.stats.load(Ordering::SeqCst)
            + self.tokens.load(Ordering::SeqCst)
            + self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn stat(&self, key: &str) -> Result<ObjectMeta, StoreError> {
        self.stats.fetch_add(1, Ordering::SeqCst);
        if self.fail_stat.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("stat timeout".to_string()));
        }
        let objects = self.objects.lock().unwrap();
        objects
            .get(key)
            .map(|o| ObjectMeta {
                size: o.data.len() as u64,
                content_hash: o.hash.clone(),
            })
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn upload_token(
        &self,
        key: Option<&str>,
        ttl: Duration,
        policy: &UploadPolicy,
    ) -> Result<UploadToken, StoreError> {
        self.tokens.fetch_add(1, Ordering::SeqCst);
        Ok(UploadToken {
            bucket: "memory".to_string(),
            key: key.map(str::to_string),
            deadline: chrono::Utc::now().timestamp() + ttl.as_secs() as i64,
            policy: policy.clone(),
        })
    }

    async fn put(&self, token: &UploadToken, key: &str, body: UploadBody) -> Result<(), StoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        token.authorize(key)?;
        let delay = *self.put_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failing = self.failing_puts.lock().unwrap().contains(key);
        if failing {
            return Err(StoreError::Backend(format!("upload failed: {}", key)));
        }
        let exists = self.objects.lock().unwrap().contains_key(key);
        if token.insert_only() && exists {
            return Err(StoreError::Exists(key.to_string()));
        }

        let data = match body {
            UploadBody::Empty => Vec::new(),
            UploadBody::Stream { mut reader, .. } => {
                let mut data = Vec::new();
                reader.read_to_end(&mut data).await?;
                data
            }
        };
        self.insert_object(key, &data, None);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory-store"
    }
}

/// 内存记录存储
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<String, i64>>,
    fail_reads: AtomicBool,
    pub puts: AtomicUsize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<i64>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            anyhow::bail!("record store unavailable");
        }
        Ok(self.records.read().await.get(key).copied())
    }

    async fn put(&self, key: &str, mod_time: i64) -> anyhow::Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.records.write().await.insert(key.to_string(), mod_time);
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
